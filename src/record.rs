//! Module that contains the webhook payload received from a Monnit gateway and the normalized
//! message published for every sensor reading in it.
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// An opaque JSON object. Only `sensorID` is ever looked at.
pub type JsonObject = Map<String, Value>;

#[derive(Deserialize, Debug, Default)]
/// Body of a webhook call: a batch of sensor readings relayed by one gateway.
pub struct InboundWebhook
{
    /// The sensor readings in the order the gateway sent them.
    #[serde(rename = "sensorMessages", default, deserialize_with = "null_as_empty")]
    pub sensor_messages: Vec<JsonObject>,
    /// Metadata of the relaying gateway, shared by all readings.
    #[serde(rename = "gatewayMessage", default)]
    pub gateway_message: Option<JsonObject>,
}

#[derive(Serialize, Debug, PartialEq)]
/// Struct representing a single sensor reading as it is published on MQTT.
pub struct NormalizedMessage<'a>
{
    /// The sensor reading, untouched.
    pub sensor_message: &'a JsonObject,
    /// The gateway metadata of the webhook the reading arrived in.
    pub gateway_message: Option<&'a JsonObject>,
    /// Server side receipt time of the webhook.
    pub time_received: &'a str,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<JsonObject>, D::Error>
    where D: Deserializer<'de>
{
    Ok(Option::<Vec<JsonObject>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Receipt timestamp in RFC 3339 UTC with second precision, e.g. `2019-07-01T12:30:00Z`.
pub fn time_received_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl InboundWebhook {
    /// Parses a raw request body.
    ///
    /// # Returns
    ///
    /// * `Ok(webhook)` - The body is a JSON object with the expected shape.
    ///
    /// * `Err(...)` - The body is not JSON, the top level is not an object or one of the known
    ///     keys holds a value of the wrong type.
    ///
    pub fn decode(body: &[u8]) -> Result<InboundWebhook, DecodeError> {
        Ok(serde_json::from_slice::<InboundWebhook>(body)?)
    }

    /// Builds one normalized message per sensor reading, preserving the input order.
    ///
    /// All messages share `time_received` and the gateway metadata.
    pub fn normalize<'a>(&'a self, time_received: &'a str) -> Vec<NormalizedMessage<'a>> {
        self.sensor_messages.iter()
            .map(|sensor_message| NormalizedMessage {
                sensor_message,
                gateway_message: self.gateway_message.as_ref(),
                time_received,
            })
            .collect()
    }
}

impl<'a> NormalizedMessage<'a> {
    /// UTF-8 JSON payload for the MQTT message.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

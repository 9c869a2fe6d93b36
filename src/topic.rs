//! Derives the publish topic of a sensor reading.
use serde_json::Value;

use crate::error::RouteError;
use crate::record::JsonObject;

/// Placeholder replaced by the sensor id of a reading.
pub const SENSOR_ID_PLACEHOLDER: &str = "<sensor_id>";

/// Topic template used if none is configured.
pub const DEFAULT_TOPIC_TEMPLATE: &str = "monnit-webhook-adapter/<sensor_id>";

/// Key of the sensor id inside a sensor reading.
const SENSOR_ID_KEY: &str = "sensorID";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Topic template, fixed for the lifetime of the process.
pub struct TopicTemplate(String);

impl TopicTemplate {
    pub fn new(template: impl Into<String>) -> TopicTemplate {
        TopicTemplate(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replaces every placeholder with `sensor_id`.
    pub fn route(&self, sensor_id: &str) -> String {
        self.0.replace(SENSOR_ID_PLACEHOLDER, sensor_id)
    }
}

impl Default for TopicTemplate {
    fn default() -> Self {
        TopicTemplate::new(DEFAULT_TOPIC_TEMPLATE)
    }
}

/// Extracts the sensor id of a reading; it has to be a JSON string.
pub fn sensor_id(sensor_message: &JsonObject) -> Result<&str, RouteError> {
    match sensor_message.get(SENSOR_ID_KEY) {
        Some(Value::String(id)) => Ok(id.as_str()),
        Some(other) => Err(RouteError::InvalidSensorId(json_type_name(other))),
        None => Err(RouteError::MissingSensorId),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

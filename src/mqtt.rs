extern crate paho_mqtt as mqtt;

use std::time;

use async_trait::async_trait;

use crate::config::PlatformParameters;
use crate::error::{PlatformError, PublishError};
use crate::platform::DeviceToken;

/// Port of the platform's MQTT broker over TLS.
pub const DEFAULT_MESSAGING_PORT: u16 = 1884;

/// Keep-alive interval of the MQTT session.
const KEEP_ALIVE: time::Duration = time::Duration::from_secs(30);

/// Timeout for establishing the MQTT session.
const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(30);

#[async_trait]
/// Publishes payloads on topics. Shared by all concurrent requests.
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: i32) -> Result<(), PublishError>;
}

/// Publisher backed by a single paho MQTT session.
pub struct MqttPublisher {
    client: mqtt::AsyncClient,
}

/// Whether the broker uri asks for a TLS connection.
pub fn uses_tls(server_uri: &str) -> bool {
    server_uri.starts_with("ssl://") || server_uri.starts_with("mqtts://")
}

/// MQTT client id used by the adapter.
pub fn client_id(device_name: &str) -> String {
    format!("webhookadapter_{}", device_name)
}

/// Server uri of the MQTT broker.
///
/// An explicit messaging url is used as is, `ssl://` is prepended if it has no scheme. Otherwise
/// the host of the platform url is used with [`DEFAULT_MESSAGING_PORT`].
pub fn server_uri(params: &PlatformParameters) -> Result<String, PlatformError> {
    if let Some(messaging_url) = &params.messaging_url {
        return match messaging_url.contains("://") {
            true => Ok(messaging_url.clone()),
            false => Ok(format!("ssl://{}", messaging_url)),
        };
    }

    let platform_url = reqwest::Url::parse(&params.platform_url)
        .map_err(|_| PlatformError::InvalidUrl(params.platform_url.clone()))?;
    match platform_url.host_str() {
        Some(host) => Ok(format!("ssl://{}:{}", host, DEFAULT_MESSAGING_PORT)),
        None => Err(PlatformError::InvalidUrl(params.platform_url.clone())),
    }
}

impl MqttPublisher {
    /// Opens the MQTT session authenticated with the device token.
    pub async fn connect(params: &PlatformParameters, token: &DeviceToken) -> Result<MqttPublisher, PlatformError> {
        let connection_string = server_uri(params)?;
        log::info!(target: "monnit_adapter::mqtt", "Connecting to mqtt broker: \'{}\'", connection_string);

        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(connection_string.as_str())
            .client_id(client_id(&params.device_name))
            .finalize();

        let client = mqtt::AsyncClient::new(create_opts)?;

        let mut connection_opts = mqtt::ConnectOptionsBuilder::new();
        connection_opts
            .keep_alive_interval(KEEP_ALIVE)
            .connect_timeout(CONNECT_TIMEOUT)
            .clean_session(true)
            .user_name(token.0.as_str())
            .password(params.system_key.as_str());

        if uses_tls(&connection_string) {
            let mut ssl_options = mqtt::SslOptionsBuilder::new();
            if let Some(ca_path) = &params.ca_path {
                ssl_options.trust_store(ca_path.as_str())?;
            }
            connection_opts.ssl_options(ssl_options.finalize());
        }

        let response = client.connect(connection_opts.finalize()).await?;
        if let Some(conn) = response.connect_response() {
            log::info!(target: "monnit_adapter::mqtt", "Mqtt client connected: \'{}\', session present: \'{}\'",
                       conn.server_uri, conn.session_present);
        }

        Ok(MqttPublisher { client })
    }

    pub async fn disconnect(&self) {
        match self.client.disconnect(None).await {
            Ok(_) => log::info!(target: "monnit_adapter::mqtt", "Disconnected from mqtt broker!"),
            Err(err) => log::error!(target: "monnit_adapter::mqtt", "Could not disconnect from mqtt broker: {}", err),
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: i32) -> Result<(), PublishError> {
        let message = mqtt::Message::new(topic, payload, qos);
        self.client.publish(message).await?;
        Ok(())
    }
}

//! Error types of the adapter.
//!
//! Startup failures end up in [`AdapterError`] and terminate the process with a distinct exit
//! code. All other errors are absorbed and logged where they happen; the webhook caller never
//! sees them.
use thiserror::Error;

/// Exit code for invalid or incomplete configuration.
pub const EXIT_CONFIGURATION: i32 = 1;
/// Exit code for a rejected device authentication.
pub const EXIT_AUTHENTICATION: i32 = 2;
/// Exit code for a failed MQTT session setup.
pub const EXIT_MQTT: i32 = 3;
/// Exit code for a listener that could not be started.
pub const EXIT_LISTENER: i32 = 4;
/// Exit code for a logger that could not be created.
pub const EXIT_LOGGER: i32 = 100;

#[derive(Debug, Error)]
/// Problems found while assembling the startup configuration.
pub enum ConfigError {
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingRequired(Vec<&'static str>),

    #[error("receiverPort must be numeric and between 1 and 65535, got '{0}'")]
    InvalidPort(String),

    #[error("maxBodyBytes must be a positive number, got '{0}'")]
    InvalidBodyLimit(String),

    #[error("tlsCertPath and tlsKeyPath are required if TLS is enabled")]
    IncompleteTls,

    #[error("cannot read configuration file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot deserialize configuration file '{path}': {source}")]
    ParseFile {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
/// Failures while talking to the platform during startup.
pub enum PlatformError {
    #[error("invalid platform url '{0}'")]
    InvalidUrl(String),

    #[error("authentication request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("authentication rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("authentication response did not contain a device token")]
    MissingToken,

    #[error("mqtt session could not be established: {0}")]
    Mqtt(#[from] paho_mqtt::Error),
}

#[derive(Debug, Error)]
/// A request body that is not a webhook payload.
pub enum DecodeError {
    #[error("unexpected JSON from monnit webhook: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
/// A sensor entry that cannot be mapped to a topic.
pub enum RouteError {
    #[error("sensor entry has no sensorID")]
    MissingSensorId,

    #[error("sensorID must be a string, got {0}")]
    InvalidSensorId(&'static str),
}

#[derive(Debug, Error)]
/// A single failed publish.
pub enum PublishError {
    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] paho_mqtt::Error),
}

#[derive(Debug, Error)]
/// Failures of the HTTP listener.
pub enum ListenerError {
    #[error("invalid listen address '{0}'")]
    Address(String),

    #[error("cannot set up TLS acceptor: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("cannot create https acceptor: {0}")]
    Acceptor(String),

    #[error("cannot install termination handler: {0}")]
    Signal(ctrlc::Error),

    #[error("http server failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// Every error that stops the adapter.
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl AdapterError {
    /// The process exit code belonging to this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AdapterError::Config(_) => EXIT_CONFIGURATION,
            AdapterError::Platform(PlatformError::Mqtt(_)) => EXIT_MQTT,
            AdapterError::Platform(_) => EXIT_AUTHENTICATION,
            AdapterError::Listener(_) => EXIT_LISTENER,
        }
    }
}

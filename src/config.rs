//! Module assembling the adapter configuration from the optional configuration file and the
//! command line.
//!
//! Command line flags win over the file. The result is validated once at startup and stays
//! immutable afterwards.
use std::fs::File;
use std::io::Read;

use clap::ArgMatches;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::topic::{TopicTemplate, DEFAULT_TOPIC_TEMPLATE};

/// Listen address used if none is configured.
pub const DEFAULT_RECEIVER_ADDRESS: &str = "0.0.0.0";

/// Largest accepted webhook body if no limit is configured.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct modeling the parameters required to authenticate with the platform and open the MQTT
/// session.
pub struct PlatformParameters
{
    /// The system key of the platform system.
    pub system_key: String,
    /// The system secret of the platform system.
    pub system_secret: String,
    /// Base url of the platform, e.g. `https://platform.clearblade.com`.
    pub platform_url: String,
    /// Optional MQTT broker address, derived from `platform_url` if missing.
    pub messaging_url: Option<String>,
    /// Name of the device the adapter authenticates as.
    pub device_name: String,
    /// Active key (password) of the device.
    pub active_key: String,
    /// Optional CA certificate file to verify the MQTT broker with.
    pub ca_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Parameters of the HTTP listener receiving the webhooks.
pub struct ReceiverParameters
{
    /// The ip address the listener binds to.
    pub address: String,
    /// The port the listener binds to.
    pub port: u16,
    /// Optional TLS parameters, the listener serves HTTPS if present.
    pub tls_params: Option<ReceiverTlsParams>,
    /// Upper bound for the size of a webhook body.
    pub max_body_bytes: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// TLS parameters of the HTTP listener.
pub struct ReceiverTlsParams {
    /// The path to the PEM certificate chain.
    pub cert_path: String,
    /// The path to the PEM private key.
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq)]
/// The validated configuration of the adapter.
pub struct AdapterConfiguration {
    pub platform: PlatformParameters,
    pub receiver: ReceiverParameters,
    pub topic_template: TopicTemplate,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
/// Configuration file contents. Every value is optional, missing ones can be given as flags.
pub struct ConfigurationFile {
    pub platform: PlatformSection,
    pub receiver: ReceiverSection,
    pub topic_name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct PlatformSection {
    pub system_key: Option<String>,
    pub system_secret: Option<String>,
    pub platform_url: Option<String>,
    pub messaging_url: Option<String>,
    pub device_name: Option<String>,
    pub active_key: Option<String>,
    pub ca_path: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ReceiverSection {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub tls_enable: Option<bool>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub max_body_bytes: Option<usize>,
}

impl ConfigurationFile {
    /// Reads and deserializes a YAML configuration file.
    pub fn load(path: &str) -> Result<ConfigurationFile, ConfigError> {
        let mut configuration_string = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut configuration_string))
            .map_err(|source| ConfigError::ReadFile { path: path.to_string(), source })?;

        ConfigurationFile::parse(&configuration_string)
            .map_err(|source| ConfigError::ParseFile { path: path.to_string(), source })
    }

    fn parse(contents: &str) -> Result<ConfigurationFile, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(ConfigurationFile::default());
        }
        serde_yaml::from_str::<ConfigurationFile>(contents)
    }

    /// Overrides file values with the flags given on the command line.
    pub fn apply_flags(&mut self, matches: &ArgMatches) -> Result<(), ConfigError> {
        let platform = &mut self.platform;
        override_with(&mut platform.system_key, matches, "systemKey");
        override_with(&mut platform.system_secret, matches, "systemSecret");
        override_with(&mut platform.platform_url, matches, "platformURL");
        override_with(&mut platform.messaging_url, matches, "messagingURL");
        override_with(&mut platform.device_name, matches, "deviceName");
        override_with(&mut platform.active_key, matches, "activeKey");
        override_with(&mut platform.ca_path, matches, "caPath");

        let receiver = &mut self.receiver;
        override_with(&mut receiver.address, matches, "receiverAddress");
        override_with(&mut receiver.tls_cert_path, matches, "tlsCertPath");
        override_with(&mut receiver.tls_key_path, matches, "tlsKeyPath");
        if matches.is_present("enableTLS") {
            receiver.tls_enable = Some(true);
        }
        if let Some(port) = flag(matches, "receiverPort") {
            receiver.port = Some(parse_port(port)?);
        }
        if let Some(limit) = flag(matches, "maxBodyBytes") {
            receiver.max_body_bytes = Some(match limit.parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => return Err(ConfigError::InvalidBodyLimit(limit.to_string())),
            });
        }

        override_with(&mut self.topic_name, matches, "topicName");
        Ok(())
    }

    /// Checks that every required value is present and builds the final configuration.
    pub fn validate(self) -> Result<AdapterConfiguration, ConfigError> {
        let mut missing = Vec::new();
        let mut required = |value: Option<String>, name: &'static str| {
            let value = value.filter(|v| !v.is_empty());
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };

        let system_key = required(self.platform.system_key, "systemKey");
        let system_secret = required(self.platform.system_secret, "systemSecret");
        let platform_url = required(self.platform.platform_url, "platformURL");
        let device_name = required(self.platform.device_name, "deviceName");
        let active_key = required(self.platform.active_key, "activeKey");
        if self.receiver.port.is_none() {
            missing.push("receiverPort");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing));
        }

        let port = match self.receiver.port {
            Some(0) => return Err(ConfigError::InvalidPort(String::from("0"))),
            Some(port) => port,
            None => return Err(ConfigError::MissingRequired(vec!["receiverPort"])),
        };

        let tls_params = match self.receiver.tls_enable.unwrap_or(false) {
            true => {
                match (non_empty(self.receiver.tls_cert_path), non_empty(self.receiver.tls_key_path)) {
                    (Some(cert_path), Some(key_path)) => Some(ReceiverTlsParams { cert_path, key_path }),
                    _ => return Err(ConfigError::IncompleteTls),
                }
            }
            false => None,
        };

        let max_body_bytes = match self.receiver.max_body_bytes {
            Some(0) => return Err(ConfigError::InvalidBodyLimit(String::from("0"))),
            Some(limit) => limit,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(AdapterConfiguration {
            platform: PlatformParameters {
                system_key,
                system_secret,
                platform_url,
                messaging_url: non_empty(self.platform.messaging_url),
                device_name,
                active_key,
                ca_path: non_empty(self.platform.ca_path),
            },
            receiver: ReceiverParameters {
                address: non_empty(self.receiver.address)
                    .unwrap_or_else(|| DEFAULT_RECEIVER_ADDRESS.to_string()),
                port,
                tls_params,
                max_body_bytes,
            },
            topic_template: TopicTemplate::new(non_empty(self.topic_name)
                .unwrap_or_else(|| DEFAULT_TOPIC_TEMPLATE.to_string())),
        })
    }
}

impl AdapterConfiguration {
    /// Builds the configuration from the parsed command line, loading `--config` first if given.
    pub fn from_matches(matches: &ArgMatches) -> Result<AdapterConfiguration, ConfigError> {
        let mut file = match matches.value_of("config") {
            Some(path) => ConfigurationFile::load(path)?,
            None => ConfigurationFile::default(),
        };
        file.apply_flags(matches)?;
        file.validate()
    }
}

fn flag<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a str> {
    matches.value_of(name).filter(|value| !value.is_empty())
}

fn override_with(target: &mut Option<String>, matches: &ArgMatches, name: &str) {
    if let Some(value) = flag(matches, name) {
        *target = Some(value.to_string());
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_port(port: &str) -> Result<u16, ConfigError> {
    match port.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(port.to_string())),
    }
}

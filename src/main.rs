extern crate chrono;
extern crate serde_json;
extern crate log;
extern crate log4rs;
extern crate ctrlc;
extern crate clap;

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, ArgMatches};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::AdapterConfiguration;
use crate::error::{AdapterError, ListenerError, EXIT_LOGGER};
use crate::listener::AdapterState;
use crate::mqtt::MqttPublisher;

mod config;
mod error;
mod listener;
mod mqtt;
mod platform;
mod record;
mod topic;

/// Time in-flight webhooks get to finish after a termination signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const CONSOLE_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}{n}";

/// Sets up log4rs from `--logConfig`, or a console logger at `--logLevel`.
fn init_logging(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(log_config) = matches.value_of("logConfig") {
        log4rs::init_file(log_config, Default::default())?;
        return Ok(());
    }

    let level = matches.value_of("logLevel").unwrap_or("info").parse::<LevelFilter>()?;
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Authenticates, opens the MQTT session and serves webhooks until a termination signal arrives.
async fn run(configuration: AdapterConfiguration) -> Result<(), AdapterError> {
    let token = platform::authenticate_device(&configuration.platform).await?;
    let publisher = Arc::new(MqttPublisher::connect(&configuration.platform, &token).await?);

    log::info!(target: "monnit_adapter", "MQTT connected and adapter about to listen on port: {}", configuration.receiver.port);
    log::info!(target: "monnit_adapter", "Publishing sensor messages on \'{}\'", configuration.topic_template.as_str());

    let state = AdapterState::new(
        publisher.clone(),
        configuration.topic_template.clone(),
        configuration.receiver.max_body_bytes,
    );

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let served = match ctrlc::set_handler(move || {
        log::info!(target: "monnit_adapter", "Termination signal received!");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    }) {
        Ok(_) => listener::serve(&configuration.receiver, state, handle).await,
        Err(err) => Err(ListenerError::Signal(err)),
    };

    publisher.disconnect().await;
    served.map_err(AdapterError::from)
}

#[tokio::main]
async fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();

    match init_logging(&matches) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger: {}", err);
            exit(EXIT_LOGGER);
        }
    };

    let configuration = match AdapterConfiguration::from_matches(&matches) {
        Ok(configuration) => configuration,
        Err(err) => {
            let err = AdapterError::from(err);
            log::error!(target: "monnit_adapter", "{}", err);
            eprintln!("{}", matches.usage());
            exit(err.exit_code());
        }
    };

    match run(configuration).await {
        Ok(_) => {
            log::info!(target: "monnit_adapter", "Exiting");
            exit(0);
        }
        Err(err) => {
            log::error!(target: "monnit_adapter", "{}", err);
            exit(err.exit_code());
        }
    }
}

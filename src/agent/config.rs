use {
    super::{
        database,
        kafka,
        metrics,
        price_store,
        state,
    },
    anyhow::Result,
    config as config_rs,
    config_rs::{
        Environment,
        File,
    },
    serde::Deserialize,
    std::{
        path::Path,
        time::Duration,
    },
};

/// Configuration for all components of the Agent
#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub main_coins:     state::main_coins::Config,
    pub database:       database::Config,
    pub redis:          price_store::redis::Config,
    pub kafka:          kafka::Config,
    #[serde(default)]
    pub metrics_server: metrics::Config,
    pub opentelemetry:  Option<OpenTelemetryConfig>,
}

impl Config {
    pub fn new(config_file: impl AsRef<Path>) -> Result<Self> {
        Self::load(config_file, environment())
    }

    fn load(config_file: impl AsRef<Path>, environment: Environment) -> Result<Self> {
        config_rs::Config::builder()
            .add_source(File::from(config_file.as_ref()))
            .add_source(environment)
            .build()?
            .try_deserialize()
            .map_err(|e| e.into())
    }
}

/// "AGENT_"-prefixed environment variables override the config file, e.g.
/// AGENT_KAFKA__CONSUMER_GROUP_ID. List settings take comma-separated values, e.g.
/// AGENT_KAFKA__BROKERS=b1:9092,b2:9092.
fn environment() -> Environment {
    Environment::with_prefix("agent")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("kafka.brokers")
        .with_list_parse_key("kafka.topics")
}

#[derive(Deserialize, Debug)]
pub struct OpenTelemetryConfig {
    #[serde(with = "humantime_serde")]
    pub exporter_timeout_duration: Duration,
    pub exporter_endpoint:         String,
}

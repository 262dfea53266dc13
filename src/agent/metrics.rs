use {
    crate::agent::coin::NetworkId,
    lazy_static::lazy_static,
    prometheus_client::{
        encoding::{
            EncodeLabelSet,
            EncodeLabelValue,
            text::encode,
        },
        metrics::{
            counter::Counter,
            family::Family,
            gauge::Gauge,
        },
        registry::Registry,
    },
    serde::Deserialize,
    std::{
        collections::HashMap,
        net::SocketAddr,
    },
    tokio::sync::Mutex,
    warp::{
        Filter,
        hyper::StatusCode,
        reply,
    },
};

pub fn default_bind_address() -> SocketAddr {
    "127.0.0.1:8888"
        .parse()
        .expect("INTERNAL: Could not build default metrics server bind address")
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub bind_address: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

lazy_static! {
    pub static ref PROMETHEUS_REGISTRY: Mutex<Registry> = Mutex::new(<Registry>::default());
}

/// Serves the contents of `PROMETHEUS_REGISTRY` on `GET /metrics` until `EXIT` fires.
pub async fn spawn_server(config: Config) {
    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .then(|| async move {
            let registry = PROMETHEUS_REGISTRY.lock().await;
            let mut buf = String::new();
            match encode(&mut buf, &registry) {
                Ok(()) => reply::with_status(buf, StatusCode::OK),
                Err(err) => {
                    tracing::error!(err = ?err, "Metrics: Could not encode registry.");
                    reply::with_status(
                        "Could not encode metrics".to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            }
        });

    let (_, serve) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(config.bind_address, async {
            let _ = crate::agent::EXIT.subscribe().changed().await;
        });

    tracing::info!(bind_address = ?config.bind_address, "Starting metrics server.");
    serve.await
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub outcome: RefreshOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NetworkLabels {
    pub network: String,
}

/// Metrics for the main coins cache.
#[derive(Default)]
pub struct MainCoinsMetrics {
    /// Completed refresh passes by outcome
    refresh: Family<RefreshLabels, Counter>,
    /// Number of coins per network in the published snapshot
    coins:   Family<NetworkLabels, Gauge>,
}

impl MainCoinsMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "main_coins_refresh",
            "Main coins cache refresh passes by outcome",
            metrics.refresh.clone(),
        );
        registry.register(
            "main_coins",
            "Number of main coins per network in the cache",
            metrics.coins.clone(),
        );

        metrics
    }

    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        self.refresh.get_or_create(&RefreshLabels { outcome }).inc();
    }

    pub fn record_snapshot(&self, counts: &HashMap<NetworkId, usize>) {
        // Networks missing from the new snapshot must not keep their old value.
        self.coins.clear();
        for (network, count) in counts {
            self.coins
                .get_or_create(&NetworkLabels {
                    network: network.to_string(),
                })
                .set(*count as i64);
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MessageOutcome {
    Stored,
    Empty,
    Malformed,
    StoreFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    pub outcome: MessageOutcome,
}

/// Metrics for the price ingestion path.
#[derive(Default)]
pub struct IngestionMetrics {
    /// Handled price update messages by outcome
    messages:       Family<MessageLabels, Counter>,
    /// Price records forwarded to the price store
    prices_written: Counter,
}

impl IngestionMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "price_messages",
            "Price update messages handled by outcome",
            metrics.messages.clone(),
        );
        registry.register(
            "prices_written",
            "Price records written to the price store",
            metrics.prices_written.clone(),
        );

        metrics
    }

    pub fn record_message(&self, outcome: MessageOutcome) {
        self.messages.get_or_create(&MessageLabels { outcome }).inc();
    }

    pub fn record_prices_written(&self, count: usize) {
        self.prices_written.inc_by(count as u64);
    }

    #[cfg(test)]
    pub fn messages(&self, outcome: MessageOutcome) -> u64 {
        self.messages.get_or_create(&MessageLabels { outcome }).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_are_encoded() {
        let mut registry = Registry::default();
        let main_coins = MainCoinsMetrics::new(&mut registry);
        let ingestion = IngestionMetrics::new(&mut registry);

        main_coins.record_refresh(RefreshOutcome::Success);
        main_coins.record_snapshot(&HashMap::from([(1, 3)]));
        ingestion.record_message(MessageOutcome::Malformed);
        ingestion.record_prices_written(2);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();

        assert!(buf.contains(r#"main_coins_refresh_total{outcome="Success"} 1"#));
        assert!(buf.contains(r#"main_coins{network="1"} 3"#));
        assert!(buf.contains(r#"price_messages_total{outcome="Malformed"} 1"#));
        assert!(buf.contains("prices_written_total 2"));
    }

    #[test]
    fn test_snapshot_drops_vanished_networks() {
        let mut registry = Registry::default();
        let metrics = MainCoinsMetrics::new(&mut registry);

        metrics.record_snapshot(&HashMap::from([(1, 3), (2, 4)]));
        metrics.record_snapshot(&HashMap::from([(2, 5)]));

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();

        assert!(!buf.contains(r#"network="1""#));
        assert!(buf.contains(r#"main_coins{network="2"} 5"#));
    }

    #[test]
    fn test_config_defaults_and_clones() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bind_address, default_bind_address());

        let config: Config = serde_json::from_str(r#"{"bind_address":"0.0.0.0:9100"}"#).unwrap();
        let server_config = config.clone();
        assert_eq!(server_config.bind_address.port(), 9100);
        assert_eq!(server_config.bind_address, config.bind_address);
    }
}

/* ###################################################### System Architecture #######################################################

                         +--------------------+                          +--------------------+
                         |   Kafka brokers    |                          |   Bridge database  |
                         |  (price updates)   |                          |  (main coins table)|
                         +--------------------+                          +--------------------+
                                   |                                               |
                                   v                                               v
                         +--------------------+                          +--------------------+
                         |   Price Consumer   |                          | Main Coins Service |
                         |  (consumer group)  |                          |  (refresh ticker)  |
                         +--------------------+                          +--------------------+
                                   |                                               |
                                   v                                               v
                         +--------------------+                          +--------------------+
                         |    Price Store     |                          |  Main Coins Cache  |
                         |  (Redis hash)      |                          |  (in State)        |
                         +--------------------+                          +--------------------+
                                   |                                               |
                                   +----------------------+------------------------+
                                                          |
                                                          v
                                                 Request handlers (reads)

The arrows on the diagram above represent the direction of data flow.

Price path:
- The Price Consumer joins the consumer group and receives price update messages partition by partition.
- Each message is decoded into price records and written to the Price Store as one batch. Messages that
  cannot be decoded or stored are logged and acknowledged anyway, so a partition never stalls.
- The Price Store keeps only the latest price per (chain, token), shared by every instance of the service.

Main coins path:
- The Main Coins Service reads the whole main coins table page by page on every tick.
- A complete pass replaces the cached snapshot at once; a failed pass leaves the previous snapshot in place.
- Readers page through the current snapshot without touching the database.

The two paths are independent: there is no consistency between the cache and the Price Store beyond
each being eventually up to date.

################################################################################################################################## */

pub mod coin;
pub mod config;
pub mod database;
pub mod kafka;
pub mod metrics;
pub mod price_store;
pub mod services;
pub mod state;

use {
    self::{
        config::Config,
        database::{
            CoinSource,
            PgCoinSource,
        },
        kafka::KafkaConsumerGroup,
        metrics::PROMETHEUS_REGISTRY,
        price_store::{
            PriceStore,
            RedisHash,
            RedisPriceStore,
        },
        services::price_consumer::{
            PriceConsumer,
            PriceUpdateHandler,
        },
    },
    anyhow::{
        Context,
        Result,
    },
    futures_util::future::join_all,
    lazy_static::lazy_static,
    std::sync::Arc,
    tokio::sync::watch,
};

lazy_static! {
    /// A static exit flag to indicate to running threads that we're shutting down. This is used to
    /// gracefully shut down the application.
    ///
    /// We make this global based on the fact the:
    /// - The `Sender` side does not rely on any async runtime.
    /// - Exit logic doesn't really require carefully threading this value through the app.
    /// - The `Receiver` side of a watch channel performs the detection based on if the change
    ///   happened after the subscribe, so it means all listeners should always be notified
    ///   correctly.
    pub static ref EXIT: watch::Sender<bool> = watch::channel(false).0;
}

pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Agent { config }
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            consumer_group = %self.config.kafka.consumer_group_id,
            topics = ?self.config.kafka.topics,
            "Starting agent.",
        );
        self.spawn().await
    }

    async fn spawn(&self) -> Result<()> {
        // Collaborators are built up front so configuration errors stop the agent before
        // any task starts.
        let coin_source: Arc<dyn CoinSource> = Arc::new(
            PgCoinSource::new(&self.config.database).context("failed to set up database")?,
        );
        let price_store: Arc<dyn PriceStore> = Arc::new(RedisPriceStore::new(
            RedisHash::new(&self.config.redis).context("failed to set up redis")?,
        ));
        let consumer_group = KafkaConsumerGroup::new(&self.config.kafka)
            .context("failed to set up kafka consumer")?;

        let state = Arc::new(state::State::new(&self.config).await);
        let handler = {
            let registry = &mut *PROMETHEUS_REGISTRY.lock().await;
            PriceUpdateHandler::new(price_store, registry)
        };

        // A vector to store all the join handles for spawned tasks.
        let mut jhs = vec![];

        // Flip the exit flag on Ctrl-C so every task winds down.
        jhs.push(tokio::spawn(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(err = ?err, "Failed to listen for shutdown signal.");
                return;
            }
            tracing::info!("Shut-down signal received, stopping services.");
            EXIT.send_replace(true);
        }));

        jhs.push(tokio::spawn(services::main_coins(
            state.clone(),
            coin_source,
        )));

        jhs.push(tokio::spawn(services::price_consumer(PriceConsumer::new(
            consumer_group,
            handler,
        ))));

        jhs.push(tokio::spawn(metrics::spawn_server(
            self.config.metrics_server.clone(),
        )));

        // Wait for all tasks to complete
        join_all(jhs).await;

        Ok(())
    }
}

//! Price Consumer
//!
//! The Price Consumer is responsible for moving price updates from the consumer group
//! into the price store. Every message is acknowledged once handled, so one bad message
//! never stalls its partition; redelivered messages overwrite the same keys again.

use {
    crate::agent::{
        coin::SymbolPrice,
        kafka::{
            ConsumerError,
            ConsumerGroup,
            InboundMessage,
            MessageHandler,
            exit_requested,
        },
        metrics::{
            IngestionMetrics,
            MessageOutcome,
        },
        price_store::PriceStore,
    },
    anyhow::{
        Context,
        Result,
    },
    prometheus_client::registry::Registry,
    serde::Deserialize,
    std::sync::Arc,
    tokio::sync::watch,
    tracing::instrument,
};

/// Payload of a price update message: one record or a batch of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum PriceUpdate {
    Batch(Vec<Option<SymbolPrice>>),
    Single(SymbolPrice),
}

impl From<PriceUpdate> for Vec<Option<SymbolPrice>> {
    fn from(update: PriceUpdate) -> Self {
        match update {
            PriceUpdate::Batch(prices) => prices,
            PriceUpdate::Single(price) => vec![Some(price)],
        }
    }
}

pub struct PriceUpdateHandler {
    store:   Arc<dyn PriceStore>,
    metrics: IngestionMetrics,
}

impl PriceUpdateHandler {
    pub fn new(store: Arc<dyn PriceStore>, registry: &mut Registry) -> Self {
        Self {
            store,
            metrics: IngestionMetrics::new(registry),
        }
    }

    async fn handle_price_update(&self, message: &InboundMessage) -> MessageOutcome {
        let prices: Vec<Option<SymbolPrice>> =
            match serde_json::from_slice::<PriceUpdate>(&message.payload) {
                Ok(update) => update.into(),
                Err(err) => {
                    tracing::warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        err = ?err,
                        "Price consumer: skipping undecodable message.",
                    );
                    return MessageOutcome::Malformed;
                }
            };

        let count = prices.iter().flatten().count();
        if count == 0 {
            return MessageOutcome::Empty;
        }

        match self.store.set_coin_price(&prices).await {
            Ok(()) => {
                self.metrics.record_prices_written(count);
                MessageOutcome::Stored
            }
            Err(err) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    err = ?err,
                    "Price consumer: failed to store prices.",
                );
                MessageOutcome::StoreFailed
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for PriceUpdateHandler {
    async fn handle(&self, message: &InboundMessage) {
        let outcome = self.handle_price_update(message).await;
        tracing::debug!(
            partition = message.partition,
            offset = message.offset,
            outcome = ?outcome,
            "Price consumer: handled message.",
        );
        self.metrics.record_message(outcome);
    }
}

/// Drives a consumer group, re-entering consumption after every rebalance.
pub struct PriceConsumer<G, H = PriceUpdateHandler> {
    group:   G,
    handler: H,
}

impl<G, H> PriceConsumer<G, H>
where
    G: ConsumerGroup,
    H: MessageHandler,
{
    pub fn new(group: G, handler: H) -> Self {
        Self { group, handler }
    }

    /// Consumes until the group is closed (`Ok`), the broker fails, or `exit` fires.
    pub async fn start(&self, mut exit: watch::Receiver<bool>) -> Result<()> {
        tracing::debug!("Starting price consumer.");
        loop {
            tracing::debug!("Entering consume.");
            match self.group.consume(&self.handler, &mut exit).await {
                Ok(()) => {}
                Err(ConsumerError::GroupClosed) => {
                    tracing::info!("Consumer group closed.");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(err = ?err, "Kafka consumer error.");
                    return Err(err).context("kafka consumer error");
                }
            }

            if exit_requested(&exit) {
                return Err(ConsumerError::Cancelled).context("kafka consumer stopped");
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.group.close().await
    }
}

#[instrument(skip(consumer))]
pub async fn price_consumer<G>(consumer: PriceConsumer<G>)
where
    G: ConsumerGroup + 'static,
{
    match consumer.start(crate::agent::EXIT.subscribe()).await {
        Ok(()) => tracing::info!("Price consumer finished."),
        Err(err) => match err.downcast_ref::<ConsumerError>() {
            Some(ConsumerError::Cancelled) => tracing::info!("Shutdown signal received."),
            _ => tracing::error!(err = ?err, "Price consumer exited unexpectedly."),
        },
    }

    if let Err(err) = consumer.close().await {
        tracing::error!(err = ?err, "Failed to close kafka consumer.");
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::agent::{
            coin::SymbolInfo,
            kafka::tests::{
                Generation,
                ScriptedConsumerGroup,
                message,
            },
            price_store::tests::{
                InMemoryPriceStore,
                in_memory_store,
                price,
            },
        },
        rdkafka::error::{
            KafkaError,
            RDKafkaErrorCode,
        },
        std::time::Duration,
    };

    fn handler(store: &Arc<InMemoryPriceStore>) -> PriceUpdateHandler {
        PriceUpdateHandler::new(store.clone(), &mut Registry::default())
    }

    async fn stored_price(store: &InMemoryPriceStore, chain_id: u64, address: &str) -> SymbolPrice {
        store
            .get_coin_price(&[Some(SymbolInfo::new(chain_id, address))])
            .await
            .unwrap()
            .remove(0)
    }

    async fn wait_processed(group: &ScriptedConsumerGroup, count: usize) {
        for _ in 0..200 {
            if group.processed().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("messages were not processed");
    }

    #[tokio::test]
    async fn test_handler_decodes_single_and_batch_payloads() {
        let store = Arc::new(in_memory_store());
        let handler = handler(&store);

        let outcome = handler
            .handle_price_update(&message(
                0,
                0,
                r#"{"chainId":"1","address":"0xAAA","price":100.5}"#,
            ))
            .await;
        assert_eq!(outcome, MessageOutcome::Stored);

        let outcome = handler
            .handle_price_update(&message(
                0,
                1,
                r#"[{"chainId":1,"address":"0xBBB","price":2.0},null,{"chainId":5,"price":3.0}]"#,
            ))
            .await;
        assert_eq!(outcome, MessageOutcome::Stored);

        assert_eq!(stored_price(&store, 1, "0xAAA").await, price(1, "0xAAA", 100.5));
        assert_eq!(stored_price(&store, 1, "0xBBB").await, price(1, "0xBBB", 2.0));
        assert_eq!(stored_price(&store, 5, "").await, price(5, "", 3.0));
    }

    #[tokio::test]
    async fn test_handler_classifies_unusable_messages() {
        let store = Arc::new(in_memory_store());
        let handler = handler(&store);

        assert_eq!(
            handler.handle_price_update(&message(0, 0, "not json")).await,
            MessageOutcome::Malformed
        );
        assert_eq!(
            handler.handle_price_update(&message(0, 1, "")).await,
            MessageOutcome::Malformed
        );
        assert_eq!(
            handler.handle_price_update(&message(0, 2, "[]")).await,
            MessageOutcome::Empty
        );
        assert_eq!(
            handler.handle_price_update(&message(0, 3, "[null]")).await,
            MessageOutcome::Empty
        );
        assert_eq!(store.backend().writes(), 0);

        store.backend().set_failing(true);
        assert_eq!(
            handler
                .handle_price_update(&message(0, 4, r#"{"chainId":1,"price":1.0}"#))
                .await,
            MessageOutcome::StoreFailed
        );
    }

    #[tokio::test]
    async fn test_handler_rejects_unrelated_objects() {
        let store = Arc::new(in_memory_store());
        let handler = handler(&store);

        assert_eq!(
            handler
                .handle_price_update(&message(0, 0, r#"{"event":"heartbeat"}"#))
                .await,
            MessageOutcome::Malformed
        );
        assert_eq!(
            handler
                .handle_price_update(&message(0, 1, r#"{"chainId":1,"priceUsd":5}"#))
                .await,
            MessageOutcome::Malformed
        );
        assert_eq!(
            handler
                .handle_price_update(&message(
                    0,
                    2,
                    r#"[{"chainId":1,"price":1.0},{"event":"heartbeat"}]"#
                ))
                .await,
            MessageOutcome::Malformed
        );

        assert_eq!(store.backend().writes(), 0);
        assert!(stored_price(&store, 0, "").await.is_empty());
        assert!(stored_price(&store, 1, "").await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_block_claim() {
        let store = Arc::new(in_memory_store());
        let group = ScriptedConsumerGroup::new(vec![Generation::Deliver(vec![
            message(0, 10, "{broken"),
            message(0, 11, r#"{"chainId":1,"address":"0xAAA","price":7.0}"#),
        ])]);
        let consumer = Arc::new(PriceConsumer::new(group, handler(&store)));
        let (_exit_tx, exit_rx) = watch::channel(false);

        let jh = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start(exit_rx).await }
        });

        wait_processed(&consumer.group, 2).await;
        consumer.close().await.unwrap();
        jh.await.unwrap().unwrap();

        assert_eq!(consumer.group.processed(), vec![(0, 10), (0, 11)]);
        assert_eq!(stored_price(&store, 1, "0xAAA").await.price, 7.0);
        assert_eq!(consumer.handler.metrics.messages(MessageOutcome::Malformed), 1);
        assert_eq!(consumer.handler.metrics.messages(MessageOutcome::Stored), 1);
    }

    #[tokio::test]
    async fn test_store_failure_still_acknowledges() {
        let store = Arc::new(in_memory_store());
        store.backend().set_failing(true);
        let group = ScriptedConsumerGroup::new(vec![Generation::Deliver(vec![
            message(2, 0, r#"{"chainId":1,"price":1.0}"#),
            message(2, 1, r#"{"chainId":1,"price":2.0}"#),
        ])]);
        let consumer = Arc::new(PriceConsumer::new(group, handler(&store)));
        let (_exit_tx, exit_rx) = watch::channel(false);

        let jh = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start(exit_rx).await }
        });

        wait_processed(&consumer.group, 2).await;
        consumer.close().await.unwrap();
        jh.await.unwrap().unwrap();

        assert_eq!(consumer.group.processed(), vec![(2, 0), (2, 1)]);
        assert_eq!(consumer.handler.metrics.messages(MessageOutcome::StoreFailed), 2);
    }

    #[tokio::test]
    async fn test_consume_is_reentered_after_rebalance() {
        let store = Arc::new(in_memory_store());
        let group = ScriptedConsumerGroup::new(vec![
            Generation::Deliver(vec![message(
                0,
                0,
                r#"{"chainId":1,"address":"0xAAA","price":1.0}"#,
            )]),
            Generation::Deliver(vec![message(
                1,
                0,
                r#"{"chainId":1,"address":"0xAAA","price":2.0}"#,
            )]),
        ]);
        let consumer = Arc::new(PriceConsumer::new(group, handler(&store)));
        let (exit_tx, exit_rx) = watch::channel(false);

        let jh = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start(exit_rx).await }
        });

        wait_processed(&consumer.group, 2).await;
        // Both generations are done once the third consume call is waiting.
        for _ in 0..200 {
            if consumer.group.consumes() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        exit_tx.send_replace(true);
        let err = jh.await.unwrap().unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ConsumerError>(),
            Some(ConsumerError::Cancelled)
        ));
        assert_eq!(err.to_string(), "kafka consumer stopped");
        assert_eq!(consumer.group.consumes(), 3);
        assert_eq!(stored_price(&store, 1, "0xAAA").await.price, 2.0);
    }

    #[tokio::test]
    async fn test_closed_group_stops_cleanly() {
        let store = Arc::new(in_memory_store());
        let consumer = PriceConsumer::new(ScriptedConsumerGroup::new(vec![]), handler(&store));
        let (_exit_tx, exit_rx) = watch::channel(false);

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        assert!(consumer.start(exit_rx).await.is_ok());
        assert_eq!(consumer.group.consumes(), 1);
    }

    #[tokio::test]
    async fn test_broker_error_is_surfaced() {
        let store = Arc::new(in_memory_store());
        let consumer = PriceConsumer::new(
            ScriptedConsumerGroup::new(vec![Generation::Fail(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            ))]),
            handler(&store),
        );
        let (_exit_tx, exit_rx) = watch::channel(false);

        let err = consumer.start(exit_rx).await.unwrap_err();

        assert_eq!(err.to_string(), "kafka consumer error");
        assert!(matches!(
            err.downcast_ref::<ConsumerError>(),
            Some(ConsumerError::Kafka(_))
        ));
    }
}

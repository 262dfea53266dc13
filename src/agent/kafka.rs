//! Kafka
//!
//! Consumer group membership over the price update topics. A single `consume` call
//! covers one generation of partition assignment: it returns after the next rebalance
//! so the caller can re-enter it with the new assignment.

use {
    anyhow::{
        Context,
        Result,
        bail,
    },
    rdkafka::{
        ClientConfig,
        ClientContext,
        Message,
        consumer::{
            Consumer,
            ConsumerContext,
            Rebalance,
            StreamConsumer,
        },
        error::{
            KafkaError,
            RDKafkaErrorCode,
        },
        message::OwnedMessage,
    },
    serde::Deserialize,
    tokio::sync::{
        Notify,
        watch,
    },
};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Earliest,
    #[default]
    Latest,
}

impl InitialOffset {
    fn as_str(&self) -> &'static str {
        match self {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub brokers:           Vec<String>,
    pub consumer_group_id: String,
    pub topics:            Vec<String>,
    /// Where to start reading partitions that have no committed offset for the group
    #[serde(default)]
    pub initial_offset:    InitialOffset,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("consumer group closed")]
    GroupClosed,
    #[error("consumer cancelled")]
    Cancelled,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// A message delivered from one partition of a subscribed topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic:     String,
    pub partition: i32,
    pub offset:    i64,
    pub key:       Option<Vec<u8>>,
    pub payload:   Vec<u8>,
}

impl From<&OwnedMessage> for InboundMessage {
    fn from(message: &OwnedMessage) -> Self {
        InboundMessage {
            topic:     message.topic().to_string(),
            partition: message.partition(),
            offset:    message.offset(),
            key:       message.key().map(<[u8]>::to_vec),
            payload:   message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// Processes messages of a claim. Every message handed to `handle` is marked processed
/// once `handle` returns, whatever happened while handling it.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage);
}

#[async_trait::async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Consumes the current partition assignment, feeding messages to `handler` in log
    /// order per partition. Returns `Ok` after a rebalance or once `exit` fires, and
    /// `ConsumerError::GroupClosed` once the group has been closed.
    async fn consume(
        &self,
        handler: &dyn MessageHandler,
        exit: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError>;

    /// Leaves the group. Later `consume` calls return `ConsumerError::GroupClosed`.
    async fn close(&self) -> Result<()>;
}

/// True once shutdown was requested or nobody can request it any more.
pub fn exit_requested(exit: &watch::Receiver<bool>) -> bool {
    *exit.borrow() || exit.has_changed().is_err()
}

/// Wakes a running `consume` call after each completed rebalance.
#[derive(Default)]
pub struct GroupContext {
    rebalanced: Notify,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        tracing::info!(rebalance = ?rebalance, "Kafka: partition assignment changed.");
        self.rebalanced.notify_one();
    }
}

/// Partition-level access of a group member: the part of the client that a consume
/// generation drives.
#[async_trait::async_trait]
pub trait PartitionConsumer: Send + Sync {
    /// Waits for the next message of any assigned partition.
    async fn next_message(&self) -> Result<InboundMessage, KafkaError>;

    /// Stores the offset following `message` for the next commit.
    fn mark_processed(&self, message: &InboundMessage) -> Result<(), KafkaError>;

    /// Notified after each completed rebalance.
    fn rebalanced(&self) -> &Notify;

    fn leave(&self);
}

#[async_trait::async_trait]
impl PartitionConsumer for StreamConsumer<GroupContext> {
    async fn next_message(&self) -> Result<InboundMessage, KafkaError> {
        self.recv()
            .await
            .map(|message| InboundMessage::from(&message.detach()))
    }

    fn mark_processed(&self, message: &InboundMessage) -> Result<(), KafkaError> {
        Consumer::store_offset(self, &message.topic, message.partition, message.offset + 1)
    }

    fn rebalanced(&self) -> &Notify {
        &self.context().rebalanced
    }

    fn leave(&self) {
        Consumer::unsubscribe(self);
    }
}

/// Errors after which the client cannot be used any more. Everything else (broker
/// transport failures, leader changes, ...) is retried by the client itself.
fn is_fatal(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        None | Some(RDKafkaErrorCode::Fatal)
    )
}

/// Offsets of a partition can no longer be stored once it was revoked from this member.
fn is_revoked(err: &KafkaError) -> bool {
    err.rdkafka_error_code() == Some(RDKafkaErrorCode::State)
}

pub struct KafkaConsumerGroup<P = StreamConsumer<GroupContext>> {
    consumer: P,
    closed:   watch::Sender<bool>,
}

impl KafkaConsumerGroup {
    pub fn new(config: &Config) -> Result<Self> {
        if config.brokers.is_empty() {
            bail!("kafka brokers are empty");
        }
        if config.topics.is_empty() {
            bail!("kafka topics are empty");
        }
        if config.consumer_group_id.is_empty() {
            bail!("kafka consumer group id is empty");
        }

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.consumer_group_id)
            .set("auto.offset.reset", config.initial_offset.as_str())
            .set("enable.auto.commit", "true")
            // Offsets are stored explicitly once a message has been handled.
            .set("enable.auto.offset.store", "false")
            .create_with_context(GroupContext::default())
            .context("kafka consumer group init error")?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .context("kafka consumer group subscribe error")?;

        Ok(Self::with_consumer(consumer))
    }
}

impl<P: PartitionConsumer> KafkaConsumerGroup<P> {
    fn with_consumer(consumer: P) -> Self {
        Self {
            consumer,
            closed: watch::Sender::new(false),
        }
    }
}

#[async_trait::async_trait]
impl<P: PartitionConsumer> ConsumerGroup for KafkaConsumerGroup<P> {
    async fn consume(
        &self,
        handler: &dyn MessageHandler,
        exit: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ConsumerError::GroupClosed);
        }
        if exit_requested(exit) {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = exit.changed() => return Ok(()),
                _ = closed.changed() => return Err(ConsumerError::GroupClosed),
                _ = self.consumer.rebalanced().notified() => return Ok(()),
                message = self.consumer.next_message() => match message {
                    Ok(message) => {
                        handler.handle(&message).await;
                        match self.consumer.mark_processed(&message) {
                            Ok(()) => {}
                            // The next generation redelivers from the last stored offset.
                            Err(err) if is_revoked(&err) => {
                                tracing::info!(
                                    topic = %message.topic,
                                    partition = message.partition,
                                    offset = message.offset,
                                    "Kafka: partition revoked while handling message.",
                                );
                                return Ok(());
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Err(err) if is_fatal(&err) => return Err(err.into()),
                    Err(err) => {
                        tracing::warn!(err = ?err, "Kafka: consume error, continuing.");
                    }
                },
            }
        }
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("Closing kafka consumer.");
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.consumer.leave();
        Ok(())
    }
}

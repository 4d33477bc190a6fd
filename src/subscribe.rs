//! # Message Subscriber
//!
//! Attaches one consumer per configured queue on the shared connection and
//! funnels every delivery through the [`MessageDispatcher`]. The handling
//! result decides the acknowledgment:
//!
//! | result               | acknowledgment            |
//! |----------------------|---------------------------|
//! | `Succeeded`          | ack                       |
//! | `FailedNoRetry`      | reject without requeue    |
//! | `FailedRetryAllowed` | reject with requeue       |
//!
//! Acknowledgment failures are logged and swallowed: the broker redelivers
//! unsettled messages after the channel dies, and killing the consume loop
//! over one failed ack would drop every subsequent message with it.

use std::any::TypeId;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::connection::ConnectionManager;
use crate::dispatch::MessageDispatcher;
use crate::errors::{BrokerError, BrokerResult};
use crate::handling::HandlingResult;
use crate::serialization::BrokerMessage;
use crate::transport::{BrokerChannel, BrokerConnection, Delivery};

/// Binding of a queue to the message type its deliveries carry
#[derive(Clone)]
pub struct Subscription {
    queue: String,
    message_type: TypeId,
    type_name: &'static str,
    auto_ack: bool,
}

impl Subscription {
    /// The queue this subscription consumes from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fully-qualified name of the message type
    pub fn message_type_name(&self) -> &'static str {
        self.type_name
    }

    /// True when the transport settles deliveries on arrival
    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }
}

/// Validated set of queue subscriptions
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Start building a subscription set
    pub fn builder() -> SubscriptionSetBuilder {
        SubscriptionSetBuilder {
            subscriptions: Vec::new(),
        }
    }

    /// The configured subscriptions, in registration order
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }
}

/// Fluent builder for [`SubscriptionSet`]
pub struct SubscriptionSetBuilder {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSetBuilder {
    /// Consume deliveries of type `M` from a queue, settling each one from
    /// its handling result
    pub fn subscription<M: BrokerMessage>(self, queue: impl Into<String>) -> Self {
        self.push::<M>(queue.into(), false)
    }

    /// Consume deliveries of type `M` from a queue with transport-level
    /// auto-acknowledgment: at-most-once, failures are not redelivered
    pub fn subscription_with_auto_ack<M: BrokerMessage>(self, queue: impl Into<String>) -> Self {
        self.push::<M>(queue.into(), true)
    }

    fn push<M: BrokerMessage>(mut self, queue: String, auto_ack: bool) -> Self {
        self.subscriptions.push(Subscription {
            queue,
            message_type: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            auto_ack,
        });
        self
    }

    /// Validate and freeze the subscription set.
    ///
    /// Fails on an empty set or a blank queue name.
    pub fn build(self) -> BrokerResult<SubscriptionSet> {
        if self.subscriptions.is_empty() {
            return Err(BrokerError::configuration(
                "at least one subscription must be configured",
            ));
        }
        for subscription in &self.subscriptions {
            if subscription.queue.trim().is_empty() {
                return Err(BrokerError::configuration(format!(
                    "queue name must not be blank for message type {}",
                    subscription.type_name
                )));
            }
        }
        Ok(SubscriptionSet {
            subscriptions: self.subscriptions,
        })
    }
}

/// One running consumer: its channel, transport tag, and consume loop
struct ActiveConsumer {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

/// Consumes configured queues and settles each delivery from its dispatch
/// outcome.
///
/// Borrows the shared connection for the duration of a start/stop cycle and
/// leaves it open on [`MessageSubscriber::stop`]; connection teardown belongs
/// to the [`ConnectionManager`].
pub struct MessageSubscriber {
    dispatcher: Arc<MessageDispatcher>,
    subscriptions: SubscriptionSet,
    active: tokio::sync::Mutex<Option<Vec<ActiveConsumer>>>,
}

impl MessageSubscriber {
    /// Create a subscriber; no consumers attach until
    /// [`MessageSubscriber::start`]
    pub fn new(dispatcher: Arc<MessageDispatcher>, subscriptions: SubscriptionSet) -> Self {
        Self {
            dispatcher,
            subscriptions,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Attach one consumer per configured queue, each on its own channel.
    ///
    /// Fails if the subscriber is already started or any queue is missing.
    /// Consumers attached before the failure are detached again before the
    /// error is returned, so a partial start leaks nothing.
    pub async fn start(&self, connection_manager: &ConnectionManager) -> BrokerResult<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(BrokerError::configuration("subscriber is already started"));
        }

        let connection = connection_manager.get_connection().await?;

        let mut consumers = Vec::with_capacity(self.subscriptions.subscriptions.len());
        for subscription in &self.subscriptions.subscriptions {
            let channel = match connection.open_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    Self::teardown(consumers).await;
                    return Err(e);
                }
            };
            let handle = match channel
                .consume(&subscription.queue, subscription.auto_ack)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    Self::teardown(consumers).await;
                    return Err(e);
                }
            };

            tracing::info!(
                queue = %subscription.queue,
                message_type = subscription.type_name,
                consumer_tag = %handle.consumer_tag,
                auto_ack = subscription.auto_ack,
                "subscribed to queue"
            );

            let task = tokio::spawn(consume_loop(
                Arc::clone(&self.dispatcher),
                Arc::clone(&channel),
                subscription.clone(),
                handle.deliveries,
            ));
            consumers.push(ActiveConsumer {
                queue: subscription.queue.clone(),
                consumer_tag: handle.consumer_tag,
                channel,
                task,
            });
        }

        tracing::info!(queues = consumers.len(), "message subscriber started");
        *active = Some(consumers);
        Ok(())
    }

    /// Detach every consumer and wait for its consume loop to finish.
    ///
    /// Idempotent; the shared connection is left open.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(consumers) = active.take() else {
            return;
        };
        Self::teardown(consumers).await;
        tracing::info!("message subscriber stopped");
    }

    async fn teardown(consumers: Vec<ActiveConsumer>) {
        for consumer in consumers {
            if let Err(e) = consumer.channel.cancel(&consumer.consumer_tag).await {
                tracing::warn!(
                    queue = %consumer.queue,
                    consumer_tag = %consumer.consumer_tag,
                    error = %e,
                    "error cancelling consumer"
                );
            }
            if let Err(e) = consumer.channel.close().await {
                tracing::warn!(queue = %consumer.queue, error = %e, "error closing consumer channel");
            }
            // The delivery stream has ended, so the loop exits on its own.
            if let Err(e) = consumer.task.await {
                tracing::warn!(queue = %consumer.queue, error = %e, "consume loop ended abnormally");
            }
        }
    }

    /// True while consumers are attached
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn consume_loop(
    dispatcher: Arc<MessageDispatcher>,
    channel: Arc<dyn BrokerChannel>,
    subscription: Subscription,
    mut deliveries: BoxStream<'static, Delivery>,
) {
    while let Some(delivery) = deliveries.next().await {
        let delivery_tag = delivery.delivery_tag;
        let result = dispatcher
            .dispatch(delivery.body, subscription.message_type)
            .await;

        if let Some(reason) = result.fail_reason() {
            tracing::warn!(
                queue = %subscription.queue,
                message_type = subscription.type_name,
                redelivered = delivery.redelivered,
                reason,
                "message handling failed"
            );
        }

        if subscription.auto_ack {
            continue;
        }

        let settled = match &result {
            HandlingResult::Succeeded => channel.ack(delivery_tag).await,
            HandlingResult::FailedNoRetry { .. } => channel.reject(delivery_tag, false).await,
            HandlingResult::FailedRetryAllowed { .. } => channel.reject(delivery_tag, true).await,
        };
        if let Err(e) = settled {
            // Swallowed: the broker redelivers unsettled messages once the
            // channel goes away, while bailing out here would stall the queue.
            tracing::error!(
                queue = %subscription.queue,
                delivery_tag,
                error = %e,
                "failed to settle delivery"
            );
        }
    }

    tracing::debug!(queue = %subscription.queue, "consume loop ended");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::registry::{HandlerRegistry, MessageHandler};
    use crate::transport::in_memory::{InMemoryBroker, InMemoryTransport};

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct Telemetry {
        reading: i64,
    }

    struct RecordingHandler {
        received: Mutex<Vec<Telemetry>>,
    }

    #[async_trait]
    impl MessageHandler<Telemetry> for RecordingHandler {
        async fn handle(&self, message: Telemetry) -> HandlingResult {
            self.received.lock().push(message);
            HandlingResult::succeeded()
        }
    }

    struct PoisonHandler;

    #[async_trait]
    impl MessageHandler<Telemetry> for PoisonHandler {
        async fn handle(&self, _message: Telemetry) -> HandlingResult {
            HandlingResult::failed_no_retry_with("unprocessable")
        }
    }

    /// Fails with retry on the first attempt, succeeds afterwards
    struct FlakyHandler {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler<Telemetry> for FlakyHandler {
        async fn handle(&self, _message: Telemetry) -> HandlingResult {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                HandlingResult::failed_retry_allowed_with("downstream unavailable")
            } else {
                HandlingResult::succeeded()
            }
        }
    }

    fn dispatcher_for<H>(handler: Arc<H>) -> Arc<MessageDispatcher>
    where
        H: MessageHandler<Telemetry> + 'static,
    {
        let registry = HandlerRegistry::builder()
            .register::<Telemetry, _>(handler)
            .build()
            .unwrap();
        Arc::new(MessageDispatcher::new(registry))
    }

    fn harness(broker: &Arc<InMemoryBroker>) -> ConnectionManager {
        let transport = Arc::new(InMemoryTransport::new(Arc::clone(broker)));
        ConnectionManager::new(transport, ConnectionConfig::default())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[test]
    fn test_subscription_set_rejects_empty() {
        let result = SubscriptionSet::builder().build();
        assert!(matches!(result, Err(BrokerError::Configuration { .. })));
    }

    #[test]
    fn test_subscription_set_rejects_blank_queue() {
        let result = SubscriptionSet::builder()
            .subscription::<Telemetry>("")
            .build();
        let err = result.err().expect("blank queue must fail");
        assert!(format!("{err}").contains("Telemetry"));
    }

    #[tokio::test]
    async fn test_successful_handling_acks() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::clone(&handler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();
        assert!(subscriber.is_running().await);

        let connection = manager.get_connection().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let payload = serde_json::to_vec(&Telemetry { reading: 7 }).unwrap();
        channel.send("telemetry", &payload).await.unwrap();

        wait_until(|| broker.acked_count("telemetry") == 1).await;
        assert_eq!(
            handler.received.lock().as_slice(),
            &[Telemetry { reading: 7 }]
        );
        assert_eq!(broker.unacked_count(), 0);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_failed_no_retry_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::new(PoisonHandler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();

        let connection = manager.get_connection().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let payload = serde_json::to_vec(&Telemetry { reading: -1 }).unwrap();
        channel.send("telemetry", &payload).await.unwrap();

        wait_until(|| broker.dead_letter_count("telemetry") == 1).await;
        assert_eq!(broker.acked_count("telemetry"), 0);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_failed_retry_allowed_requeues_until_success() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let handler = Arc::new(FlakyHandler {
            attempts: AtomicUsize::new(0),
        });
        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::clone(&handler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();

        let connection = manager.get_connection().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let payload = serde_json::to_vec(&Telemetry { reading: 3 }).unwrap();
        channel.send("telemetry", &payload).await.unwrap();

        wait_until(|| broker.acked_count("telemetry") == 1).await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(broker.requeued_count("telemetry"), 1);
        assert_eq!(broker.dead_letter_count("telemetry"), 0);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_auto_ack_never_settles_explicitly() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::clone(&handler)),
            SubscriptionSet::builder()
                .subscription_with_auto_ack::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();

        let connection = manager.get_connection().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let payload = serde_json::to_vec(&Telemetry { reading: 9 }).unwrap();
        channel.send("telemetry", &payload).await.unwrap();

        wait_until(|| !handler.received.lock().is_empty()).await;
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked_count("telemetry"), 0);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::new(PoisonHandler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();

        let second = subscriber.start(&manager).await;
        assert!(matches!(second, Err(BrokerError::Configuration { .. })));

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_missing_queue() {
        let broker = InMemoryBroker::new();
        let manager = harness(&broker);

        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::new(PoisonHandler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        let result = subscriber.start(&manager).await;
        assert!(matches!(
            result,
            Err(BrokerError::DestinationNotFound { .. })
        ));
        assert!(!subscriber.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_leaves_connection_open() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("telemetry");
        let manager = harness(&broker);

        let subscriber = MessageSubscriber::new(
            dispatcher_for(Arc::new(PoisonHandler)),
            SubscriptionSet::builder()
                .subscription::<Telemetry>("telemetry")
                .build()
                .unwrap(),
        );
        subscriber.start(&manager).await.unwrap();
        subscriber.stop().await;
        subscriber.stop().await; // no-op
        assert!(!subscriber.is_running().await);

        // The shared connection still works after subscriber teardown.
        let connection = manager.get_connection().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.send("telemetry", b"{\"reading\":1}").await.unwrap();
        assert_eq!(broker.queue_length("telemetry"), 1);
    }
}

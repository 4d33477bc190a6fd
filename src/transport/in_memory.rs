//! # In-Memory Transport
//!
//! In-process broker implementation for testing and development. Named FIFO
//! queues hold payloads; consumers receive deliveries over an unbounded
//! channel; rejected-without-requeue messages land in a per-queue
//! dead-letter list.
//!
//! The broker also tracks per-queue counters (sends in flight, acks,
//! rejects) so tests can observe the concurrency and acknowledgment behavior
//! of the components built on top of it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::errors::{BrokerError, BrokerResult};
use crate::transport::{BrokerChannel, BrokerConnection, BrokerTransport, ConsumerHandle, Delivery};

/// A payload waiting in a queue
#[derive(Debug, Clone)]
struct QueuedPayload {
    body: Vec<u8>,
    redelivered: bool,
}

/// An active consumer attached to a queue
struct ConsumerSeat {
    tag: String,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// Per-queue storage and counters
#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedPayload>,
    consumers: Vec<ConsumerSeat>,
    dead_lettered: Vec<Vec<u8>>,
    active_sends: usize,
    max_concurrent_sends: usize,
    total_acked: u64,
    total_requeued: u64,
    total_dead_lettered: u64,
}

/// A delivered-but-unacknowledged message
struct PendingDelivery {
    queue_name: String,
    body: Vec<u8>,
}

#[derive(Default)]
struct SharedState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, PendingDelivery>,
    next_delivery_tag: u64,
}

/// Shared in-process broker state.
///
/// Destinations must be declared up front with
/// [`InMemoryBroker::declare_destination`]; passive checks and sends against
/// undeclared names fail, matching the real broker's behavior when topology
/// setup has not run.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<SharedState>,
}

impl InMemoryBroker {
    /// Create a new broker with no destinations
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare a destination (queue), idempotently
    pub fn declare_destination(&self, name: &str) {
        let mut state = self.state.lock();
        state.queues.entry(name.to_string()).or_default();
    }

    /// Number of messages currently waiting in a queue
    pub fn queue_length(&self, name: &str) -> usize {
        let state = self.state.lock();
        state.queues.get(name).map_or(0, |q| q.messages.len())
    }

    /// Number of messages dead-lettered from a queue
    pub fn dead_letter_count(&self, name: &str) -> usize {
        let state = self.state.lock();
        state.queues.get(name).map_or(0, |q| q.dead_lettered.len())
    }

    /// Highest number of sends observed in flight at once for a queue
    pub fn max_concurrent_sends(&self, name: &str) -> usize {
        let state = self.state.lock();
        state
            .queues
            .get(name)
            .map_or(0, |q| q.max_concurrent_sends)
    }

    /// Total acknowledged deliveries for a queue
    pub fn acked_count(&self, name: &str) -> u64 {
        let state = self.state.lock();
        state.queues.get(name).map_or(0, |q| q.total_acked)
    }

    /// Total requeued (rejected with requeue) deliveries for a queue
    pub fn requeued_count(&self, name: &str) -> u64 {
        let state = self.state.lock();
        state.queues.get(name).map_or(0, |q| q.total_requeued)
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    fn check_destination(&self, name: &str) -> BrokerResult<()> {
        let state = self.state.lock();
        if state.queues.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::destination_not_found(name))
        }
    }

    async fn publish(&self, destination: &str, body: Vec<u8>) -> BrokerResult<()> {
        {
            let mut state = self.state.lock();
            let queue = state
                .queues
                .get_mut(destination)
                .ok_or_else(|| BrokerError::destination_not_found(destination))?;
            queue.active_sends += 1;
            queue.max_concurrent_sends = queue.max_concurrent_sends.max(queue.active_sends);
        }

        // Suspension point: lets overlapping senders on the same queue be
        // observed by max_concurrent_sends.
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        let payload = QueuedPayload {
            body,
            redelivered: false,
        };
        Self::deliver_or_enqueue(&mut state, destination, payload);
        if let Some(queue) = state.queues.get_mut(destination) {
            queue.active_sends -= 1;
        }
        Ok(())
    }

    /// Hand the payload to an attached consumer, or park it in the queue.
    fn deliver_or_enqueue(state: &mut SharedState, queue_name: &str, payload: QueuedPayload) {
        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;

        let SharedState {
            queues, unacked, ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        let mut undeliverable = Some(payload);
        // Consumers whose receiver is gone are pruned as we go.
        queue.consumers.retain(|seat| {
            let Some(payload) = undeliverable.take() else {
                return true;
            };
            let delivery = Delivery {
                body: payload.body.clone(),
                delivery_tag: tag,
                redelivered: payload.redelivered,
            };
            match seat.sender.unbounded_send(delivery) {
                Ok(()) => {
                    if !seat.auto_ack {
                        unacked.insert(
                            tag,
                            PendingDelivery {
                                queue_name: queue_name.to_string(),
                                body: payload.body,
                            },
                        );
                    }
                    true
                }
                Err(_) => {
                    undeliverable = Some(payload);
                    false
                }
            }
        });

        if let Some(payload) = undeliverable {
            queue.messages.push_back(payload);
        }
    }

    fn start_consumer(
        &self,
        queue_name: &str,
        auto_ack: bool,
    ) -> BrokerResult<(String, mpsc::UnboundedReceiver<Delivery>)> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue_name) {
            return Err(BrokerError::destination_not_found(queue_name));
        }

        let (sender, receiver) = mpsc::unbounded();
        let tag = format!("ctag-{}", Uuid::new_v4());

        // Drain the backlog to the new consumer before attaching it.
        let backlog: Vec<QueuedPayload> = state
            .queues
            .get_mut(queue_name)
            .map(|q| q.messages.drain(..).collect())
            .unwrap_or_default();
        for payload in backlog {
            state.next_delivery_tag += 1;
            let delivery_tag = state.next_delivery_tag;
            let delivery = Delivery {
                body: payload.body.clone(),
                delivery_tag,
                redelivered: payload.redelivered,
            };
            if sender.unbounded_send(delivery).is_ok() && !auto_ack {
                state.unacked.insert(
                    delivery_tag,
                    PendingDelivery {
                        queue_name: queue_name.to_string(),
                        body: payload.body,
                    },
                );
            }
        }

        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.consumers.push(ConsumerSeat {
                tag: tag.clone(),
                auto_ack,
                sender,
            });
        }

        Ok((tag, receiver))
    }

    fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let pending = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::internal(format!("unknown delivery tag {delivery_tag}")))?;
        if let Some(queue) = state.queues.get_mut(&pending.queue_name) {
            queue.total_acked += 1;
        }
        Ok(())
    }

    fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let pending = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::internal(format!("unknown delivery tag {delivery_tag}")))?;

        if requeue {
            if let Some(queue) = state.queues.get_mut(&pending.queue_name) {
                queue.total_requeued += 1;
            }
            let payload = QueuedPayload {
                body: pending.body,
                redelivered: true,
            };
            Self::deliver_or_enqueue(&mut state, &pending.queue_name, payload);
        } else if let Some(queue) = state.queues.get_mut(&pending.queue_name) {
            queue.total_dead_lettered += 1;
            queue.dead_lettered.push(pending.body);
        }
        Ok(())
    }

    fn cancel_consumer(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|seat| seat.tag != consumer_tag);
            if queue.consumers.len() < before {
                return Ok(());
            }
        }
        Err(BrokerError::internal(format!(
            "unknown consumer tag {consumer_tag}"
        )))
    }

    fn drop_consumers(&self, consumer_tags: &[String]) {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|seat| !consumer_tags.contains(&seat.tag));
        }
    }
}

/// In-memory implementation of [`BrokerTransport`].
///
/// Tracks connect attempts and can be told to fail the next N attempts,
/// which lets tests exercise the connection manager's retry-after-failure
/// behavior.
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    connect_attempts: AtomicUsize,
    failures_to_inject: AtomicUsize,
}

impl InMemoryTransport {
    /// Create a transport backed by the given broker state
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            connect_attempts: AtomicUsize::new(0),
            failures_to_inject: AtomicUsize::new(0),
        }
    }

    /// Number of connect attempts observed so far
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.failures_to_inject.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn connect(&self, _config: &ConnectionConfig) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_to_inject.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_to_inject.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::connection("injected connection failure"));
        }

        Ok(Arc::new(InMemoryConnection {
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
        }))
    }
}

/// In-memory implementation of [`BrokerConnection`]
pub struct InMemoryConnection {
    broker: Arc<InMemoryBroker>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("connection"));
        }
        Ok(Arc::new(InMemoryChannel {
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
            consumer_tags: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory implementation of [`BrokerChannel`]
pub struct InMemoryChannel {
    broker: Arc<InMemoryBroker>,
    closed: AtomicBool,
    consumer_tags: Mutex<Vec<String>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::closed("channel"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn check_destination(&self, destination: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.check_destination(destination)
    }

    async fn send(&self, destination: &str, payload: &[u8]) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.publish(destination, payload.to_vec()).await
    }

    async fn consume(&self, queue_name: &str, auto_ack: bool) -> BrokerResult<ConsumerHandle> {
        self.ensure_open()?;
        let (consumer_tag, receiver) = self.broker.start_consumer(queue_name, auto_ack)?;
        self.consumer_tags.lock().push(consumer_tag.clone());
        Ok(ConsumerHandle {
            consumer_tag,
            deliveries: receiver.boxed(),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.ack(delivery_tag)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.reject(delivery_tag, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.consumer_tags.lock().retain(|tag| tag != consumer_tag);
        self.broker.cancel_consumer(consumer_tag)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tags = std::mem::take(&mut *self.consumer_tags.lock());
        self.broker.drop_consumers(&tags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_channel(broker: &Arc<InMemoryBroker>) -> Arc<dyn BrokerChannel> {
        let transport = InMemoryTransport::new(Arc::clone(broker));
        let connection = transport
            .connect(&ConnectionConfig::default())
            .await
            .unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_check_destination_requires_declaration() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        assert!(matches!(
            channel.check_destination("missing").await,
            Err(BrokerError::DestinationNotFound { .. })
        ));

        broker.declare_destination("mars");
        assert!(channel.check_destination("mars").await.is_ok());
    }

    #[tokio::test]
    async fn test_backlog_is_delivered_on_subscribe() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        channel.send("mars", b"one").await.unwrap();
        channel.send("mars", b"two").await.unwrap();
        assert_eq!(broker.queue_length("mars"), 2);

        let mut handle = channel.consume("mars", false).await.unwrap();
        let first = handle.deliveries.next().await.unwrap();
        let second = handle.deliveries.next().await.unwrap();
        assert_eq!(first.body, b"one");
        assert_eq!(second.body, b"two");
        assert!(!first.redelivered);
        assert_eq!(broker.queue_length("mars"), 0);
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn test_ack_settles_delivery() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        let mut handle = channel.consume("mars", false).await.unwrap();
        channel.send("mars", b"payload").await.unwrap();

        let delivery = handle.deliveries.next().await.unwrap();
        channel.ack(delivery.delivery_tag).await.unwrap();

        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked_count("mars"), 1);

        // A second settle attempt for the same tag fails.
        assert!(channel.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        let mut handle = channel.consume("mars", false).await.unwrap();
        channel.send("mars", b"flaky").await.unwrap();

        let first = handle.deliveries.next().await.unwrap();
        assert!(!first.redelivered);
        channel.reject(first.delivery_tag, true).await.unwrap();

        let second = handle.deliveries.next().await.unwrap();
        assert_eq!(second.body, b"flaky");
        assert!(second.redelivered);
        assert_eq!(broker.requeued_count("mars"), 1);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        let mut handle = channel.consume("mars", false).await.unwrap();
        channel.send("mars", b"poison").await.unwrap();

        let delivery = handle.deliveries.next().await.unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.dead_letter_count("mars"), 1);
        assert_eq!(broker.queue_length("mars"), 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_delivery_stream() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        let mut handle = channel.consume("mars", false).await.unwrap();
        channel.cancel(&handle.consumer_tag).await.unwrap();

        assert!(handle.deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_consumers_and_rejects_operations() {
        let broker = InMemoryBroker::new();
        broker.declare_destination("mars");
        let channel = open_channel(&broker).await;

        let mut handle = channel.consume("mars", false).await.unwrap();
        channel.close().await.unwrap();

        assert!(handle.deliveries.next().await.is_none());
        assert!(matches!(
            channel.send("mars", b"x").await,
            Err(BrokerError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let broker = InMemoryBroker::new();
        let transport = InMemoryTransport::new(broker);
        transport.fail_next_connects(1);

        let config = ConnectionConfig::default();
        assert!(transport.connect(&config).await.is_err());
        assert!(transport.connect(&config).await.is_ok());
        assert_eq!(transport.connect_attempts(), 2);
    }
}

//! # In-Memory Broker
//!
//! In-process broker implementation for tests and single-binary deployments.
//!
//! ## Key Features
//!
//! - **Competing consumers**: every group subscribed to a topic gets its own queue;
//!   members of a group pull from it, so each message is handled once per group
//! - **Retention**: messages published to a topic nobody subscribed to yet are handed
//!   to the first group that subscribes
//! - **Request/reply**: private `_INBOX.*` subjects, with a counter for replies that
//!   arrive after the inbox was consumed or abandoned
//! - **Failure simulation**: connections can be dropped and the broker made
//!   unreachable; queued messages survive, publishes made while disconnected are
//!   buffered and flushed on reconnect
//!
//! ## Usage
//!
//! ```rust
//! use flashcards_core::messaging::{BrokerClient, InMemoryBroker};
//! use futures::StreamExt;
//!
//! # async fn example() -> flashcards_core::messaging::MessagingResult<()> {
//! let broker = InMemoryBroker::new();
//! let client = broker.client("cards-service");
//! client.connect().await?;
//!
//! let mut subscription = client.subscribe("cards", "cards-workers").await?;
//! client.publish("cards", b"{}".to_vec(), None).await?;
//! let message = subscription.next().await;
//! assert!(message.is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{BrokerClient, Subscription};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ConnectionEvent, ConnectionState, InboundMessage, INBOX_PREFIX};

const CLIENT_TYPE: &str = "in_memory";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Queue shared by the members of one consumer group
struct GroupQueue {
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    depth: Arc<AtomicUsize>,
}

impl GroupQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn push(&self, message: InboundMessage) {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Default)]
struct Topic {
    retained: Vec<InboundMessage>,
    groups: HashMap<String, GroupQueue>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, Topic>>,
    inboxes: DashMap<String, oneshot::Sender<InboundMessage>>,
    clients: Mutex<Vec<Weak<ClientState>>>,
    reachable: AtomicBool,
    published: AtomicU64,
    stray_replies: AtomicU64,
}

/// Counters exposed for assertions and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub stray_replies: u64,
    pub connected_clients: usize,
}

/// In-process broker hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                inboxes: DashMap::new(),
                clients: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                published: AtomicU64::new(0),
                stray_replies: AtomicU64::new(0),
            }),
        }
    }

    /// Create a new, not yet connected client
    pub fn client(&self, name: impl Into<String>) -> InMemoryClient {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(ClientState {
            name: name.into(),
            state: AtomicU8::new(ConnectionState::Disconnected.into()),
            ever_connected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            events,
        });

        let mut clients = self.state.clients.lock();
        clients.retain(|c| c.strong_count() > 0);
        clients.push(Arc::downgrade(&client));

        InMemoryClient {
            broker: self.clone(),
            client,
        }
    }

    /// Make the broker (un)reachable. While unreachable, connects and pings fail
    /// and publishes are buffered client-side.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::Release);
        info!(reachable = reachable, "In-memory broker reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::Acquire)
    }

    /// Drop every live connection. Subscriptions end, queued messages are kept.
    pub fn drop_connections(&self) {
        for client in self.live_clients() {
            client.drop_connection();
        }
    }

    /// Messages waiting in a group queue
    pub fn queue_depth(&self, topic: &str, group: &str) -> usize {
        let topics = self.state.topics.lock();
        topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.depth.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Messages retained for a topic without any group
    pub fn retained(&self, topic: &str) -> usize {
        let topics = self.state.topics.lock();
        topics.get(topic).map(|t| t.retained.len()).unwrap_or(0)
    }

    pub fn stray_replies(&self) -> u64 {
        self.state.stray_replies.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.state.published.load(Ordering::Acquire),
            stray_replies: self.stray_replies(),
            connected_clients: self
                .live_clients()
                .iter()
                .filter(|c| c.connection_state() == ConnectionState::Connected)
                .count(),
        }
    }

    fn live_clients(&self) -> Vec<Arc<ClientState>> {
        self.state
            .clients
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn route(&self, message: InboundMessage) {
        self.state.published.fetch_add(1, Ordering::AcqRel);

        if message.subject.starts_with(INBOX_PREFIX) {
            self.deliver_reply(message);
            return;
        }

        let mut topics = self.state.topics.lock();
        let topic = topics.entry(message.subject.clone()).or_default();
        if topic.groups.is_empty() {
            topic.retained.push(message);
            return;
        }
        for group in topic.groups.values() {
            group.push(message.clone());
        }
    }

    fn deliver_reply(&self, message: InboundMessage) {
        let subject = message.subject.clone();
        let delivered = match self.state.inboxes.remove(&subject) {
            Some((_, waiter)) => waiter.send(message).is_ok(),
            None => false,
        };
        if !delivered {
            self.state.stray_replies.fetch_add(1, Ordering::AcqRel);
            warn!(subject = %subject, "Reply arrived for an inbox nobody is waiting on");
        }
    }

    fn join_group(
        &self,
        topic: &str,
        group: &str,
    ) -> (
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
        Arc<AtomicUsize>,
    ) {
        let mut topics = self.state.topics.lock();
        let topic = topics.entry(topic.to_string()).or_default();
        let queue = topic
            .groups
            .entry(group.to_string())
            .or_insert_with(GroupQueue::new);
        for message in topic.retained.drain(..) {
            queue.push(message);
        }
        (queue.receiver.clone(), queue.depth.clone())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("reachable", &self.is_reachable())
            .field("stats", &self.stats())
            .finish()
    }
}

struct ClientState {
    name: String,
    state: AtomicU8,
    ever_connected: AtomicBool,
    /// Dropping a sender ends the matching subscription stream
    subscriptions: Mutex<HashMap<String, oneshot::Sender<()>>>,
    pending: Mutex<Vec<InboundMessage>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ClientState {
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn drop_connection(&self) {
        let dropped = self
            .state
            .compare_exchange(
                ConnectionState::Connected.into(),
                ConnectionState::Disconnected.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if dropped {
            let cancelled = {
                let mut subscriptions = self.subscriptions.lock();
                let count = subscriptions.len();
                subscriptions.clear();
                count
            };
            warn!(client = %self.name, cancelled_subscriptions = cancelled, "Connection dropped");
            self.emit(ConnectionEvent::Disconnected);
        }
    }
}

/// One connection to an [`InMemoryBroker`]
pub struct InMemoryClient {
    broker: InMemoryBroker,
    client: Arc<ClientState>,
}

impl InMemoryClient {
    pub fn name(&self) -> &str {
        &self.client.name
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }

    /// Simulate a connection loss for this client only
    pub fn drop_connection(&self) {
        self.client.drop_connection();
    }

    /// Publishes buffered while disconnected
    pub fn pending_publishes(&self) -> usize {
        self.client.pending.lock().len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.client.subscriptions.lock().len()
    }

    fn ensure_not_closed(&self) -> MessagingResult<()> {
        if self.connection_state() == ConnectionState::Closed {
            return Err(MessagingError::closed(self.client.name.clone()));
        }
        Ok(())
    }

    fn ensure_connected(&self) -> MessagingResult<()> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(MessagingError::closed(self.client.name.clone())),
            ConnectionState::Disconnected => {
                Err(MessagingError::not_connected(self.client.name.clone()))
            }
        }
    }

    fn flush_pending(&self) {
        let pending = std::mem::take(&mut *self.client.pending.lock());
        if !pending.is_empty() {
            debug!(client = %self.client.name, count = pending.len(), "Flushing buffered publishes");
        }
        for message in pending {
            self.broker.route(message);
        }
    }
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("name", &self.client.name)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// State threaded through a subscription stream
struct Delivery {
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    depth: Arc<AtomicUsize>,
    cancel: oneshot::Receiver<()>,
}

#[async_trait]
impl BrokerClient for InMemoryClient {
    fn client_type(&self) -> &'static str {
        CLIENT_TYPE
    }

    async fn connect(&self) -> MessagingResult<()> {
        self.ensure_not_closed()?;
        if !self.broker.is_reachable() {
            return Err(MessagingError::connection("in-memory broker is unreachable"));
        }

        let connected = self
            .client
            .state
            .compare_exchange(
                ConnectionState::Disconnected.into(),
                ConnectionState::Connected.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !connected {
            // Already connected, or closed concurrently
            return self.ensure_connected();
        }

        let event = if self.client.ever_connected.swap(true, Ordering::AcqRel) {
            ConnectionEvent::Reconnected
        } else {
            ConnectionEvent::Connected
        };
        info!(client = %self.client.name, event = %event, "In-memory client connected");

        self.flush_pending();
        self.client.emit(event);
        Ok(())
    }

    async fn ping(&self) -> MessagingResult<()> {
        self.ensure_connected()?;
        if !self.broker.is_reachable() {
            self.client.drop_connection();
            return Err(MessagingError::connection("ping failed: broker unreachable"));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.client.events.subscribe()
    }

    async fn subscribe(&self, topic: &str, group: &str) -> MessagingResult<Subscription> {
        self.ensure_connected()?;
        if topic.trim().is_empty() || group.trim().is_empty() {
            return Err(MessagingError::subscription(
                topic,
                group,
                "topic and group must not be empty",
            ));
        }

        let (queue, depth) = self.broker.join_group(topic, group);
        let (cancel_tx, cancel) = oneshot::channel();
        if self
            .client
            .subscriptions
            .lock()
            .insert(topic.to_string(), cancel_tx)
            .is_some()
        {
            debug!(client = %self.client.name, topic = %topic, "Replaced existing subscription");
        }

        let delivery = Delivery {
            queue,
            depth,
            cancel,
        };
        let messages = futures::stream::unfold(delivery, |mut delivery| async move {
            let message = {
                let mut queue = tokio::select! {
                    biased;
                    _ = &mut delivery.cancel => return None,
                    guard = delivery.queue.clone().lock_owned() => guard,
                };
                tokio::select! {
                    biased;
                    _ = &mut delivery.cancel => None,
                    message = queue.recv() => message,
                }
            }?;
            delivery.depth.fetch_sub(1, Ordering::AcqRel);
            Some((message, delivery))
        })
        .boxed();

        debug!(client = %self.client.name, topic = %topic, group = %group, "Subscribed");
        Ok(Subscription::new(topic, group, messages))
    }

    async fn unsubscribe(&self, topic: &str) -> MessagingResult<()> {
        if self.client.subscriptions.lock().remove(topic).is_some() {
            debug!(client = %self.client.name, topic = %topic, "Unsubscribed");
        }
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply_to: Option<&str>,
    ) -> MessagingResult<()> {
        self.ensure_not_closed()?;
        if subject.trim().is_empty() {
            return Err(MessagingError::publish(subject, "subject must not be empty"));
        }

        let mut message = InboundMessage::new(subject, payload);
        message.reply_to = reply_to.map(str::to_string);

        if self.is_connected() && self.broker.is_reachable() {
            self.broker.route(message);
        } else {
            debug!(client = %self.client.name, subject = %subject, "Buffering publish until reconnect");
            self.client.pending.lock().push(message);
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> MessagingResult<InboundMessage> {
        self.ensure_connected()?;

        let inbox = format!("{INBOX_PREFIX}{}", Uuid::new_v4());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.broker.state.inboxes.insert(inbox.clone(), reply_tx);

        if let Err(e) = self.publish(subject, payload, Some(&inbox)).await {
            self.broker.state.inboxes.remove(&inbox);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessagingError::internal(format!(
                "reply inbox {inbox} dropped without an answer"
            ))),
            Err(_) => {
                self.broker.state.inboxes.remove(&inbox);
                Err(MessagingError::timeout(subject, timeout.as_millis() as u64))
            }
        }
    }

    async fn close(&self) -> MessagingResult<()> {
        let previous = ConnectionState::from(
            self.client
                .state
                .swap(ConnectionState::Closed.into(), Ordering::AcqRel),
        );
        if previous == ConnectionState::Closed {
            return Ok(());
        }

        self.client.subscriptions.lock().clear();
        let discarded = std::mem::take(&mut *self.client.pending.lock()).len();
        if discarded > 0 {
            warn!(client = %self.client.name, discarded = discarded, "Discarding buffered publishes on close");
        }
        info!(client = %self.client.name, "In-memory client closed");
        self.client.emit(ConnectionEvent::Closed);
        Ok(())
    }
}

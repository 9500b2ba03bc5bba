//! # Message Dispatch Server
//!
//! Binds one pipeline to one broker subscription.
//!
//! ## Architecture
//!
//! - **Delivery loop**: acquires a concurrency permit, then takes the next message
//!   and spawns its execution; while saturated, messages stay queued in the broker
//! - **Execution**: decode, inject dependencies, run the [`Processor`], reply once
//! - **Keep-subscribed loop**: polls the running flag and resubscribes whenever the
//!   server fell back to `STOPPED` while the client is connected
//! - **Observability**: atomic counters (hot path) and structured logs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flashcards_core::chain::{root_chain, Processor};
//! use flashcards_core::config::DispatchConfig;
//! use flashcards_core::context::RequestContext;
//! use flashcards_core::messaging::{InMemoryBroker, JsonCodec};
//! use flashcards_core::server::DispatchServer;
//!
//! type CardContext = RequestContext<String, String, String>;
//!
//! # async fn example() -> flashcards_core::Result<()> {
//! let broker = InMemoryBroker::new();
//! let processor = Processor::from_builder(root_chain::<CardContext>().worker(|w| {
//!     w.handle_sync(|ctx| {
//!         ctx.response = ctx.request.to_uppercase();
//!         Ok(())
//!     })
//! }));
//!
//! let server = DispatchServer::new(
//!     DispatchConfig::new("cards", "cards-workers"),
//!     Arc::new(broker.client("cards-service")),
//!     processor,
//!     JsonCodec::new(),
//! )?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::shutdown::ManagedServer;
use super::supervisor::SubscriptionOwner;
use crate::chain::Processor;
use crate::config::DispatchConfig;
use crate::context::{ContextStatus, ProcessingContext};
use crate::error::Result;
use crate::logging::{log_dispatch_operation, log_error, log_pipeline_errors};
use crate::messaging::{BrokerClient, ContextCodec, InboundMessage, Subscription};

/// Dependency injection hook run on every decoded context before execution
pub type ContextInitializer<C> = Arc<dyn Fn(&mut C) + Send + Sync>;

/// Dispatch server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Stopped = 0,
    Subscribing = 1,
    Ready = 2,
}

impl From<u8> for ServerState {
    fn from(value: u8) -> Self {
        match value {
            1 => ServerState::Subscribing,
            2 => ServerState::Ready,
            _ => ServerState::Stopped,
        }
    }
}

/// Statistics for dispatch observability
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub messages_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub decode_failures: AtomicU64,
    pub pipeline_failures: AtomicU64,
    pub reply_failures: AtomicU64,
    pub subscriptions: AtomicU64,
}

impl DispatchStats {
    pub fn get_messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn get_replies_sent(&self) -> u64 {
        self.replies_sent.load(Ordering::Relaxed)
    }

    pub fn get_decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn get_pipeline_failures(&self) -> u64 {
        self.pipeline_failures.load(Ordering::Relaxed)
    }

    pub fn get_reply_failures(&self) -> u64 {
        self.reply_failures.load(Ordering::Relaxed)
    }

    /// Number of subscriptions created over the server lifetime
    pub fn get_subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct ServerTasks {
    delivery: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

struct DispatchShared<C>
where
    C: ProcessingContext,
{
    config: DispatchConfig,
    client: Arc<dyn BrokerClient>,
    processor: Processor<C>,
    codec: Arc<dyn ContextCodec<C>>,
    initializer: Option<ContextInitializer<C>>,
    running: AtomicBool,
    state: AtomicU8,
    /// Incremented on every (un)subscribe so a stale delivery loop cannot reset state
    generation: AtomicU64,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Serializes subscribe, resubscribe and close
    lifecycle: tokio::sync::Mutex<()>,
    tasks: Mutex<ServerTasks>,
    stats: Arc<DispatchStats>,
}

/// Builder for [`DispatchServer`]
pub struct DispatchServerBuilder<C>
where
    C: ProcessingContext,
{
    config: DispatchConfig,
    client: Arc<dyn BrokerClient>,
    processor: Processor<C>,
    codec: Arc<dyn ContextCodec<C>>,
    initializer: Option<ContextInitializer<C>>,
}

impl<C> DispatchServerBuilder<C>
where
    C: ProcessingContext + Default,
{
    /// Hook injecting repositories and other collaborators into each context
    pub fn initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&mut C) + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn build(self) -> Result<DispatchServer<C>> {
        self.config.validate()?;

        let max_concurrency = self.config.max_concurrency;
        Ok(DispatchServer {
            shared: Arc::new(DispatchShared {
                config: self.config,
                client: self.client,
                processor: self.processor,
                codec: self.codec,
                initializer: self.initializer,
                running: AtomicBool::new(false),
                state: AtomicU8::new(ServerState::Stopped as u8),
                generation: AtomicU64::new(0),
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(ServerTasks::default()),
                stats: Arc::new(DispatchStats::default()),
            }),
        })
    }
}

/// Feeds broker messages into a pipeline. Cheap to clone; clones share state.
pub struct DispatchServer<C>
where
    C: ProcessingContext,
{
    shared: Arc<DispatchShared<C>>,
}

impl<C> Clone for DispatchServer<C>
where
    C: ProcessingContext,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> DispatchServer<C>
where
    C: ProcessingContext + Default,
{
    pub fn builder(
        config: DispatchConfig,
        client: Arc<dyn BrokerClient>,
        processor: Processor<C>,
        codec: impl ContextCodec<C>,
    ) -> DispatchServerBuilder<C> {
        DispatchServerBuilder {
            config,
            client,
            processor,
            codec: Arc::new(codec),
            initializer: None,
        }
    }

    pub fn new(
        config: DispatchConfig,
        client: Arc<dyn BrokerClient>,
        processor: Processor<C>,
        codec: impl ContextCodec<C>,
    ) -> Result<Self> {
        Self::builder(config, client, processor, codec).build()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ServerState {
        ServerState::from(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Subscribed and accepting work
    pub fn ready(&self) -> bool {
        self.is_running() && self.state() == ServerState::Ready
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.shared.stats.clone()
    }

    /// Subscribe and keep the subscription alive until [`close`](Self::close)
    ///
    /// A failed initial subscription is retried by the keep-subscribed loop.
    #[instrument(skip(self), fields(topic = %self.shared.config.topic, group = %self.shared.config.group))]
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatch server already running, ignoring start");
            return Ok(());
        }

        info!(
            max_concurrency = self.shared.config.max_concurrency,
            keepalive_interval_ms = self.shared.config.keepalive_interval_ms,
            "Starting dispatch server"
        );

        if let Err(e) = self.subscribe().await {
            warn!(error = %e, "Initial subscription failed, keep-subscribed loop will retry");
        }

        let keepalive = tokio::spawn(self.clone().keep_subscribed_loop());
        if let Some(previous) = self.shared.tasks.lock().keepalive.replace(keepalive) {
            previous.abort();
        }

        log_dispatch_operation(
            "start",
            &self.shared.config.topic,
            &self.shared.config.group,
            "running",
            None,
        );
        Ok(())
    }

    /// Subscribe if currently `STOPPED`; otherwise a no-op
    pub async fn subscribe(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.subscribe_locked().await
    }

    /// Drop the current subscription, if any, and subscribe again
    #[instrument(skip(self), fields(topic = %self.shared.config.topic, group = %self.shared.config.group))]
    pub async fn resubscribe(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if !self.is_running() {
            debug!("Dispatch server not running, skipping resubscribe");
            return Ok(());
        }

        self.unsubscribe_locked().await;
        self.subscribe_locked().await
    }

    /// Stop accepting deliveries and unsubscribe. In-flight executions are not
    /// cancelled; an owned connection is closed only after they drained, bounded by
    /// `graceful_shutdown_timeout_ms`. Idempotent.
    #[instrument(skip(self), fields(topic = %self.shared.config.topic, group = %self.shared.config.group))]
    pub async fn close(&self) -> Result<()> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let _lifecycle = self.shared.lifecycle.lock().await;

        if let Some(keepalive) = self.shared.tasks.lock().keepalive.take() {
            keepalive.abort();
        }
        self.unsubscribe_locked().await;

        if self.shared.config.owns_connection {
            // Replies of in-flight executions still need the connection
            let timeout = self.shared.config.graceful_shutdown_timeout();
            if !self.wait_for_drain(timeout).await {
                warn!(
                    in_flight = self.in_flight(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Closing owned connection with executions still in flight"
                );
            }
            self.shared.client.close().await?;
        }

        if was_running {
            info!(in_flight = self.in_flight(), "Dispatch server closed");
            log_dispatch_operation(
                "close",
                &self.shared.config.topic,
                &self.shared.config.group,
                "stopped",
                None,
            );
        } else {
            debug!("Dispatch server already closed");
        }
        Ok(())
    }

    /// Wait until in-flight executions finish; false when `timeout` expired first
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    async fn subscribe_locked(&self) -> Result<()> {
        if !self.is_running() {
            debug!("Dispatch server not running, skipping subscribe");
            return Ok(());
        }
        if self
            .shared
            .state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Subscribing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(state = ?self.state(), "Already subscribed or subscribing");
            return Ok(());
        }

        let config = &self.shared.config;
        let subscription = match self.shared.client.subscribe(&config.topic, &config.group).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(e.into());
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delivery = tokio::spawn(self.clone().delivery_loop(subscription, generation));
        if let Some(previous) = self.shared.tasks.lock().delivery.replace(delivery) {
            previous.abort();
        }

        self.set_state(ServerState::Ready);
        self.shared.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = %config.topic,
            group = %config.group,
            generation = generation,
            "Dispatch server subscribed"
        );
        Ok(())
    }

    async fn unsubscribe_locked(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(delivery) = self.shared.tasks.lock().delivery.take() {
            delivery.abort();
        }
        if let Err(e) = self.shared.client.unsubscribe(&self.shared.config.topic).await {
            warn!(topic = %self.shared.config.topic, error = %e, "Unsubscribe failed");
        }
        self.set_state(ServerState::Stopped);
    }

    fn set_state(&self, state: ServerState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    async fn delivery_loop(self, mut subscription: Subscription, generation: u64) {
        loop {
            let permit = match self.shared.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Concurrency semaphore closed");
                    break;
                }
            };

            let Some(message) = subscription.next().await else {
                break;
            };

            self.shared
                .stats
                .messages_received
                .fetch_add(1, Ordering::Relaxed);
            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_message(message, permit).await;
            });
        }

        // A superseded loop must not touch the state of its successor
        if self.shared.generation.load(Ordering::Acquire) == generation {
            let lost = self
                .shared
                .state
                .compare_exchange(
                    ServerState::Ready as u8,
                    ServerState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if lost && self.is_running() {
                warn!(
                    topic = %self.shared.config.topic,
                    group = %self.shared.config.group,
                    "Subscription ended unexpectedly, waiting to resubscribe"
                );
            }
        }
    }

    async fn handle_message(&self, message: InboundMessage, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let _in_flight = InFlightGuard {
            shared: self.shared.clone(),
        };
        let started = Instant::now();
        let topic = &self.shared.config.topic;

        let context = match self.shared.codec.decode(&message.payload) {
            Ok(mut context) => {
                let initializer = self.shared.initializer.as_ref();
                let processor = &self.shared.processor;
                let execution = async {
                    if let Some(initializer) = initializer {
                        initializer(&mut context);
                    }
                    processor.exec(&mut context).await;
                };
                let outcome = AssertUnwindSafe(execution).catch_unwind().await;
                match outcome {
                    Ok(()) => {
                        if context.status() == ContextStatus::Fail {
                            self.shared
                                .stats
                                .pipeline_failures
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        context
                    }
                    Err(_) => {
                        self.shared
                            .stats
                            .pipeline_failures
                            .fetch_add(1, Ordering::Relaxed);
                        log_error(
                            "dispatch",
                            "execute",
                            "pipeline panicked",
                            Some(&message.subject),
                        );
                        C::unexpected_failure()
                    }
                }
            }
            Err(e) => {
                self.shared
                    .stats
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    subject = %message.subject,
                    payload_len = message.payload_len(),
                    error = %e,
                    "Failed to decode request, replying with unexpected failure"
                );
                C::unexpected_failure()
            }
        };

        let request_id = context.request_id();
        let status = context.status();
        log_pipeline_errors(topic, request_id.as_deref(), context.errors());

        // Encoded before any await: the context itself is only `Send`
        match &message.reply_to {
            Some(reply_to) => {
                let payload = self.encode_reply(reply_to, &context);
                if let Some(payload) = payload {
                    self.publish_reply(reply_to, payload).await;
                }
            }
            None => debug!(
                topic = %topic,
                subject = %message.subject,
                "Message without reply address, nothing to publish"
            ),
        }

        debug!(
            topic = %topic,
            request_id = ?request_id,
            status = %status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
    }

    fn encode_reply(&self, reply_to: &str, context: &C) -> Option<Vec<u8>> {
        match self.shared.codec.encode(context) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(reply_to = %reply_to, error = %e, "Failed to encode reply, sending unexpected failure");
                match self.shared.codec.encode(&C::unexpected_failure()) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        self.shared
                            .stats
                            .reply_failures
                            .fetch_add(1, Ordering::Relaxed);
                        log_error(
                            "dispatch",
                            "encode_reply",
                            &e.to_string(),
                            Some(reply_to),
                        );
                        None
                    }
                }
            }
        }
    }

    async fn publish_reply(&self, reply_to: &str, payload: Vec<u8>) {
        match self.shared.client.publish(reply_to, payload, None).await {
            Ok(()) => {
                self.shared.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared
                    .stats
                    .reply_failures
                    .fetch_add(1, Ordering::Relaxed);
                log_error("dispatch", "publish_reply", &e.to_string(), Some(reply_to));
            }
        }
    }

    async fn keep_subscribed_loop(self) {
        let mut interval = tokio::time::interval(self.shared.config.keepalive_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.is_running() {
            interval.tick().await;
            if !self.is_running() {
                break;
            }

            if self.state() == ServerState::Stopped && self.shared.client.is_connected() {
                debug!(topic = %self.shared.config.topic, "Subscription missing, resubscribing");
                if let Err(e) = self.subscribe().await {
                    warn!(topic = %self.shared.config.topic, error = %e, "Resubscribe attempt failed");
                }
            }
        }

        debug!(topic = %self.shared.config.topic, "Keep-subscribed loop exited");
    }
}

/// Decrements the in-flight counter when an execution ends, even by panic
struct InFlightGuard<C>
where
    C: ProcessingContext,
{
    shared: Arc<DispatchShared<C>>,
}

impl<C> Drop for InFlightGuard<C>
where
    C: ProcessingContext,
{
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

#[async_trait]
impl<C> SubscriptionOwner for DispatchServer<C>
where
    C: ProcessingContext + Default,
{
    fn owner_name(&self) -> String {
        format!("{}/{}", self.shared.config.topic, self.shared.config.group)
    }

    async fn force_resubscribe(&self) -> Result<()> {
        self.resubscribe().await
    }
}

#[async_trait]
impl<C> ManagedServer for DispatchServer<C>
where
    C: ProcessingContext + Default,
{
    fn server_name(&self) -> String {
        self.owner_name()
    }

    async fn shutdown(&self) -> Result<()> {
        self.close().await
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.wait_for_drain(timeout).await
    }
}

impl<C> fmt::Debug for DispatchServer<C>
where
    C: ProcessingContext,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchServer")
            .field("topic", &self.shared.config.topic)
            .field("group", &self.shared.config.group)
            .field("state", &ServerState::from(self.shared.state.load(Ordering::Acquire)))
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish()
    }
}

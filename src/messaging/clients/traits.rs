//! The broker seam used by the dispatch runtime

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use tokio::sync::broadcast;

use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{ConnectionEvent, InboundMessage};

/// Abstraction over broker client libraries
///
/// Implementations own exactly one broker connection. Subscriptions use
/// competing-consumer groups: every group subscribed to a topic receives each
/// message once, and members of the same group share the load.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Short backend name used in logs and errors
    fn client_type(&self) -> &'static str;

    /// Establish (or re-establish) the connection
    async fn connect(&self) -> MessagingResult<()>;

    /// Round trip to the broker; fails when the connection is silently dead
    async fn ping(&self) -> MessagingResult<()>;

    fn is_connected(&self) -> bool;

    /// Subscribe to connection lifecycle events
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn subscribe(&self, topic: &str, group: &str) -> MessagingResult<Subscription>;

    /// Idempotent: unsubscribing an unknown topic succeeds
    async fn unsubscribe(&self, topic: &str) -> MessagingResult<()>;

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply_to: Option<&str>,
    ) -> MessagingResult<()>;

    /// Publish with a private reply inbox and wait for the first reply
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> MessagingResult<InboundMessage>;

    /// Close the connection for good. Idempotent.
    async fn close(&self) -> MessagingResult<()>;
}

/// Stream of messages delivered to one subscription
///
/// The stream ends when the subscription is cancelled: explicit unsubscribe,
/// connection loss or client close.
pub struct Subscription {
    topic: String,
    group: String,
    messages: BoxStream<'static, InboundMessage>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        messages: BoxStream<'static, InboundMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Stream for Subscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .finish()
    }
}

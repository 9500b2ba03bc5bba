//! # Messaging Module
//!
//! Broker abstraction for the dispatch runtime: the [`BrokerClient`] seam, the message
//! and connection event types it speaks, context codecs, and the messaging error type.
//! An [`InMemoryBroker`] ships with the crate so services and tests can run without an
//! external broker.

pub mod clients;
pub mod codec;
pub mod errors;
pub mod message;

pub use clients::{BrokerClient, BrokerStats, InMemoryBroker, InMemoryClient, Subscription};
pub use codec::{ContextCodec, JsonCodec};
pub use errors::{MessagingError, MessagingResult};
pub use message::{ConnectionEvent, ConnectionState, InboundMessage, INBOX_PREFIX};

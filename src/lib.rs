#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flashcards Core
//!
//! Shared request-processing core of the flashcards services (cards, dictionaries,
//! settings, translation, text-to-speech).
//!
//! ## Overview
//!
//! Every domain request flows through a **pipeline**: a tree of workers and chains
//! built once at startup and shared by all concurrent requests. Workers carry the
//! domain logic, chains order them, filters select which branch runs for a given
//! operation, and exception handlers decide whether a failure is recorded and
//! skipped or aborts the request.
//!
//! Around the engine sits a message-driven runtime: a dispatch server subscribes
//! to a broker topic, decodes each message into a fresh context, runs the pipeline
//! with bounded parallelism and replies exactly once. A connection supervisor keeps
//! the broker connection and subscriptions alive across outages.
//!
//! ## Module Organization
//!
//! - [`chain`] - Pipeline engine: nodes, builders, processor, reusable stages
//! - [`context`] - Request context, status lifecycle and error records
//! - [`messaging`] - Broker client seam, in-memory broker, codecs
//! - [`server`] - Dispatch server, connection supervisor, health, shutdown
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup and helpers
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust
//! use flashcards_core::chain::{fail_with, root_chain, Processor};
//! use flashcards_core::context::{ContextStatus, RequestContext};
//!
//! #[derive(Debug, Clone, Copy, Default, PartialEq)]
//! enum CardCommand {
//!     #[default]
//!     Create,
//! }
//!
//! type CardContext = RequestContext<CardCommand, String, Option<String>>;
//!
//! # tokio_test::block_on(async {
//! let processor = Processor::from_builder(
//!     root_chain::<CardContext>()
//!         .operation("create card", CardCommand::Create, |c| {
//!             c.worker(|w| {
//!                 w.title("validate word")
//!                     .handle_sync(|ctx| {
//!                         anyhow::ensure!(!ctx.request.is_empty(), "word is blank");
//!                         Ok(())
//!                     })
//!                     .on_exception(fail_with("empty", "validation", "word"))
//!             })
//!             .stop_on_errors()
//!             .worker(|w| {
//!                 w.title("create").handle_sync(|ctx| {
//!                     ctx.response = Some(format!("card:{}", ctx.request));
//!                     Ok(())
//!                 })
//!             })
//!         }),
//! );
//!
//! let mut ctx = CardContext::new(CardCommand::Create, "Haus".to_string());
//! processor.exec(&mut ctx).await;
//! assert_eq!(ctx.status, ContextStatus::Ok);
//! # });
//! ```

pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod server;

pub use chain::{
    chain, root_chain, worker, Chain, ChainBuilder, ExceptionOutcome, Node, NodeRef, Processor,
    Worker, WorkerBuilder,
};
pub use config::{BrokerConfig, ConnectionConfig, CoreConfig, DispatchConfig, LoggingConfig};
pub use context::{ContextStatus, ErrorRecord, ProcessingContext, RequestContext};
pub use error::{CoreError, Result};
pub use logging::init_structured_logging;
pub use messaging::{
    BrokerClient, ConnectionEvent, ContextCodec, InMemoryBroker, InMemoryClient, InboundMessage,
    JsonCodec, MessagingError, MessagingResult,
};
pub use server::{
    ConnectionSupervisor, DispatchServer, HealthCheck, HealthReport, HealthStatus, LivenessProbe,
};

//! # Pipeline Engine
//!
//! Composable, filterable, exception-scoped processing pipelines.
//!
//! A pipeline is a tree of [`Node`]s: [`Worker`] leaves carry the actual work and
//! [`Chain`]s run their children in declaration order. Every node has a filter
//! (`test`) deciding whether it runs for a given context, and an exception handler
//! deciding whether a failure is recovered locally or propagated to the parent.
//! Failures are fail-fast: an unrecovered error aborts the remaining siblings.
//!
//! Trees are assembled once with the builders and shared read-only afterwards;
//! the [`Processor`] drives a [`ProcessingContext`](crate::context::ProcessingContext)
//! through the root and settles its terminal status.

mod builder;
mod composite;
mod node;
mod processor;
pub mod stages;
mod worker;

pub use builder::{chain, root_chain, worker, ChainBuilder, WorkerBuilder};
pub use composite::Chain;
pub use node::{ExceptionHandler, ExceptionOutcome, Filter, Handler, Node, NodeRef};
pub use processor::Processor;
pub use stages::{fail_with, operation, record_error, stop_on_errors};
pub use worker::Worker;

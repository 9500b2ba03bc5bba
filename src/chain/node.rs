//! The uniform node contract shared by workers and chains

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, trace};

/// Shared, immutable handle to a built node
pub type NodeRef<C> = Arc<dyn Node<C>>;

/// Predicate deciding whether a node runs for a given context
pub type Filter<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Body of a worker
pub type Handler<C> =
    Arc<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// Recovery function invoked when `process` fails
pub type ExceptionHandler<C> =
    Arc<dyn for<'a> Fn(&'a mut C, anyhow::Error) -> BoxFuture<'a, ExceptionOutcome> + Send + Sync>;

/// Result of an exception handler
#[derive(Debug)]
pub enum ExceptionOutcome {
    /// The failure is handled; the parent continues with the next sibling
    Recovered,
    /// The failure leaves this node and is handed to the parent
    Propagate(anyhow::Error),
}

impl ExceptionOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, ExceptionOutcome::Recovered)
    }
}

/// One step of a pipeline.
///
/// Nodes are built once and shared across concurrent executions, so every piece of
/// per-request state must live in the context `C`, never in the node.
#[async_trait]
pub trait Node<C>: Send + Sync
where
    C: Send + 'static,
{
    fn title(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Filter. A node whose filter is false is skipped together with its subtree.
    fn test(&self, _context: &C) -> bool {
        true
    }

    async fn process(&self, context: &mut C) -> anyhow::Result<()>;

    /// Default: propagate to the enclosing node
    async fn on_exception(&self, _context: &mut C, error: anyhow::Error) -> ExceptionOutcome {
        ExceptionOutcome::Propagate(error)
    }

    /// Filter, process, and route a failure through `on_exception`.
    ///
    /// Returns `Err` only when the failure was not recovered by this node.
    async fn execute(&self, context: &mut C) -> anyhow::Result<()> {
        if !self.test(context) {
            trace!(node = %self.title(), "Filter rejected context, skipping node");
            return Ok(());
        }

        match self.process(context).await {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!(node = %self.title(), error = %error, "Node failed, invoking exception handler");
                match self.on_exception(context, error).await {
                    ExceptionOutcome::Recovered => Ok(()),
                    ExceptionOutcome::Propagate(error) => Err(error),
                }
            }
        }
    }
}

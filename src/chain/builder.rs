//! # Chain/Worker Builders
//!
//! Declarative construction of node trees. Builders collect configuration and
//! freeze it into immutable [`Worker`] / [`Chain`] values at `build()` time:
//!
//! ```rust
//! use flashcards_core::chain::{root_chain, Node};
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! # tokio_test::block_on(async {
//! let root = root_chain::<Counter>()
//!     .worker(|w| w.title("increment").handle_sync(|ctx| {
//!         ctx.value += 1;
//!         Ok(())
//!     }))
//!     .chain(|c| {
//!         c.title("scale")
//!             .test(|ctx| ctx.value > 0)
//!             .worker(|w| w.handle_sync(|ctx| {
//!                 ctx.value *= 10;
//!                 Ok(())
//!             }))
//!     })
//!     .into_node();
//!
//! let mut ctx = Counter::default();
//! root.execute(&mut ctx).await.unwrap();
//! assert_eq!(ctx.value, 10);
//! # });
//! ```
//!
//! Builders are plain values consumed by `build()`; they are meant to be used from a
//! single construction site and are not shared between threads.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::composite::Chain;
use super::node::{ExceptionHandler, ExceptionOutcome, Filter, Handler, NodeRef};
use super::worker::Worker;

const DEFAULT_WORKER_TITLE: &str = "worker";
const DEFAULT_CHAIN_TITLE: &str = "chain";
const ROOT_CHAIN_TITLE: &str = "root";

/// Start a worker builder
pub fn worker<C>() -> WorkerBuilder<C>
where
    C: Send + 'static,
{
    WorkerBuilder::new()
}

/// Start a chain builder
pub fn chain<C>() -> ChainBuilder<C>
where
    C: Send + 'static,
{
    ChainBuilder::new()
}

/// Start the builder for the outermost chain of a pipeline
pub fn root_chain<C>() -> ChainBuilder<C>
where
    C: Send + 'static,
{
    ChainBuilder::new().title(ROOT_CHAIN_TITLE)
}

/// Builder for a leaf [`Worker`]
pub struct WorkerBuilder<C>
where
    C: Send + 'static,
{
    title: String,
    description: String,
    filter: Option<Filter<C>>,
    handler: Option<Handler<C>>,
    exception_handler: Option<ExceptionHandler<C>>,
}

impl<C> Default for WorkerBuilder<C>
where
    C: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> WorkerBuilder<C>
where
    C: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            title: DEFAULT_WORKER_TITLE.to_string(),
            description: String::new(),
            filter: None,
            handler: None,
            exception_handler: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Filter predicate; the worker runs only when it returns true
    pub fn test<F>(mut self, filter: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Asynchronous body
    pub fn handle<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Synchronous body
    pub fn handle_sync<F>(self, handler: F) -> Self
    where
        F: Fn(&mut C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle(move |context| {
            let result = handler(context);
            Box::pin(async move { result })
        })
    }

    /// Recovery function; returning [`ExceptionOutcome::Recovered`] lets the
    /// enclosing chain continue with the next sibling
    pub fn on_exception<F>(self, handler: F) -> Self
    where
        F: Fn(&mut C, anyhow::Error) -> ExceptionOutcome + Send + Sync + 'static,
    {
        self.on_exception_async(move |context, error| {
            let outcome = handler(context, error);
            Box::pin(async move { outcome })
        })
    }

    pub fn on_exception_async<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, anyhow::Error) -> BoxFuture<'a, ExceptionOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Worker<C> {
        Worker {
            title: self.title,
            description: self.description,
            filter: self.filter,
            handler: self.handler,
            exception_handler: self.exception_handler,
        }
    }

    pub fn into_node(self) -> NodeRef<C> {
        Arc::new(self.build())
    }
}

/// A child slot of a chain under construction
enum ChildBuilder<C>
where
    C: Send + 'static,
{
    Worker(WorkerBuilder<C>),
    Chain(ChainBuilder<C>),
    Built(NodeRef<C>),
}

impl<C> ChildBuilder<C>
where
    C: Send + 'static,
{
    fn build(self) -> NodeRef<C> {
        match self {
            ChildBuilder::Worker(builder) => builder.into_node(),
            ChildBuilder::Chain(builder) => builder.into_node(),
            ChildBuilder::Built(node) => node,
        }
    }
}

/// Builder for a composite [`Chain`]
pub struct ChainBuilder<C>
where
    C: Send + 'static,
{
    title: String,
    description: String,
    filter: Option<Filter<C>>,
    children: Vec<ChildBuilder<C>>,
    exception_handler: Option<ExceptionHandler<C>>,
}

impl<C> Default for ChainBuilder<C>
where
    C: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChainBuilder<C>
where
    C: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            title: DEFAULT_CHAIN_TITLE.to_string(),
            description: String::new(),
            filter: None,
            children: Vec::new(),
            exception_handler: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Filter predicate; when false the whole chain, children included, is skipped
    pub fn test<F>(mut self, filter: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn on_exception<F>(self, handler: F) -> Self
    where
        F: Fn(&mut C, anyhow::Error) -> ExceptionOutcome + Send + Sync + 'static,
    {
        self.on_exception_async(move |context, error| {
            let outcome = handler(context, error);
            Box::pin(async move { outcome })
        })
    }

    pub fn on_exception_async<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, anyhow::Error) -> BoxFuture<'a, ExceptionOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    /// Append a worker configured by `configure`
    pub fn worker<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(WorkerBuilder<C>) -> WorkerBuilder<C>,
    {
        self.children
            .push(ChildBuilder::Worker(configure(WorkerBuilder::new())));
        self
    }

    /// Append a nested chain configured by `configure`
    pub fn chain<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(ChainBuilder<C>) -> ChainBuilder<C>,
    {
        self.children
            .push(ChildBuilder::Chain(configure(ChainBuilder::new())));
        self
    }

    pub fn add_worker(mut self, worker: WorkerBuilder<C>) -> Self {
        self.children.push(ChildBuilder::Worker(worker));
        self
    }

    pub fn add_chain(mut self, chain: ChainBuilder<C>) -> Self {
        self.children.push(ChildBuilder::Chain(chain));
        self
    }

    /// Append an already built node, e.g. a pipeline fragment shared between services
    pub fn add(mut self, node: NodeRef<C>) -> Self {
        self.children.push(ChildBuilder::Built(node));
        self
    }

    pub fn build(self) -> Chain<C> {
        Chain {
            title: self.title,
            description: self.description,
            filter: self.filter,
            children: self.children.into_iter().map(ChildBuilder::build).collect(),
            exception_handler: self.exception_handler,
        }
    }

    pub fn into_node(self) -> NodeRef<C> {
        Arc::new(self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Node;

    #[derive(Debug, Default)]
    struct Trace {
        visited: Vec<&'static str>,
    }

    #[test]
    fn test_builder_defaults() {
        let worker = worker::<Trace>().build();
        assert_eq!(worker.title(), DEFAULT_WORKER_TITLE);
        assert_eq!(worker.description(), "");

        let chain = chain::<Trace>().build();
        assert_eq!(chain.title(), DEFAULT_CHAIN_TITLE);
        assert!(chain.is_empty());

        let root = root_chain::<Trace>().build();
        assert_eq!(root.title(), ROOT_CHAIN_TITLE);
    }

    #[test]
    fn test_children_frozen_in_declaration_order() {
        let shared = worker::<Trace>().title("shared").into_node();
        let root = root_chain::<Trace>()
            .worker(|w| w.title("first"))
            .chain(|c| c.title("nested").worker(|w| w.title("inner")))
            .add_worker(worker().title("third"))
            .add(shared)
            .build();

        let titles: Vec<&str> = root.children().iter().map(|c| c.title()).collect();
        assert_eq!(titles, vec!["first", "nested", "third", "shared"]);
        assert_eq!(root.len(), 4);
    }

    #[tokio::test]
    async fn test_worker_without_body_is_noop() {
        let node = worker::<Trace>().title("empty").into_node();
        let mut ctx = Trace::default();
        node.execute(&mut ctx).await.unwrap();
        assert!(ctx.visited.is_empty());
    }

    #[tokio::test]
    async fn test_async_handler() {
        let node = worker::<Trace>()
            .handle(|ctx| {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    ctx.visited.push("async");
                    Ok(())
                })
            })
            .into_node();

        let mut ctx = Trace::default();
        node.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.visited, vec!["async"]);
    }

    #[tokio::test]
    async fn test_async_exception_handler() {
        let node = worker::<Trace>()
            .handle_sync(|_| Err(anyhow::anyhow!("boom")))
            .on_exception_async(|ctx, error| {
                Box::pin(async move {
                    assert_eq!(error.to_string(), "boom");
                    ctx.visited.push("recovered");
                    ExceptionOutcome::Recovered
                })
            })
            .into_node();

        let mut ctx = Trace::default();
        node.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.visited, vec!["recovered"]);
    }
}

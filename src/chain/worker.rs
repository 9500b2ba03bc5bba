//! Leaf node wrapping a single unit of work

use std::fmt;

use async_trait::async_trait;

use super::node::{ExceptionHandler, ExceptionOutcome, Filter, Handler, Node};

/// A leaf node. Built through [`WorkerBuilder`](super::WorkerBuilder).
pub struct Worker<C>
where
    C: Send + 'static,
{
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) filter: Option<Filter<C>>,
    pub(crate) handler: Option<Handler<C>>,
    pub(crate) exception_handler: Option<ExceptionHandler<C>>,
}

#[async_trait]
impl<C> Node<C> for Worker<C>
where
    C: Send + 'static,
{
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn test(&self, context: &C) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(context))
    }

    async fn process(&self, context: &mut C) -> anyhow::Result<()> {
        match &self.handler {
            Some(handler) => handler(context).await,
            None => Ok(()),
        }
    }

    async fn on_exception(&self, context: &mut C, error: anyhow::Error) -> ExceptionOutcome {
        match &self.exception_handler {
            Some(handler) => handler(context, error).await,
            None => ExceptionOutcome::Propagate(error),
        }
    }
}

impl<C> fmt::Debug for Worker<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("title", &self.title)
            .field("description", &self.description)
            .field("has_filter", &self.filter.is_some())
            .field("has_handler", &self.handler.is_some())
            .field("has_exception_handler", &self.exception_handler.is_some())
            .finish()
    }
}

//! Composite node executing its children in declaration order

use std::fmt;

use async_trait::async_trait;

use super::node::{ExceptionHandler, ExceptionOutcome, Filter, Node, NodeRef};

/// An ordered list of child nodes. Built through [`ChainBuilder`](super::ChainBuilder).
///
/// A child failure that its own handler does not recover aborts the remaining
/// children and is routed through this chain's exception handler.
pub struct Chain<C>
where
    C: Send + 'static,
{
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) filter: Option<Filter<C>>,
    pub(crate) children: Vec<NodeRef<C>>,
    pub(crate) exception_handler: Option<ExceptionHandler<C>>,
}

impl<C> Chain<C>
where
    C: Send + 'static,
{
    pub fn children(&self) -> &[NodeRef<C>] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl<C> Node<C> for Chain<C>
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
        for child in &self.children {
            child.execute(context).await?;
        }
        Ok(())
    }

    async fn on_exception(&self, context: &mut C, error: anyhow::Error) -> ExceptionOutcome {
        match &self.exception_handler {
            Some(handler) => handler(context, error).await,
            None => ExceptionOutcome::Propagate(error),
        }
    }
}

impl<C> fmt::Debug for Chain<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children: Vec<&str> = self.children.iter().map(|c| c.title()).collect();
        f.debug_struct("Chain")
            .field("title", &self.title)
            .field("description", &self.description)
            .field("has_filter", &self.filter.is_some())
            .field("children", &children)
            .field("has_exception_handler", &self.exception_handler.is_some())
            .finish()
    }
}

//! Drives a context through a root node and settles its terminal status

use std::fmt;
use std::time::Instant;

use tracing::{debug, warn};

use super::builder::ChainBuilder;
use super::node::NodeRef;
use crate::context::{ContextStatus, ErrorRecord, ProcessingContext};

/// Entry point used by every caller of a pipeline (dispatch server, HTTP layer).
///
/// `exec` never fails: an error escaping the root is appended to the context as a
/// structured record, and the context always ends in `OK` or `FAIL`.
pub struct Processor<C>
where
    C: ProcessingContext,
{
    root: NodeRef<C>,
}

impl<C> Clone for Processor<C>
where
    C: ProcessingContext,
{
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<C> Processor<C>
where
    C: ProcessingContext,
{
    pub fn new(root: NodeRef<C>) -> Self {
        Self { root }
    }

    pub fn from_builder(builder: ChainBuilder<C>) -> Self {
        Self::new(builder.into_node())
    }

    pub fn root(&self) -> &NodeRef<C> {
        &self.root
    }

    pub async fn exec(&self, context: &mut C) {
        let started = Instant::now();

        if context.status() == ContextStatus::Init {
            context.set_status(ContextStatus::Run);
        }

        if let Err(error) = self.root.execute(context).await {
            warn!(
                pipeline = %self.root.title(),
                request_id = ?context.request_id(),
                operation = ?context.operation(),
                error = %error,
                "Unrecovered error escaped the pipeline"
            );
            context.add_error(ErrorRecord::from_error(&error));
        }

        if context.status() == ContextStatus::Run {
            let terminal = if context.has_errors() {
                ContextStatus::Fail
            } else {
                ContextStatus::Ok
            };
            context.set_status(terminal);
        }

        debug!(
            pipeline = %self.root.title(),
            request_id = ?context.request_id(),
            status = %context.status(),
            errors = context.errors().len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline execution finished"
        );
    }
}

impl<C> fmt::Debug for Processor<C>
where
    C: ProcessingContext,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("root", &self.root.title())
            .finish()
    }
}

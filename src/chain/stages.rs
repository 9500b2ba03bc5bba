//! Reusable pipeline stages shared by every service pipeline
//!
//! Service pipelines follow the same layout: one operation-scoped chain per
//! command, validation workers that record errors instead of aborting, a
//! `stop_on_errors` barrier, then the repository and response stages. Every stage
//! after the barrier is filtered on `RUN`, so a validation failure skips them.

use super::builder::{worker, ChainBuilder, WorkerBuilder};
use super::node::ExceptionOutcome;
use crate::context::{ContextStatus, ErrorRecord, ProcessingContext};

/// Chain that runs only for `op` while the context is still `RUN`
pub fn operation<C, F>(title: impl Into<String>, op: C::Operation, configure: F) -> ChainBuilder<C>
where
    C: ProcessingContext,
    C::Operation: 'static,
    F: FnOnce(ChainBuilder<C>) -> ChainBuilder<C>,
{
    let chain = ChainBuilder::new()
        .title(title)
        .test(move |context: &C| is_running(context) && *context.operation() == op);
    configure(chain)
}

/// Worker turning a running context with accumulated errors into `FAIL`
pub fn stop_on_errors<C>() -> WorkerBuilder<C>
where
    C: ProcessingContext,
{
    worker()
        .title("stop-on-errors")
        .description("Fail the request once validation recorded errors")
        .test(|context: &C| is_running(context))
        .handle_sync(|context| {
            if context.has_errors() {
                context.set_status(ContextStatus::Fail);
            }
            Ok(())
        })
}

/// Exception handler appending the failure as an error record and recovering
pub fn record_error<C>(context: &mut C, error: anyhow::Error) -> ExceptionOutcome
where
    C: ProcessingContext,
{
    context.add_error(ErrorRecord::from_error(&error));
    ExceptionOutcome::Recovered
}

/// Exception handler factory: the failure is recorded under the given code, group and
/// field, and the chain continues. Failures already carrying an [`ErrorRecord`] are
/// recorded unchanged.
pub fn fail_with<C>(
    code: impl Into<String>,
    group: impl Into<String>,
    field: impl Into<String>,
) -> impl Fn(&mut C, anyhow::Error) -> ExceptionOutcome + Send + Sync + 'static
where
    C: ProcessingContext,
{
    let code = code.into();
    let group = group.into();
    let field = field.into();

    move |context: &mut C, error: anyhow::Error| {
        let record = match error.downcast_ref::<ErrorRecord>() {
            Some(record) => record.clone(),
            None => {
                let fallback = ErrorRecord::from_error(&error);
                ErrorRecord {
                    code: code.clone(),
                    group: group.clone(),
                    field: field.clone(),
                    ..fallback
                }
            }
        };
        context.add_error(record);
        ExceptionOutcome::Recovered
    }
}

impl<C> ChainBuilder<C>
where
    C: ProcessingContext,
    C::Operation: 'static,
{
    /// Append an operation-scoped chain, see [`operation`]
    pub fn operation<F>(self, title: impl Into<String>, op: C::Operation, configure: F) -> Self
    where
        F: FnOnce(ChainBuilder<C>) -> ChainBuilder<C>,
    {
        self.add_chain(operation(title, op, configure))
    }

    /// Append a [`stop_on_errors`] barrier
    pub fn stop_on_errors(self) -> Self {
        self.add_worker(stop_on_errors())
    }
}

fn is_running<C: ProcessingContext>(context: &C) -> bool {
    context.status() == ContextStatus::Run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{root_chain, Processor};
    use crate::context::RequestContext;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    enum DictionaryCommand {
        #[default]
        Create,
        Delete,
    }

    type Ctx = RequestContext<DictionaryCommand, String, Vec<&'static str>>;

    fn pipeline() -> Processor<Ctx> {
        Processor::from_builder(
            root_chain::<Ctx>()
                .operation("create dictionary", DictionaryCommand::Create, |c| {
                    c.worker(|w| {
                        w.title("validate name")
                            .handle_sync(|ctx| {
                                if ctx.request.trim().is_empty() {
                                    anyhow::bail!("name is blank");
                                }
                                ctx.response.push("validated");
                                Ok(())
                            })
                            .on_exception(fail_with("empty-name", "validation", "name"))
                    })
                    .stop_on_errors()
                    .worker(|w| {
                        w.title("persist")
                            .test(|ctx: &Ctx| ctx.status == ContextStatus::Run)
                            .handle_sync(|ctx| {
                                ctx.response.push("created");
                                Ok(())
                            })
                    })
                })
                .operation("delete dictionary", DictionaryCommand::Delete, |c| {
                    c.worker(|w| {
                        w.handle_sync(|ctx| {
                            ctx.response.push("deleted");
                            Ok(())
                        })
                    })
                }),
        )
    }

    #[tokio::test]
    async fn test_operation_selects_branch() {
        let processor = pipeline();

        let mut ctx = Ctx::new(DictionaryCommand::Delete, "de-en".to_string());
        processor.exec(&mut ctx).await;

        assert_eq!(ctx.status, ContextStatus::Ok);
        assert_eq!(ctx.response, vec!["deleted"]);
    }

    #[tokio::test]
    async fn test_validation_error_stops_later_stages() {
        let processor = pipeline();

        let mut ctx = Ctx::new(DictionaryCommand::Create, "  ".to_string());
        processor.exec(&mut ctx).await;

        assert_eq!(ctx.status, ContextStatus::Fail);
        assert!(ctx.response.is_empty());
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].code, "empty-name");
        assert_eq!(ctx.errors[0].group, "validation");
        assert_eq!(ctx.errors[0].field, "name");
        assert_eq!(ctx.errors[0].message, "name is blank");
    }

    #[tokio::test]
    async fn test_happy_path_runs_every_stage() {
        let processor = pipeline();

        let mut ctx = Ctx::new(DictionaryCommand::Create, "de-en".to_string());
        processor.exec(&mut ctx).await;

        assert_eq!(ctx.status, ContextStatus::Ok);
        assert_eq!(ctx.response, vec!["validated", "created"]);
    }

    #[tokio::test]
    async fn test_record_error_keeps_existing_record() {
        let processor = Processor::from_builder(root_chain::<Ctx>().worker(|w| {
            w.handle_sync(|_| Err(ErrorRecord::new("not-found", "repository", "id", "missing").into()))
                .on_exception(record_error)
        }));

        let mut ctx = Ctx::new(DictionaryCommand::Create, "x".to_string());
        processor.exec(&mut ctx).await;

        assert_eq!(ctx.status, ContextStatus::Fail);
        assert_eq!(ctx.errors[0].code, "not-found");
    }
}

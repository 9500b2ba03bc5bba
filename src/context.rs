//! # Request Context
//!
//! The per-request state bag threaded through every node of a pipeline.
//!
//! The engine itself is generic over any `Send` context type; the
//! [`ProcessingContext`] trait is what the [`Processor`](crate::chain::Processor)
//! and the dispatch server need on top of that: an operation selector, a status
//! lifecycle and an append-only error list. [`RequestContext`] is a ready-made
//! implementation for services whose request and response payloads are plain
//! serde types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextStatus {
    /// Created, pipeline not started yet
    #[default]
    Init,
    /// Pipeline is executing
    Run,
    /// Pipeline finished without errors
    Ok,
    /// Pipeline finished with errors
    Fail,
}

impl ContextStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextStatus::Ok | ContextStatus::Fail)
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextStatus::Init => "INIT",
            ContextStatus::Run => "RUN",
            ContextStatus::Ok => "OK",
            ContextStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// Structured error accumulated in a context
///
/// Also usable as an error value: a worker can fail with
/// `Err(ErrorRecord::new(..).into())` and the record survives propagation
/// unchanged (see [`ErrorRecord::from_error`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{group}/{code}: {message}")]
pub struct ErrorRecord {
    pub code: String,
    pub group: String,
    pub field: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorRecord {
    pub const UNEXPECTED_CODE: &'static str = "unexpected";
    pub const EXCEPTIONS_GROUP: &'static str = "exceptions";

    pub fn new(
        code: impl Into<String>,
        group: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            group: group.into(),
            field: field.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The generic record replied when a request could not be processed at all
    pub fn unexpected() -> Self {
        Self::new(
            Self::UNEXPECTED_CODE,
            Self::EXCEPTIONS_GROUP,
            "",
            "Unexpected error",
        )
    }

    /// Convert a pipeline failure into a record.
    ///
    /// A failure that already carries an `ErrorRecord` is returned as-is; anything
    /// else becomes an `unexpected` record with the source chain as its cause.
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(record) = error.downcast_ref::<ErrorRecord>() {
            return record.clone();
        }

        let causes: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        let record = Self::new(
            Self::UNEXPECTED_CODE,
            Self::EXCEPTIONS_GROUP,
            "",
            error.to_string(),
        );
        if causes.is_empty() {
            record
        } else {
            record.with_cause(causes.join(": "))
        }
    }
}

/// What the pipeline runtime needs from a context
pub trait ProcessingContext: Send + 'static {
    /// Selects the pipeline variant, typically a per-domain command enum
    type Operation: PartialEq + fmt::Debug + Send + Sync;

    fn operation(&self) -> &Self::Operation;

    fn status(&self) -> ContextStatus;

    fn set_status(&mut self, status: ContextStatus);

    fn errors(&self) -> &[ErrorRecord];

    /// Append an error. Implementations must never drop or reorder earlier entries.
    fn add_error(&mut self, error: ErrorRecord);

    /// Correlation id used in logs
    fn request_id(&self) -> Option<String> {
        None
    }

    fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    fn fail(&mut self, error: ErrorRecord) {
        self.add_error(error);
        self.set_status(ContextStatus::Fail);
    }

    /// A fresh context carrying only the generic `unexpected` error
    fn unexpected_failure() -> Self
    where
        Self: Default + Sized,
    {
        let mut context = Self::default();
        context.fail(ErrorRecord::unexpected());
        context
    }
}

/// General purpose context for services with serde request/response payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext<Op, Req, Res> {
    pub request_id: Uuid,
    pub operation: Op,
    #[serde(default)]
    pub status: ContextStatus,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub request: Req,
    #[serde(default)]
    pub response: Res,
    pub started_at: DateTime<Utc>,
}

impl<Op, Req, Res> RequestContext<Op, Req, Res>
where
    Res: Default,
{
    pub fn new(operation: Op, request: Req) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            operation,
            status: ContextStatus::Init,
            errors: Vec::new(),
            request,
            response: Res::default(),
            started_at: Utc::now(),
        }
    }
}

impl<Op, Req, Res> Default for RequestContext<Op, Req, Res>
where
    Op: Default,
    Req: Default,
    Res: Default,
{
    fn default() -> Self {
        Self::new(Op::default(), Req::default())
    }
}

impl<Op, Req, Res> ProcessingContext for RequestContext<Op, Req, Res>
where
    Op: PartialEq + fmt::Debug + Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    type Operation = Op;

    fn operation(&self) -> &Op {
        &self.operation
    }

    fn status(&self) -> ContextStatus {
        self.status
    }

    fn set_status(&mut self, status: ContextStatus) {
        self.status = status;
    }

    fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    fn add_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
    }

    fn request_id(&self) -> Option<String> {
        Some(self.request_id.to_string())
    }
}

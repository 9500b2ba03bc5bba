//! # Structured Logging Module
//!
//! Environment-aware structured logging for the dispatch runtime and pipelines.
//! Human-readable console output by default, JSON lines when configured.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{CoreConfig, LoggingConfig};
use crate::context::ErrorRecord;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
///
/// Filter precedence: `LoggingConfig::level`, then `RUST_LOG`, then the default for
/// the detected environment.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = CoreConfig::detect_environment();
        let filter = build_filter(config.level.as_deref(), &environment);

        let layer = if config.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = config.json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn build_filter(level: Option<&str>, environment: &str) -> EnvFilter {
    if let Some(filter) = level.and_then(|level| EnvFilter::try_new(level).ok()) {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(get_log_level(environment)))
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "test" | "development" => "debug",
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for dispatch server operations
pub fn log_dispatch_operation(
    operation: &str,
    topic: &str,
    group: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        topic = %topic,
        group = %group,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 DISPATCH_OPERATION"
    );
}

/// Log every error accumulated by a finished pipeline
pub fn log_pipeline_errors(topic: &str, request_id: Option<&str>, errors: &[ErrorRecord]) {
    for (index, error) in errors.iter().enumerate() {
        tracing::warn!(
            topic = %topic,
            request_id = request_id,
            index = index,
            code = %error.code,
            group = %error.group,
            field = %error.field,
            message = %error.message,
            cause = error.cause.as_deref(),
            "⚠️ PIPELINE_ERROR"
        );
    }
}

/// Log structured data for connection lifecycle changes
pub fn log_connection_event(client: &str, event: &str, details: Option<&str>) {
    tracing::info!(
        client = %client,
        event = %event,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔌 CONNECTION_EVENT"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_explicit_level_wins() {
        let filter = build_filter(Some("warn,flashcards_core=trace"), "production");
        assert!(filter.to_string().contains("flashcards_core=trace"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
        log_pipeline_errors("cards", Some("req-1"), &[ErrorRecord::unexpected()]);
    }
}

//! Graceful process shutdown
//!
//! On a termination signal: close every dispatch server so no new deliveries start,
//! wait for in-flight executions up to the configured timeout, then close the
//! connection supervisor.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use super::supervisor::ConnectionSupervisor;
use crate::error::Result;

/// A server that can be closed and drained during shutdown
#[async_trait]
pub trait ManagedServer: Send + Sync {
    fn server_name(&self) -> String;

    /// Stop accepting new work
    async fn shutdown(&self) -> Result<()>;

    /// Wait for in-flight work; false when the timeout expired first
    async fn drain(&self, timeout: Duration) -> bool;
}

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every server drained within the timeout
    pub drained: bool,
    /// Servers still running work when the timeout expired
    pub undrained: Vec<String>,
    pub elapsed_ms: u64,
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Wait for `signal`, then shut everything down gracefully
pub async fn run_until<F>(
    signal: F,
    servers: &[Arc<dyn ManagedServer>],
    supervisor: Option<&ConnectionSupervisor>,
    timeout: Duration,
) -> ShutdownReport
where
    F: Future<Output = ()>,
{
    signal.await;
    shutdown_all(servers, supervisor, timeout).await
}

/// Wait for Ctrl-C/SIGTERM, then shut everything down gracefully
pub async fn run_until_shutdown(
    servers: &[Arc<dyn ManagedServer>],
    supervisor: Option<&ConnectionSupervisor>,
    timeout: Duration,
) -> ShutdownReport {
    run_until(shutdown_signal(), servers, supervisor, timeout).await
}

/// Close servers, drain them within `timeout`, then close the supervisor
pub async fn shutdown_all(
    servers: &[Arc<dyn ManagedServer>],
    supervisor: Option<&ConnectionSupervisor>,
    timeout: Duration,
) -> ShutdownReport {
    let started = Instant::now();
    info!(
        servers = servers.len(),
        timeout_ms = timeout.as_millis() as u64,
        "Graceful shutdown started"
    );

    for server in servers {
        if let Err(e) = server.shutdown().await {
            warn!(server = %server.server_name(), error = %e, "Server close failed");
        }
    }

    let mut undrained = Vec::new();
    for server in servers {
        let remaining = timeout.saturating_sub(started.elapsed());
        if !server.drain(remaining).await {
            warn!(server = %server.server_name(), "In-flight executions did not finish before the shutdown timeout");
            undrained.push(server.server_name());
        }
    }

    if let Some(supervisor) = supervisor {
        if let Err(e) = supervisor.close().await {
            warn!(error = %e, "Connection supervisor close failed");
        }
    }

    let report = ShutdownReport {
        drained: undrained.is_empty(),
        undrained,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        drained = report.drained,
        elapsed_ms = report.elapsed_ms,
        "Graceful shutdown finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeServer {
        closed: AtomicBool,
        drains: bool,
    }

    #[async_trait]
    impl ManagedServer for FakeServer {
        fn server_name(&self) -> String {
            "fake".to_string()
        }

        async fn shutdown(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn drain(&self, _timeout: Duration) -> bool {
            self.drains
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_undrained_servers() {
        let ok = Arc::new(FakeServer {
            closed: AtomicBool::new(false),
            drains: true,
        });
        let stuck = Arc::new(FakeServer {
            closed: AtomicBool::new(false),
            drains: false,
        });
        let servers: Vec<Arc<dyn ManagedServer>> = vec![ok.clone(), stuck.clone()];

        let report = run_until(async {}, &servers, None, Duration::from_millis(50)).await;

        assert!(ok.closed.load(Ordering::SeqCst));
        assert!(stuck.closed.load(Ordering::SeqCst));
        assert!(!report.drained);
        assert_eq!(report.undrained, vec!["fake".to_string()]);
    }
}

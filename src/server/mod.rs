//! # Server Runtime
//!
//! Message-driven runtime around the pipeline engine:
//!
//! - [`DispatchServer`]: one broker subscription feeding one pipeline
//! - [`ConnectionSupervisor`]: reconnects, heartbeats and forced resubscription
//! - [`HealthCheck`]: up/down report for the health endpoint
//! - [`shutdown`]: graceful termination on Ctrl-C/SIGTERM

pub mod dispatch;
pub mod health;
pub mod shutdown;
pub mod supervisor;

pub use dispatch::{
    ContextInitializer, DispatchServer, DispatchServerBuilder, DispatchStats, ServerState,
};
pub use health::{BrokerHealth, ComponentHealth, HealthCheck, HealthReport, HealthStatus, LivenessProbe};
pub use shutdown::{run_until, run_until_shutdown, shutdown_all, ManagedServer, ShutdownReport};
pub use supervisor::{
    ConnectionPhase, ConnectionSupervisor, Liveness, SubscriptionOwner, SupervisorStats,
};

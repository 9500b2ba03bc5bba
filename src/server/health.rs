//! Service health reporting
//!
//! Combines broker liveness from the [`ConnectionSupervisor`] with an optional
//! datastore probe into one up/down report for the health endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::supervisor::{ConnectionPhase, ConnectionSupervisor};

/// Liveness check of an external dependency, e.g. a datastore ping
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn is_alive(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    fn from_bool(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    }
}

/// Health of the broker connection
#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub status: HealthStatus,
    pub phase: ConnectionPhase,
    pub phase_duration_ms: u64,
}

/// Health of a probed dependency
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub broker: BrokerHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore: Option<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Health check for one service
#[derive(Clone)]
pub struct HealthCheck {
    supervisor: ConnectionSupervisor,
    probe: Option<Arc<dyn LivenessProbe>>,
}

impl HealthCheck {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self {
            supervisor,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Up only when the broker is healthy and the probe, if any, answers alive
    pub async fn report(&self) -> HealthReport {
        let liveness = self.supervisor.liveness();
        let broker = BrokerHealth {
            status: HealthStatus::from_bool(liveness.healthy),
            phase: liveness.phase,
            phase_duration_ms: liveness.phase_duration_ms,
        };

        let datastore = match &self.probe {
            Some(probe) => Some(ComponentHealth {
                name: probe.name().to_string(),
                status: HealthStatus::from_bool(probe.is_alive().await),
            }),
            None => None,
        };

        let up = broker.status == HealthStatus::Up
            && datastore
                .as_ref()
                .map_or(true, |d| d.status == HealthStatus::Up);

        let report = HealthReport {
            status: HealthStatus::from_bool(up),
            broker,
            datastore,
            checked_at: Utc::now(),
        };
        debug!(status = ?report.status, phase = ?report.broker.phase, "Health check evaluated");
        report
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("supervisor", &self.supervisor)
            .field("probe", &self.probe.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::messaging::InMemoryBroker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct DatastoreProbe {
        alive: AtomicBool,
    }

    #[async_trait]
    impl LivenessProbe for DatastoreProbe {
        fn name(&self) -> &str {
            "postgres"
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn supervisor(broker: &InMemoryBroker) -> ConnectionSupervisor {
        let config = ConnectionConfig {
            reconnect_delay_ms: 10,
            ping_interval_ms: 50,
            health_grace_period_ms: 30_000,
        };
        ConnectionSupervisor::new(Arc::new(broker.client("svc")), config).unwrap()
    }

    #[tokio::test]
    async fn test_report_combines_broker_and_probe() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);
        supervisor.start().await.unwrap();
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

        let probe = Arc::new(DatastoreProbe {
            alive: AtomicBool::new(true),
        });
        let health = HealthCheck::new(supervisor.clone()).with_probe(probe.clone());

        let report = health.report().await;
        assert!(report.is_up());
        assert_eq!(report.broker.phase, ConnectionPhase::Connected);

        probe.alive.store(false, Ordering::SeqCst);
        let report = health.report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert_eq!(report.broker.status, HealthStatus::Up);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "DOWN");
        assert_eq!(json["datastore"]["name"], "postgres");

        supervisor.close().await.unwrap();
        let report = HealthCheck::new(supervisor).report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.datastore.is_none());
    }
}

//! # Connection Supervisor
//!
//! Owns the broker connection lifecycle:
//!
//! - **Reconnect**: unlimited attempts with a fixed delay, started on the initial
//!   connect, on `Disconnected` events and on failed heartbeats
//! - **Heartbeat**: periodic `ping` to detect silently dead connections
//! - **Resubscription**: `Reconnected`/`Resubscribed` events force every registered
//!   [`SubscriptionOwner`] to recreate its subscription
//! - **Liveness**: healthy while connected, and for a grace period while (re)connecting

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::error::{CoreError, Result};
use crate::logging::{log_connection_event, log_error};
use crate::messaging::{BrokerClient, ConnectionEvent};

/// Something holding a broker subscription that must be recreated after a reconnect
#[async_trait]
pub trait SubscriptionOwner: Send + Sync {
    fn owner_name(&self) -> String;

    /// Drop any stale subscription and subscribe again. Must be idempotent.
    async fn force_resubscribe(&self) -> Result<()>;
}

/// Connection phase as tracked by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Not started yet
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl From<u8> for ConnectionPhase {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionPhase::Idle,
            1 => ConnectionPhase::Connecting,
            2 => ConnectionPhase::Connected,
            3 => ConnectionPhase::Reconnecting,
            _ => ConnectionPhase::Closed,
        }
    }
}

/// Point-in-time liveness of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub healthy: bool,
    pub phase: ConnectionPhase,
    /// Time spent in the current phase
    pub phase_duration_ms: u64,
}

/// Statistics for supervisor observability
#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub connection_attempts: AtomicU64,
    pub reconnects: AtomicU64,
    pub failed_pings: AtomicU64,
    pub forced_resubscriptions: AtomicU64,
}

impl SupervisorStats {
    pub fn get_connection_attempts(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn get_reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn get_failed_pings(&self) -> u64 {
        self.failed_pings.load(Ordering::Relaxed)
    }

    pub fn get_forced_resubscriptions(&self) -> u64 {
        self.forced_resubscriptions.load(Ordering::Relaxed)
    }
}

struct SupervisorShared {
    client: Arc<dyn BrokerClient>,
    config: ConnectionConfig,
    owners: RwLock<Vec<Arc<dyn SubscriptionOwner>>>,
    phase: AtomicU8,
    phase_since: Mutex<Instant>,
    started: AtomicBool,
    connecting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SupervisorStats>,
}

/// Supervises one broker client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<SupervisorShared>,
}

impl ConnectionSupervisor {
    pub fn new(client: Arc<dyn BrokerClient>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(SupervisorShared {
                client,
                config,
                owners: RwLock::new(Vec::new()),
                phase: AtomicU8::new(ConnectionPhase::Idle as u8),
                phase_since: Mutex::new(Instant::now()),
                started: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                stats: Arc::new(SupervisorStats::default()),
            }),
        })
    }

    pub fn client(&self) -> &Arc<dyn BrokerClient> {
        &self.shared.client
    }

    /// Register a subscription owner for forced resubscription after reconnects
    pub fn register(&self, owner: Arc<dyn SubscriptionOwner>) {
        debug!(owner = %owner.owner_name(), "Registered subscription owner");
        self.shared.owners.write().push(owner);
    }

    /// Start connecting, listening for connection events and pinging
    ///
    /// Returns immediately; the initial connection is established in the background
    /// with unlimited attempts.
    #[instrument(skip(self), fields(client = %self.shared.client.client_type()))]
    pub async fn start(&self) -> Result<()> {
        if self.phase() == ConnectionPhase::Closed {
            warn!("Connection supervisor already closed, not starting");
            return Err(CoreError::ShutdownInProgress);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!("Connection supervisor already started");
            return Ok(());
        }

        info!(
            reconnect_delay_ms = self.shared.config.reconnect_delay_ms,
            ping_interval_ms = self.shared.config.ping_interval_ms,
            health_grace_period_ms = self.shared.config.health_grace_period_ms,
            "Starting connection supervisor"
        );

        // Subscribe to events before connecting so the first transition is observed
        let events = self.shared.client.events();
        let event_task = tokio::spawn(self.clone().event_loop(events));
        let heartbeat_task = tokio::spawn(self.clone().heartbeat_loop());
        {
            let mut tasks = self.shared.tasks.lock();
            tasks.push(event_task);
            tasks.push(heartbeat_task);
        }

        self.spawn_connect(ConnectionPhase::Connecting);
        Ok(())
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from(self.shared.phase.load(Ordering::Acquire))
    }

    pub fn liveness(&self) -> Liveness {
        let phase = self.phase();
        let elapsed = self.shared.phase_since.lock().elapsed();
        let healthy = match phase {
            ConnectionPhase::Connected => true,
            ConnectionPhase::Closed => false,
            ConnectionPhase::Idle | ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                elapsed < self.shared.config.health_grace_period()
            }
        };
        Liveness {
            healthy,
            phase,
            phase_duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.liveness().healthy
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        self.shared.stats.clone()
    }

    /// Wait until the client is connected, up to `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.phase() == ConnectionPhase::Connected {
                return true;
            }
            if Instant::now() >= deadline || self.phase() == ConnectionPhase::Closed {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Force every registered owner to resubscribe
    pub async fn resubscribe_all(&self) {
        let owners: Vec<Arc<dyn SubscriptionOwner>> = self.shared.owners.read().clone();
        for owner in owners {
            self.shared
                .stats
                .forced_resubscriptions
                .fetch_add(1, Ordering::Relaxed);
            if let Err(e) = owner.force_resubscribe().await {
                log_error(
                    "supervisor",
                    "force_resubscribe",
                    &e.to_string(),
                    Some(&owner.owner_name()),
                );
            }
        }
    }

    /// Stop reconnecting, event handling and heartbeats, then close the client.
    /// Idempotent.
    #[instrument(skip(self), fields(client = %self.shared.client.client_type()))]
    pub async fn close(&self) -> Result<()> {
        let previous = self.set_phase(ConnectionPhase::Closed);
        if previous == ConnectionPhase::Closed {
            debug!("Connection supervisor already closed");
            return Ok(());
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            task.abort();
        }

        self.shared.client.close().await?;
        info!("Connection supervisor closed");
        Ok(())
    }

    fn set_phase(&self, phase: ConnectionPhase) -> ConnectionPhase {
        let mut since = self.shared.phase_since.lock();
        let previous = ConnectionPhase::from(self.shared.phase.swap(phase as u8, Ordering::AcqRel));
        if previous == ConnectionPhase::Closed && phase != ConnectionPhase::Closed {
            // Closed is terminal
            self.shared.phase.store(ConnectionPhase::Closed as u8, Ordering::Release);
            return previous;
        }
        if previous != phase {
            *since = Instant::now();
        }
        previous
    }

    /// Spawn the connect loop unless one is already running
    fn spawn_connect(&self, phase: ConnectionPhase) {
        if self.phase() == ConnectionPhase::Closed {
            return;
        }
        if self.shared.connecting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_phase(phase);
        let reconnect = phase == ConnectionPhase::Reconnecting;
        let task = tokio::spawn(self.clone().connect_loop(reconnect));
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn connect_loop(self, reconnect: bool) {
        let delay = self.shared.config.reconnect_delay();
        let client_type = self.shared.client.client_type();

        loop {
            if self.phase() == ConnectionPhase::Closed {
                break;
            }

            let attempt = self
                .shared
                .stats
                .connection_attempts
                .fetch_add(1, Ordering::Relaxed)
                + 1;

            match self.shared.client.connect().await {
                Ok(()) => {
                    self.set_phase(ConnectionPhase::Connected);
                    if reconnect {
                        self.shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    info!(client = %client_type, attempt = attempt, "Broker connection established");
                    break;
                }
                Err(e) => {
                    warn!(
                        client = %client_type,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.shared.connecting.store(false, Ordering::Release);

        // A disconnect reported while the flag was still set was ignored by spawn_connect
        if self.phase() != ConnectionPhase::Closed && !self.shared.client.is_connected() {
            debug!(client = %client_type, "Connection lost right after connecting, reconnecting");
            self.spawn_connect(ConnectionPhase::Reconnecting);
        }
    }

    async fn event_loop(self, mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
        let client_type = self.shared.client.client_type();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Connection event receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            log_connection_event(client_type, &event.to_string(), None);

            match event {
                ConnectionEvent::Connected => {
                    self.set_phase(ConnectionPhase::Connected);
                }
                ConnectionEvent::Disconnected => {
                    self.spawn_connect(ConnectionPhase::Reconnecting);
                }
                ConnectionEvent::Reconnected | ConnectionEvent::Resubscribed => {
                    self.set_phase(ConnectionPhase::Connected);
                    self.resubscribe_all().await;
                }
                ConnectionEvent::Closed => break,
            }
        }
        debug!("Connection event loop exited");
    }

    async fn heartbeat_loop(self) {
        let mut interval = tokio::time::interval(self.shared.config.ping_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.phase() {
                ConnectionPhase::Closed => break,
                ConnectionPhase::Connected => {}
                _ => continue,
            }

            if let Err(e) = self.shared.client.ping().await {
                self.shared.stats.failed_pings.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Broker ping failed, reconnecting");
                self.spawn_connect(ConnectionPhase::Reconnecting);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("client", &self.shared.client.client_type())
            .field("phase", &self.phase())
            .field("owners", &self.shared.owners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay_ms: 10,
            ping_interval_ms: 20,
            health_grace_period_ms: 30_000,
        }
    }

    struct CountingOwner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionOwner for CountingOwner {
        fn owner_name(&self) -> String {
            "counting".to_string()
        }

        async fn force_resubscribe(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_phase_u8_conversion() {
        assert_eq!(ConnectionPhase::from(2), ConnectionPhase::Connected);
        assert_eq!(ConnectionPhase::from(200), ConnectionPhase::Closed);
    }

    #[tokio::test]
    async fn test_retries_until_reachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let client = Arc::new(broker.client("svc"));
        let supervisor = ConnectionSupervisor::new(client.clone(), fast_config()).unwrap();

        supervisor.start().await.unwrap();
        assert!(!supervisor.wait_connected(Duration::from_millis(60)).await);
        assert!(supervisor.stats().get_connection_attempts() >= 2);
        assert!(supervisor.is_healthy(), "still inside the grace period");

        broker.set_reachable(true);
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);
        assert!(client.is_connected());

        supervisor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_forces_resubscription() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(broker.client("svc"));
        let supervisor = ConnectionSupervisor::new(client.clone(), fast_config()).unwrap();
        let owner = Arc::new(CountingOwner {
            calls: AtomicUsize::new(0),
        });
        supervisor.register(owner.clone());

        supervisor.start().await.unwrap();
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);
        assert_eq!(owner.calls.load(Ordering::SeqCst), 0);

        broker.drop_connections();

        let deadline = Instant::now() + Duration::from_secs(2);
        while owner.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(owner.calls.load(Ordering::SeqCst), 1);
        assert!(client.is_connected());
        assert_eq!(supervisor.stats().get_reconnects(), 1);

        supervisor.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_back_to_back_drops_recover_without_heartbeat() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(broker.client("svc"));
        let config = ConnectionConfig {
            ping_interval_ms: 60_000,
            ..fast_config()
        };
        let supervisor = ConnectionSupervisor::new(client.clone(), config).unwrap();
        supervisor.start().await.unwrap();
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

        for round in 0..25 {
            client.drop_connection();
            let deadline = Instant::now() + Duration::from_secs(1);
            while !client.is_connected() && Instant::now() < deadline {
                tokio::task::yield_now().await;
            }
            assert!(client.is_connected(), "not reconnected after drop {round}");
        }

        assert_eq!(supervisor.stats().get_failed_pings(), 0);
        assert!(supervisor.wait_connected(Duration::from_secs(1)).await);
        supervisor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_detects_dead_connection() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(broker.client("svc"));
        let supervisor = ConnectionSupervisor::new(client.clone(), fast_config()).unwrap();
        supervisor.start().await.unwrap();
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

        broker.set_reachable(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while supervisor.stats().get_failed_pings() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(supervisor.stats().get_failed_pings() >= 1);
        assert_ne!(supervisor.phase(), ConnectionPhase::Connected);

        broker.set_reachable(true);
        assert!(supervisor.wait_connected(Duration::from_secs(2)).await);
        supervisor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_liveness_grace_period_and_close() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let client = Arc::new(broker.client("svc"));
        let config = ConnectionConfig {
            health_grace_period_ms: 30,
            ..fast_config()
        };
        let supervisor = ConnectionSupervisor::new(client, config).unwrap();
        supervisor.start().await.unwrap();

        assert!(supervisor.is_healthy());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let liveness = supervisor.liveness();
        assert!(!liveness.healthy);
        assert_eq!(liveness.phase, ConnectionPhase::Connecting);

        supervisor.close().await.unwrap();
        supervisor.close().await.unwrap();
        assert_eq!(supervisor.phase(), ConnectionPhase::Closed);
        assert!(!supervisor.is_healthy());

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, CoreError::ShutdownInProgress));
    }
}

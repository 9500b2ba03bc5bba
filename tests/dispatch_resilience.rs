//! Dispatch runtime under connection loss
//!
//! Drives a dispatch server, its connection supervisor and a separate caller
//! through the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use flashcards_core::config::ConnectionConfig;
use flashcards_core::context::ContextStatus;
use flashcards_core::messaging::{BrokerClient, InMemoryBroker, JsonCodec};
use flashcards_core::server::{
    shutdown_all, ConnectionPhase, ConnectionSupervisor, DispatchServer, HealthCheck,
    HealthStatus, ManagedServer, SubscriptionOwner,
};
use futures::future::join_all;

use common::{
    doubling_processor, fast_connection_config, fast_dispatch_config, ConcurrencyProbe,
    LearnCommand, LearnContext,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_request_answered_once_across_connection_loss() {
    let broker = InMemoryBroker::new();
    let server_client = Arc::new(broker.client("learn-service"));

    let supervisor =
        ConnectionSupervisor::new(server_client.clone(), fast_connection_config()).unwrap();
    supervisor.start().await.unwrap();
    assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

    let probe = Arc::new(ConcurrencyProbe::default());
    let server = DispatchServer::new(
        fast_dispatch_config("learn", 4),
        server_client.clone(),
        doubling_processor(probe.clone(), Duration::from_millis(15)),
        JsonCodec::<LearnContext>::new(),
    )
    .unwrap();
    supervisor.register(Arc::new(server.clone()) as Arc<dyn SubscriptionOwner>);
    server.start().await.unwrap();
    assert!(server.ready());

    let caller = Arc::new(broker.client("caller"));
    caller.connect().await.unwrap();

    let requests: Vec<LearnContext> = (0..40)
        .map(|i| LearnContext::new(LearnCommand::Score, i))
        .collect();
    let calls = requests.iter().map(|request| {
        let caller = caller.clone();
        let payload = serde_json::to_vec(request).unwrap();
        async move { caller.request("learn", payload, REQUEST_TIMEOUT).await }
    });

    let outage = {
        let server_client = server_client.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            server_client.drop_connection();
        }
    };

    let (replies, ()) = tokio::join!(join_all(calls), outage);

    for (request, reply) in requests.iter().zip(replies) {
        let reply = reply.unwrap();
        let context: LearnContext = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(context.request_id, request.request_id);
        assert_eq!(context.status, ContextStatus::Ok);
        assert_eq!(context.response, request.request * 2);
    }

    assert!(wait_until(Duration::from_secs(2), || server.ready()).await);
    assert!(server.wait_for_drain(Duration::from_secs(2)).await);

    let stats = server.stats();
    assert_eq!(stats.get_messages_received(), 40);
    assert_eq!(stats.get_replies_sent(), 40);
    assert_eq!(stats.get_reply_failures(), 0);
    assert_eq!(broker.stray_replies(), 0);
    assert!(probe.max() >= 1);
    assert!(probe.max() <= 4, "max concurrency was {}", probe.max());
    assert!(supervisor.stats().get_reconnects() >= 1);
    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);

    let servers: Vec<Arc<dyn ManagedServer>> = vec![Arc::new(server.clone())];
    let report = shutdown_all(&servers, Some(&supervisor), Duration::from_secs(2)).await;
    assert!(report.drained);
    assert!(report.undrained.is_empty());
    assert!(!server.is_running());
    assert_eq!(supervisor.phase(), ConnectionPhase::Closed);
    assert!(!server_client.is_connected());
}

#[tokio::test]
async fn requests_sent_before_start_are_processed_after_subscribe() {
    let broker = InMemoryBroker::new();
    let server_client = Arc::new(broker.client("learn-service"));
    server_client.connect().await.unwrap();

    let producer = broker.client("producer");
    producer.connect().await.unwrap();
    for i in 0..3 {
        let request = LearnContext::new(LearnCommand::Score, i);
        producer
            .publish("retained", serde_json::to_vec(&request).unwrap(), None)
            .await
            .unwrap();
    }
    assert_eq!(broker.retained("retained"), 3);

    let probe = Arc::new(ConcurrencyProbe::default());
    let server = DispatchServer::new(
        fast_dispatch_config("retained", 2),
        server_client,
        doubling_processor(probe, Duration::ZERO),
        JsonCodec::<LearnContext>::new(),
    )
    .unwrap();
    server.start().await.unwrap();

    let stats = server.stats();
    assert!(wait_until(Duration::from_secs(2), || stats.get_messages_received() == 3).await);
    assert!(server.wait_for_drain(Duration::from_secs(2)).await);
    // No reply address, so nothing is published back
    assert_eq!(stats.get_replies_sent(), 0);
    assert_eq!(broker.retained("retained"), 0);
    server.close().await.unwrap();
}

#[tokio::test]
async fn health_goes_down_while_broker_unreachable_past_grace_period() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);

    let config = ConnectionConfig {
        health_grace_period_ms: 50,
        ..fast_connection_config()
    };
    let supervisor = ConnectionSupervisor::new(Arc::new(broker.client("svc")), config).unwrap();
    let health = HealthCheck::new(supervisor.clone());
    supervisor.start().await.unwrap();

    assert_eq!(health.report().await.status, HealthStatus::Up);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = health.report().await;
    assert_eq!(report.status, HealthStatus::Down);
    assert_eq!(report.broker.phase, ConnectionPhase::Connecting);
    assert!(supervisor.stats().get_connection_attempts() > 1);

    broker.set_reachable(true);
    assert!(supervisor.wait_connected(Duration::from_secs(2)).await);
    assert!(health.report().await.is_up());
    assert_eq!(supervisor.stats().get_reconnects(), 0);

    supervisor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_with_owned_connection_still_replies_to_in_flight_request() {
    let broker = InMemoryBroker::new();
    let server_client = Arc::new(broker.client("learn-service"));
    server_client.connect().await.unwrap();

    let config = flashcards_core::config::DispatchConfig {
        owns_connection: true,
        ..fast_dispatch_config("owned", 1)
    };
    let probe = Arc::new(ConcurrencyProbe::default());
    let server = DispatchServer::new(
        config,
        server_client.clone(),
        doubling_processor(probe, Duration::from_millis(200)),
        JsonCodec::<LearnContext>::new(),
    )
    .unwrap();
    server.start().await.unwrap();

    let caller = Arc::new(broker.client("caller"));
    caller.connect().await.unwrap();
    let request = LearnContext::new(LearnCommand::Score, 21);
    let payload = serde_json::to_vec(&request).unwrap();
    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.request("owned", payload, REQUEST_TIMEOUT).await })
    };

    assert!(wait_until(Duration::from_secs(1), || server.in_flight() == 1).await);

    let servers: Vec<Arc<dyn ManagedServer>> = vec![Arc::new(server.clone())];
    let report = shutdown_all(&servers, None, Duration::from_secs(2)).await;
    assert!(report.drained);

    let reply = pending.await.unwrap().unwrap();
    let context: LearnContext = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(context.response, 42);
    assert_eq!(server.stats().get_replies_sent(), 1);
    assert_eq!(server.stats().get_reply_failures(), 0);
    assert!(!server_client.is_connected());
}

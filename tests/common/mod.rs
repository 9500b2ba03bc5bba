#![allow(dead_code)]

pub mod strategies;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flashcards_core::chain::{root_chain, Processor};
use flashcards_core::config::{ConnectionConfig, DispatchConfig};
use flashcards_core::context::RequestContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum LearnCommand {
    #[default]
    Score,
}

pub type LearnContext = RequestContext<LearnCommand, i64, i64>;

/// Tracks how many pipeline executions run at the same time
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Doubles the request after a short pause, recording concurrency
pub fn doubling_processor(probe: Arc<ConcurrencyProbe>, pause: Duration) -> Processor<LearnContext> {
    Processor::from_builder(root_chain::<LearnContext>().worker(move |w| {
        w.title("double").handle(move |ctx| {
            let probe = probe.clone();
            Box::pin(async move {
                probe.enter();
                tokio::time::sleep(pause).await;
                ctx.response = ctx.request * 2;
                probe.exit();
                Ok(())
            })
        })
    }))
}

pub fn fast_dispatch_config(topic: &str, max_concurrency: usize) -> DispatchConfig {
    DispatchConfig {
        max_concurrency,
        keepalive_interval_ms: 10,
        graceful_shutdown_timeout_ms: 2_000,
        ..DispatchConfig::new(topic, format!("{topic}-workers"))
    }
}

pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delay_ms: 10,
        ping_interval_ms: 25,
        health_grace_period_ms: 30_000,
    }
}

//! Periodic polling: one independent timeline per source kind, plus a cache
//! eviction timeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{CycleReport, Engine};
use crate::feed::Subscription;
use crate::sink::DeliverySink;

/// Eviction runs this many poll intervals apart.
const EVICTION_INTERVAL_FACTOR: u32 = 10;

pub struct Scheduler {
    engine: Engine,
    sink: Arc<dyn DeliverySink>,
    timelines: BTreeMap<Arc<str>, Vec<Subscription>>,
    poll_interval: Duration,
    eviction_interval: Duration,
}

impl Scheduler {
    /// Group `subscriptions` by kind, keeping their configured order within
    /// each kind.
    pub fn new(
        engine: Engine,
        sink: Arc<dyn DeliverySink>,
        subscriptions: Vec<Subscription>,
        poll_interval: Duration,
    ) -> Self {
        let mut timelines: BTreeMap<Arc<str>, Vec<Subscription>> = BTreeMap::new();
        for subscription in subscriptions {
            timelines
                .entry(subscription.kind.clone())
                .or_default()
                .push(subscription);
        }
        Self {
            engine,
            sink,
            timelines,
            poll_interval,
            eviction_interval: poll_interval.saturating_mul(EVICTION_INTERVAL_FACTOR),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.timelines.keys().map(|k| &**k)
    }

    /// Run one cycle for every kind concurrently and deliver the results.
    pub async fn run_once(&self) -> Vec<(Arc<str>, CycleReport)> {
        let cycles = self.timelines.iter().map(|(kind, subscriptions)| async move {
            let report = self.engine.run_cycle(subscriptions).await;
            deliver(kind, &report, self.sink.as_ref()).await;
            (kind.clone(), report)
        });
        futures::future::join_all(cycles).await
    }

    /// Run every timeline until `cancel` fires. An in-progress cycle is
    /// abandoned on cancellation; watermarks only move after a completed
    /// fetch, so nothing is half-applied.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for (kind, subscriptions) in self.timelines {
            tracing::info!(
                kind = %kind,
                subscriptions = subscriptions.len(),
                interval_secs = self.poll_interval.as_secs(),
                "Starting polling timeline"
            );
            tasks.spawn(run_timeline(
                kind,
                subscriptions,
                self.engine.clone(),
                self.sink.clone(),
                self.poll_interval,
                cancel.clone(),
            ));
        }
        tasks.spawn(run_eviction(self.engine.clone(), self.eviction_interval, cancel.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Scheduler task failed");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_timeline(
    kind: Arc<str>,
    subscriptions: Vec<Subscription>,
    engine: Engine,
    sink: Arc<dyn DeliverySink>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            report = engine.run_cycle(&subscriptions) => {
                deliver(&kind, &report, sink.as_ref()).await;
            }
        }
    }
    tracing::debug!(kind = %kind, "Polling timeline stopped");
}

async fn run_eviction(engine: Engine, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let removed = engine.cache().evict().await;
        let stats = engine.cache().stats();
        tracing::debug!(
            removed,
            ready = stats.ready_entries,
            pending = stats.pending_entries,
            total_bytes = stats.total_bytes,
            "Resource cache eviction pass"
        );
    }
}

async fn deliver(kind: &str, report: &CycleReport, sink: &dyn DeliverySink) {
    if report.batch.is_empty() {
        return;
    }
    if let Err(e) = sink.deliver(&report.batch).await {
        tracing::warn!(kind = %kind, items = report.batch.len(), error = %e, "Delivery sink failed");
    }
}

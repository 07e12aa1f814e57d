//! Background worker that drains the offline queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use waybill_events::SyncEvent;

use crate::SyncBus;
use crate::connectivity::{Connectivity, ConnectivityMonitor, ConnectivityProbe};
use crate::queue::OfflineQueue;

/// Drains the queue when connectivity returns and on a fixed interval.
///
/// The worker:
/// - drains once on start if already online
/// - drains on every transition into `Online`
/// - on each tick, polls the probe (if any) and drains while online
/// - publishes `ConnectivityChanged` for every transition it observes
pub struct SyncWorker {
    queue: Arc<OfflineQueue>,
    monitor: ConnectivityMonitor,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    events: SyncBus,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<OfflineQueue>,
        monitor: ConnectivityMonitor,
        events: SyncBus,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            monitor,
            probe: None,
            events,
            interval: interval.max(Duration::from_millis(1)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Poll `probe` on every tick so the worker notices recovery on its own.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Spawn the worker loop.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let monitor = self.monitor.clone();
        let probe = self.probe.clone();
        let events = self.events.clone();
        let period = self.interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tracing::info!(interval_ms = period.as_millis() as u64, "sync worker started");

            let mut connectivity = monitor.subscribe();
            let mut last = *connectivity.borrow_and_update();
            if last.is_online() {
                drain(&queue, "startup").await;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("sync worker received shutdown signal");
                        break;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = *connectivity.borrow_and_update();
                        let came_online = observe(&events, last, now);
                        last = now;
                        if came_online {
                            drain(&queue, "reconnected").await;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Some(probe) = probe.as_deref() {
                            monitor.poll(probe).await;
                        }
                        let now = *connectivity.borrow_and_update();
                        observe(&events, last, now);
                        last = now;
                        if now.is_online() {
                            drain(&queue, "interval").await;
                        } else {
                            tracing::debug!(?now, "skipping drain while not online");
                        }
                    }
                }
            }

            tracing::info!("sync worker stopped");
        })
    }

    /// Request graceful shutdown; the loop exits at its next wakeup.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Publish a transition; returns whether it was a transition into `Online`.
fn observe(events: &SyncBus, previous: Connectivity, now: Connectivity) -> bool {
    if previous == now {
        return false;
    }
    crate::publish(
        events,
        SyncEvent::ConnectivityChanged {
            online: now.is_online(),
        },
    );
    now.is_online()
}

async fn drain(queue: &OfflineQueue, trigger: &'static str) {
    match queue.drain().await {
        Ok(report) if report.skipped => {
            tracing::debug!(trigger, "drain skipped; another drain is running");
        }
        Ok(report) => {
            tracing::debug!(
                trigger,
                replayed = report.replayed.len(),
                remaining = report.remaining,
                aborted = report.is_aborted(),
                "worker drain finished"
            );
        }
        Err(err) => tracing::error!(trigger, "drain failed: {err}"),
    }
}

//! Scheduler module: one independent probe loop per target.

use crate::config::TargetConfig;
use crate::metrics::{MetricSink, MetricsError};
use crate::monitor::TargetMonitor;
use crate::probe::Prober;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// A running target loop.
struct LoopHandle {
    id: u64,
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// The scheduler that owns every target loop.
pub struct Scheduler {
    prober: Arc<dyn Prober>,
    sink: MetricSink,
    debug: bool,
    loops: Arc<RwLock<HashMap<String, LoopHandle>>>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Create a new scheduler writing into `sink`.
    pub fn new(prober: Arc<dyn Prober>, sink: MetricSink, debug: bool) -> Self {
        Self {
            prober,
            sink,
            debug,
            loops: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register every target and start its loop.
    ///
    /// All registrations happen before the first loop starts, so a metric
    /// name collision aborts start-up without probing anything.
    pub async fn start(&self, targets: Vec<TargetConfig>) -> Result<(), MetricsError> {
        tracing::info!("Starting scheduler with {} targets", targets.len());

        let mut monitors: Vec<TargetMonitor> = Vec::with_capacity(targets.len());
        {
            let loops = self.loops.read().await;
            for target in targets {
                if loops.contains_key(&target.hostname)
                    || monitors
                        .iter()
                        .any(|m| m.target().hostname == target.hostname)
                {
                    continue; // Already running
                }
                monitors.push(TargetMonitor::new(
                    target,
                    self.prober.clone(),
                    &self.sink,
                    self.debug,
                )?);
            }
        }

        for monitor in monitors {
            self.spawn(monitor).await;
        }

        Ok(())
    }

    /// Add a single target to be monitored.
    pub async fn add_target(&self, target: TargetConfig) -> Result<(), MetricsError> {
        if self.loops.read().await.contains_key(&target.hostname) {
            return Ok(());
        }
        let monitor = TargetMonitor::new(target, self.prober.clone(), &self.sink, self.debug)?;
        self.spawn(monitor).await;
        Ok(())
    }

    async fn spawn(&self, monitor: TargetMonitor) {
        let mut loops = self.loops.write().await;

        let target = monitor.target().clone();
        if loops.contains_key(&target.hostname) {
            return;
        }

        tracing::info!(
            "Initiating a ping loop for {} count={} timeout={:?} interval={:?}",
            target.hostname,
            target.probe_count,
            target.timeout,
            target.interval
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let hostname = target.hostname.clone();
        let registry = self.loops.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = tokio::spawn(run_probe_loop(monitor, stop_rx)).await {
                tracing::error!("Ping loop for {} ended abnormally: {}", hostname, e);
            }

            // Clean up when done, unless the entry was already replaced
            let mut loops = registry.write().await;
            if loops.get(&hostname).is_some_and(|handle| handle.id == id) {
                loops.remove(&hostname);
            }
        });
        loops.insert(
            target.hostname,
            LoopHandle {
                id,
                stop: stop_tx,
                task,
            },
        );
    }

    /// Stop monitoring a target and withdraw its gauges. Counters keep their
    /// totals, and the same hostname can be added again later.
    pub async fn stop_target(&self, hostname: &str) -> bool {
        let handle = self.loops.write().await.remove(hostname);
        match handle {
            Some(handle) => {
                let _ = handle.stop.send(());
                let _ = handle.task.await;
                tracing::info!("Scheduler: stopped target {}", hostname);
                true
            }
            None => false,
        }
    }

    /// Stop every loop and wait for them to finish.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, LoopHandle)> = self.loops.write().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.stop.send(());
        }
        for (hostname, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::error!("Scheduler: loop for {} ended abnormally: {}", hostname, e);
            }
        }
        tracing::info!("Scheduler: all targets stopped");
    }

    /// Hostnames with a running loop.
    pub async fn running_targets(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.loops.read().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

/// Run the probe loop for a single target.
///
/// Cycles run back to back with a fixed pause in between: no overlap, no
/// catch-up ticks and no backoff after failures.
async fn run_probe_loop(mut monitor: TargetMonitor, mut stop_rx: broadcast::Receiver<()>) {
    let interval = monitor.target().interval;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = monitor.run_cycle() => {}
        }

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    monitor.shutdown();
}

//! Target monitor: one probe cycle per call, translated into metric updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::TargetConfig;
use crate::metrics::{millis, MetricSink, MetricsError, SeriesLabels, TargetMetrics};
use crate::probe::{EchoReply, ProbeError, ProbeStats, Prober};

/// Loss percentage from which the loss series is flagged as an error.
pub const LOSS_ERROR_THRESHOLD: f64 = 10.0;

/// `error_desc` label value of a loss series over the threshold.
pub const LOSS_ERROR_DESC: &str = "packet loss above 10%";

/// Outcome of one probe cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(ProbeStats),
    Failed(ProbeError),
}

impl CycleOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }
}

/// Owns one target and its metric series.
pub struct TargetMonitor {
    target: TargetConfig,
    debug: bool,
    prober: Arc<dyn Prober>,
    metrics: TargetMetrics,
}

impl TargetMonitor {
    /// Register the target's metrics in `sink` and build the monitor.
    pub fn new(
        target: TargetConfig,
        prober: Arc<dyn Prober>,
        sink: &MetricSink,
        debug: bool,
    ) -> Result<Self, MetricsError> {
        let metrics = sink.target_metrics(&target.hostname)?;
        Ok(Self {
            target,
            debug,
            prober,
            metrics,
        })
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Withdraw the target's gauges once it is no longer probed.
    pub fn shutdown(&mut self) {
        self.metrics.retire();
    }

    /// Run one probe cycle and publish its result.
    ///
    /// Failures only change the health series; they are never returned as
    /// errors since the next cycle retries from scratch.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let hostname = self.target.hostname.clone();
        if self.debug {
            tracing::info!("Attempting to ping {}", hostname);
        }

        let addr = match self.prober.resolve(&hostname).await {
            Ok(addr) => addr,
            Err(e) => return self.fail(e),
        };

        let labels = SeriesLabels::ok(addr.to_string(), hostname.as_str());
        self.metrics.healthy.set(&labels, 0.0);

        let (tx, rx) = mpsc::unbounded_channel();
        let ping = self
            .prober
            .ping(addr, self.target.probe_count, self.target.timeout, tx);
        let (result, ()) = tokio::join!(
            ping,
            observe_replies(rx, &self.metrics, &labels, self.debug)
        );

        match result {
            Ok(stats) => {
                self.publish(&labels, &stats);
                CycleOutcome::Completed(stats)
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: ProbeError) -> CycleOutcome {
        if self.debug {
            tracing::info!("Ping of {} failed: {}", self.target.hostname, error);
        } else {
            tracing::debug!("Ping of {} failed: {}", self.target.hostname, error);
        }

        let labels = SeriesLabels::failed("", self.target.hostname.as_str(), error.kind());
        self.metrics.healthy.set(&labels, 1.0);
        self.metrics.clear_statistics();

        CycleOutcome::Failed(error)
    }

    fn publish(&mut self, labels: &SeriesLabels, stats: &ProbeStats) {
        let loss_labels = if stats.loss_percent >= LOSS_ERROR_THRESHOLD {
            SeriesLabels::failed(labels.ip.as_str(), labels.hostname.as_str(), LOSS_ERROR_DESC)
        } else {
            labels.clone()
        };
        self.metrics.packet_loss.set(&loss_labels, stats.loss_percent);

        self.metrics.rtt_avg.set(labels, millis(stats.avg_rtt));
        self.metrics.rtt_min.set(labels, millis(stats.min_rtt));
        self.metrics.rtt_max.set(labels, millis(stats.max_rtt));
        self.metrics.rtt_stddev.set(labels, millis(stats.stddev_rtt));

        TargetMetrics::add(
            &self.metrics.packets_transmitted,
            labels,
            stats.packets_sent as f64,
        );
        TargetMetrics::add(
            &self.metrics.packet_received,
            labels,
            stats.packets_received as f64,
        );

        if self.debug {
            tracing::info!("--- {} ping statistics ---", stats.addr);
            tracing::info!(
                "{} packets transmitted, {} packets received, {}% packet loss",
                stats.packets_sent,
                stats.packets_received,
                stats.loss_percent
            );
            tracing::info!(
                "round-trip min/avg/max/stddev = {:?}/{:?}/{:?}/{:?}",
                stats.min_rtt,
                stats.avg_rtt,
                stats.max_rtt,
                stats.stddev_rtt
            );
        }
    }
}

/// Count replies as they arrive, until the prober drops its sender.
async fn observe_replies(
    mut rx: mpsc::UnboundedReceiver<EchoReply>,
    metrics: &TargetMetrics,
    labels: &SeriesLabels,
    debug: bool,
) {
    while let Some(reply) = rx.recv().await {
        TargetMetrics::add(&metrics.total_packets, labels, 1.0);
        if debug {
            tracing::info!(
                "{} bytes from {}: icmp_seq={} time={:?}",
                reply.bytes,
                reply.addr,
                reply.seq,
                reply.rtt
            );
        }
    }
}

//! Metric sink backed by a Prometheus registry.
//!
//! Every target gets a [`TargetMetrics`] handle set. Depending on the
//! [`MetricLayout`] the underlying metric families are either dedicated to the
//! target (`<sanitized host>_rtt_avg`) or shared by all targets
//! (`<namespace>_rtt_avg`) and told apart by the `hostname` label.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use thiserror::Error;

/// Label names carried by every series.
pub const LABELS: [&str; 4] = ["ip", "hostname", "error", "error_desc"];

/// Metric sink errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics for {hostname} collide with an already registered target under {prefix}")]
    Collision { hostname: String, prefix: String },
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// How metric families are split between targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricLayout {
    /// One group of metric names per target, prefixed with the sanitized host.
    #[default]
    PerTarget,
    /// One metric name per measurement, shared by all targets.
    Shared,
}

/// Turn a raw address into a legal metric name prefix.
///
/// Anything outside `[A-Za-z0-9_]` becomes `_`, and a leading digit gets an
/// extra `_` in front. Distinct hosts can map to the same prefix
/// (`a-b.com` and `a.b.com`); registering the second one then fails with
/// [`MetricsError::Collision`].
pub fn sanitize(host: &str) -> String {
    let mut out: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Round-trip times are exported in milliseconds.
pub fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

/// The label values of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLabels {
    pub ip: String,
    pub hostname: String,
    pub error: bool,
    pub error_desc: String,
}

impl SeriesLabels {
    pub fn ok(ip: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            hostname: hostname.into(),
            error: false,
            error_desc: String::new(),
        }
    }

    pub fn failed(
        ip: impl Into<String>,
        hostname: impl Into<String>,
        error_desc: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            hostname: hostname.into(),
            error: true,
            error_desc: error_desc.into(),
        }
    }

    fn values(&self) -> [&str; 4] {
        [
            self.ip.as_str(),
            self.hostname.as_str(),
            if self.error { "true" } else { "false" },
            self.error_desc.as_str(),
        ]
    }
}

/// A gauge that only ever exposes one series per target.
///
/// Setting a value under new labels removes the series written last, so a
/// superseded label combination (an old IP, an error state) never lingers.
pub struct GaugeSeries {
    vec: GaugeVec,
    current: Option<SeriesLabels>,
}

impl GaugeSeries {
    fn new(vec: GaugeVec) -> Self {
        Self { vec, current: None }
    }

    pub fn set(&mut self, labels: &SeriesLabels, value: f64) {
        if self.current.as_ref() != Some(labels) {
            self.clear();
            self.current = Some(labels.clone());
        }
        self.vec.with_label_values(&labels.values()).set(value);
    }

    /// Drop the series written last, if any.
    pub fn clear(&mut self) {
        if let Some(labels) = self.current.take() {
            let _ = self.vec.remove_label_values(&labels.values());
        }
    }

    pub fn current(&self) -> Option<&SeriesLabels> {
        self.current.as_ref()
    }
}

/// The metric families for one prefix.
#[derive(Clone)]
struct MetricFamilies {
    rtt_avg: GaugeVec,
    rtt_min: GaugeVec,
    rtt_max: GaugeVec,
    rtt_stddev: GaugeVec,
    packet_loss: GaugeVec,
    healthy: GaugeVec,
    packets_transmitted: CounterVec,
    packet_received: CounterVec,
    total_packets: CounterVec,
}

impl MetricFamilies {
    fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| {
            GaugeVec::new(Opts::new(name, help).namespace(prefix), &LABELS)
        };
        let counter = |name: &str, help: &str| {
            CounterVec::new(Opts::new(name, help).namespace(prefix), &LABELS)
        };

        Ok(Self {
            rtt_avg: gauge("rtt_avg", "average round trip time in milliseconds")?,
            rtt_min: gauge("rtt_min", "min round trip time in milliseconds")?,
            rtt_max: gauge("rtt_max", "max round trip time in milliseconds")?,
            rtt_stddev: gauge("rtt_stddev", "round trip time standard deviation in milliseconds")?,
            packet_loss: gauge("packet_loss", "percentage of packets lost")?,
            healthy: gauge("healthy", "0 when the last cycle resolved and pinged the target, 1 otherwise")?,
            packets_transmitted: counter("packets_transmitted", "total number of packets sent")?,
            packet_received: counter("packet_received", "total number of packets received")?,
            total_packets: counter("total_packets", "total number of echo replies observed")?,
        })
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.rtt_avg.clone()))?;
        registry.register(Box::new(self.rtt_min.clone()))?;
        registry.register(Box::new(self.rtt_max.clone()))?;
        registry.register(Box::new(self.rtt_stddev.clone()))?;
        registry.register(Box::new(self.packet_loss.clone()))?;
        registry.register(Box::new(self.healthy.clone()))?;
        registry.register(Box::new(self.packets_transmitted.clone()))?;
        registry.register(Box::new(self.packet_received.clone()))?;
        registry.register(Box::new(self.total_packets.clone()))?;
        Ok(())
    }
}

/// Metric handles owned by a single target monitor.
pub struct TargetMetrics {
    pub rtt_avg: GaugeSeries,
    pub rtt_min: GaugeSeries,
    pub rtt_max: GaugeSeries,
    pub rtt_stddev: GaugeSeries,
    pub packet_loss: GaugeSeries,
    pub healthy: GaugeSeries,
    pub packets_transmitted: CounterVec,
    pub packet_received: CounterVec,
    pub total_packets: CounterVec,
}

impl TargetMetrics {
    fn from_families(families: MetricFamilies) -> Self {
        Self {
            rtt_avg: GaugeSeries::new(families.rtt_avg),
            rtt_min: GaugeSeries::new(families.rtt_min),
            rtt_max: GaugeSeries::new(families.rtt_max),
            rtt_stddev: GaugeSeries::new(families.rtt_stddev),
            packet_loss: GaugeSeries::new(families.packet_loss),
            healthy: GaugeSeries::new(families.healthy),
            packets_transmitted: families.packets_transmitted,
            packet_received: families.packet_received,
            total_packets: families.total_packets,
        }
    }

    /// Increment a cumulative counter for the given series.
    pub fn add(counter: &CounterVec, labels: &SeriesLabels, value: f64) {
        counter.with_label_values(&labels.values()).inc_by(value);
    }

    /// Remove every round-trip and loss series of this target.
    pub fn clear_statistics(&mut self) {
        self.rtt_avg.clear();
        self.rtt_min.clear();
        self.rtt_max.clear();
        self.rtt_stddev.clear();
        self.packet_loss.clear();
    }

    /// Remove every gauge series of this target. Counters keep their totals.
    pub fn retire(&mut self) {
        self.clear_statistics();
        self.healthy.clear();
    }
}

/// Process-wide registry that target monitors write into.
///
/// Cloning is cheap and every clone writes into the same registry.
#[derive(Clone)]
pub struct MetricSink {
    registry: Registry,
    shared: Option<MetricFamilies>,
    /// Per-target families by prefix, with the hostname that owns them.
    per_target: Arc<Mutex<HashMap<String, (String, MetricFamilies)>>>,
}

impl MetricSink {
    /// Create a sink. With [`MetricLayout::Shared`] the families are
    /// registered right away under `namespace`.
    pub fn new(layout: MetricLayout, namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let shared = match layout {
            MetricLayout::PerTarget => None,
            MetricLayout::Shared => {
                let families = MetricFamilies::new(namespace)?;
                families.register(&registry)?;
                Some(families)
            }
        };
        Ok(Self {
            registry,
            shared,
            per_target: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Hand out the metric handles for one target, registering per-target
    /// families on first use. Asking again for the same hostname hands back
    /// the families registered the first time.
    pub fn target_metrics(&self, hostname: &str) -> Result<TargetMetrics, MetricsError> {
        if let Some(families) = &self.shared {
            return Ok(TargetMetrics::from_families(families.clone()));
        }

        let prefix = sanitize(hostname);
        let mut per_target = self
            .per_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((owner, families)) = per_target.get(&prefix) {
            if owner != hostname {
                return Err(MetricsError::Collision {
                    hostname: hostname.to_string(),
                    prefix,
                });
            }
            return Ok(TargetMetrics::from_families(families.clone()));
        }

        let families = MetricFamilies::new(&prefix)?;
        families.register(&self.registry).map_err(|e| match e {
            prometheus::Error::AlreadyReg => MetricsError::Collision {
                hostname: hostname.to_string(),
                prefix: prefix.clone(),
            },
            other => MetricsError::Prometheus(other),
        })?;
        per_target.insert(prefix, (hostname.to_string(), families.clone()));
        Ok(TargetMetrics::from_families(families))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use prometheus::proto::MetricType;

    use super::MetricSink;

    /// A gathered series: its labels and current value.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Sample {
        pub labels: HashMap<String, String>,
        pub value: f64,
    }

    impl Sample {
        pub fn label(&self, name: &str) -> &str {
            self.labels.get(name).map(String::as_str).unwrap_or_default()
        }
    }

    /// Every series of the metric family called `name`.
    pub fn samples(sink: &MetricSink, name: &str) -> Vec<Sample> {
        sink.registry()
            .gather()
            .into_iter()
            .filter(|mf| mf.get_name() == name)
            .flat_map(|mf| {
                let kind = mf.get_field_type();
                mf.get_metric()
                    .iter()
                    .map(|m| Sample {
                        labels: m
                            .get_label()
                            .iter()
                            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                            .collect(),
                        value: match kind {
                            MetricType::COUNTER => m.get_counter().get_value(),
                            _ => m.get_gauge().get_value(),
                        },
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Series of `name` that belong to `hostname`.
    pub fn samples_for(sink: &MetricSink, name: &str, hostname: &str) -> Vec<Sample> {
        samples(sink, name)
            .into_iter()
            .filter(|s| s.label("hostname") == hostname)
            .collect()
    }

    /// The single value of `name` for `hostname`, if exactly one series exists.
    pub fn value_for(sink: &MetricSink, name: &str, hostname: &str) -> Option<f64> {
        match samples_for(sink, name, hostname).as_slice() {
            [one] => Some(one.value),
            _ => None,
        }
    }
}

//! Configuration module for edge-pinger.
//!
//! The config file is TOML. Flat `key = value` files written for the older HCL
//! format are a subset of it, so they load unchanged:
//!
//! ```toml
//! count = 5
//! timeout = "15s"
//! interval = "1m"
//! addresses = ["example.com", "10.0.0.1"]
//!
//! [metrics]
//! layout = "per_target"   # or "shared"
//! namespace = "edge_pinger"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::metrics::{sanitize, MetricLayout};
use crate::probe::resolve_address;

/// Echo requests per cycle when `count` is missing or zero.
pub const DEFAULT_COUNT: usize = 5;
/// Cycle deadline when `timeout` is missing.
pub const DEFAULT_TIMEOUT: &str = "15s";
/// Delay between cycles when `interval` is missing.
pub const DEFAULT_INTERVAL: &str = "1m";
/// Metric prefix for the shared layout.
pub const DEFAULT_NAMESPACE: &str = "edge_pinger";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Probe settings of a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub hostname: String,
    pub probe_count: usize,
    pub timeout: Duration,
    pub interval: Duration,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Metric exposition settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub layout: MetricLayout,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            layout: MetricLayout::default(),
            namespace: default_namespace(),
        }
    }
}

/// The config file as written.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    count: usize,
    timeout: Option<String>,
    interval: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PingerConfig {
    pub count: usize,
    pub timeout: Duration,
    pub interval: Duration,
    /// Unique addresses, in the order they were first listed.
    pub addresses: Vec<String>,
    pub metrics: MetricsConfig,
}

impl PingerConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse config text, apply defaults and validate every field.
    ///
    /// All problems are reported together.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mut problems = Vec::new();

        let count = if raw.count == 0 { DEFAULT_COUNT } else { raw.count };
        let timeout = parse_field(
            "timeout",
            raw.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT),
            &mut problems,
        );
        let interval = parse_field(
            "interval",
            raw.interval.as_deref().unwrap_or(DEFAULT_INTERVAL),
            &mut problems,
        );

        let addresses = dedupe_addresses(raw.addresses);
        if addresses.is_empty() {
            problems.push("addresses: at least one address is required".to_string());
        }
        if let Some(blank) = addresses.iter().find(|a| a.trim().is_empty()) {
            problems.push(format!("addresses: invalid address {:?}", blank));
        }

        let namespace = &raw.metrics.namespace;
        if namespace.is_empty() || sanitize(namespace) != *namespace {
            problems.push(format!(
                "metrics.namespace: {:?} is not a valid metric name prefix",
                namespace
            ));
        }

        match (timeout, interval) {
            (Some(timeout), Some(interval)) if problems.is_empty() => Ok(Self {
                count,
                timeout,
                interval,
                addresses,
                metrics: raw.metrics,
            }),
            _ => Err(ConfigError::Invalid(problems)),
        }
    }

    /// Check that every address resolves.
    pub async fn check_addresses(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for address in &self.addresses {
            if let Err(e) = resolve_address(address).await {
                problems.push(e.to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// One target per unique address.
    pub fn targets(&self) -> Vec<TargetConfig> {
        self.addresses
            .iter()
            .map(|hostname| TargetConfig {
                hostname: hostname.clone(),
                probe_count: self.count,
                timeout: self.timeout,
                interval: self.interval,
            })
            .collect()
    }
}

/// Parse duration string using humantime.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(s.trim()).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

fn parse_field(name: &str, value: &str, problems: &mut Vec<String>) -> Option<Duration> {
    match parse_duration(value) {
        Ok(d) => Some(d),
        Err(e) => {
            problems.push(format!("{} {:?} (format: 15s): {}", name, value, e));
            None
        }
    }
}

/// Drop repeated addresses, keeping the first occurrence of each.
pub fn dedupe_addresses(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

//! Probe module for reachability monitoring.
//!
//! A [`Prober`] resolves a hostname and runs one burst of ICMP echoes against
//! the resolved address, streaming each reply as it arrives and returning the
//! burst statistics once it is over.

mod ping;
mod stats;

pub use ping::*;
pub use stats::*;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    /// Short, fixed description of the failure class.
    ///
    /// Used as a metric label value, so it must stay within a small static set.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Resolve { .. } => "resolve",
            ProbeError::Timeout(_) => "timeout",
            ProbeError::Network(_) => "network",
            ProbeError::Command(_) => "command",
        }
    }
}

/// A single echo reply received during a probe cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub seq: u16,
    pub bytes: usize,
    pub addr: IpAddr,
    pub rtt: Duration,
}

/// Source of ICMP reachability measurements.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Resolve a hostname (or literal IP) to the address that will be probed.
    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError>;

    /// Send `count` echo requests to `addr`, giving up on outstanding replies
    /// once `timeout` has elapsed since the first request.
    ///
    /// Every reply is pushed to `replies` as soon as it is received. Lost
    /// packets are not an error; they only show up in the returned loss.
    async fn ping(
        &self,
        addr: IpAddr,
        count: usize,
        timeout: Duration,
        replies: mpsc::UnboundedSender<EchoReply>,
    ) -> Result<ProbeStats, ProbeError>;
}

/// Resolve hostname to IP address, preferring IPv4.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Resolve {
            host: address.to_string(),
            reason: e.to_string(),
        })?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeError::Resolve {
            host: address.to_string(),
            reason: "no addresses found".to_string(),
        })
}

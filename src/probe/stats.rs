//! Statistics for one burst of echo requests.

use std::net::IpAddr;
use std::time::Duration;

/// Summary of a completed probe cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeStats {
    pub addr: IpAddr,
    pub packets_sent: usize,
    pub packets_received: usize,
    /// Percentage of sent packets without a reply, 0 to 100.
    pub loss_percent: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub stddev_rtt: Duration,
}

impl ProbeStats {
    /// Build statistics from the round-trip times of the replies that came back.
    ///
    /// The standard deviation is the population one. With no replies all
    /// round-trip fields are zero.
    pub fn from_rtts(addr: IpAddr, packets_sent: usize, rtts: &[Duration]) -> Self {
        let packets_received = rtts.len();

        let (min_rtt, avg_rtt, max_rtt, stddev_rtt) = if rtts.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            let nanos: Vec<u128> = rtts.iter().map(Duration::as_nanos).collect();
            let n = nanos.len() as u128;
            let total: u128 = nanos.iter().sum();
            let mean = total as f64 / n as f64;
            let variance = nanos
                .iter()
                .map(|&x| (x as f64 - mean).powi(2))
                .sum::<f64>()
                / n as f64;

            (
                rtts.iter().min().copied().unwrap_or_default(),
                Duration::from_nanos((total / n) as u64),
                rtts.iter().max().copied().unwrap_or_default(),
                Duration::from_nanos(variance.sqrt().round() as u64),
            )
        };

        Self {
            addr,
            packets_sent,
            packets_received,
            loss_percent: loss_percent(packets_sent, packets_received),
            min_rtt,
            avg_rtt,
            max_rtt,
            stddev_rtt,
        }
    }
}

/// Loss as a percentage. Nothing sent counts as no loss.
pub fn loss_percent(sent: usize, received: usize) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    let lost = sent.saturating_sub(received);
    lost as f64 / sent as f64 * 100.0
}

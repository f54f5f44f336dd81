//! Edge Pinger - periodic ICMP reachability prober.
//!
//! Every configured address gets its own probe loop. Each cycle sends a burst
//! of echo requests and publishes round-trip statistics, loss and health as
//! Prometheus metrics.

pub mod config;
pub mod metrics;
pub mod monitor;
pub mod probe;
pub mod scheduler;
pub mod web;

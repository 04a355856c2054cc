//! Retry counters and anomaly metrics.
//!
//! Counters are per device and monotonically increasing. A telemetry
//! collector reads them through [`Metrics::snapshot`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Groups of operations that share a retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RetryChannel {
    CertSerial,
    Info,
    Signature,
    Certificate,
    TrustStatus,
    Update,
}

impl RetryChannel {
    pub const ALL: [RetryChannel; 6] = [
        RetryChannel::CertSerial,
        RetryChannel::Info,
        RetryChannel::Signature,
        RetryChannel::Certificate,
        RetryChannel::TrustStatus,
        RetryChannel::Update,
    ];

    /// Name reported to the telemetry collector.
    pub fn metric_name(self) -> &'static str {
        match self {
            RetryChannel::CertSerial => "GetCertSnRetryCnt",
            RetryChannel::Info => "GetInfoRetryCnt",
            RetryChannel::Signature => "GetSignatureRetryCnt",
            RetryChannel::Certificate => "GetCertificateRetryCnt",
            RetryChannel::TrustStatus => "SetTrustStatusRetryCnt",
            RetryChannel::Update => "GasGaugeUpdateRetryCnt",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RetryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric_name())
    }
}

/// Name of the controller-reset anomaly counter.
pub const CONTROLLER_RESET_METRIC: &str = "RetryWithGGResetCnt";

#[derive(Debug, Default)]
pub struct Metrics {
    command_retries: [AtomicU64; 6],
    bus_retries: [AtomicU64; 6],
    controller_resets: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One failed register access that will be (or was) retried.
    pub fn record_bus_retry(&self, channel: RetryChannel) {
        self.bus_retries[channel.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// One command-level retry after a 700 ms backoff.
    pub fn record_command_retry(&self, channel: RetryChannel) {
        self.command_retries[channel.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_controller_resets(&self, delta: u64) {
        self.controller_resets.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn bus_retries(&self, channel: RetryChannel) -> u64 {
        self.bus_retries[channel.index()].load(Ordering::Relaxed)
    }

    pub fn command_retries(&self, channel: RetryChannel) -> u64 {
        self.command_retries[channel.index()].load(Ordering::Relaxed)
    }

    pub fn controller_resets(&self) -> u64 {
        self.controller_resets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let channels = RetryChannel::ALL
            .iter()
            .map(|&channel| ChannelCounters {
                channel,
                name: channel.metric_name(),
                command_retries: self.command_retries(channel),
                bus_retries: self.bus_retries(channel),
            })
            .collect();
        MetricsSnapshot {
            channels,
            controller_resets: self.controller_resets(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelCounters {
    pub channel: RetryChannel,
    pub name: &'static str,
    pub command_retries: u64,
    pub bus_retries: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub channels: Vec<ChannelCounters>,
    pub controller_resets: u64,
}

impl MetricsSnapshot {
    pub fn channel(&self, channel: RetryChannel) -> Option<&ChannelCounters> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Sum of command and bus retries for `channel`.
    pub fn total_retries(&self, channel: RetryChannel) -> u64 {
        self.channel(channel)
            .map(|c| c.command_retries + c.bus_retries)
            .unwrap_or(0)
    }
}

//! Connection throughput monitoring.
//!
//! When valid monitoring options are supplied at connect time, a statistics
//! handler is attached to the client channel. The handler watches sampled
//! byte counts and shuts the channel down once throughput stays below the
//! configured floor for longer than the allowed interval.

use std::sync::atomic::{AtomicU32, Ordering};

use hconn_chan::{Channel, ChannelError, ChannelStatsSample, StatisticsHandler};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Throughput floor for a monitored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringOptions {
    /// Minimum combined read+write throughput, in bytes per second.
    pub minimum_throughput_bytes_per_second: u64,

    /// How many consecutive below-floor seconds are tolerated. Must be at
    /// least 2 so a single quiet sampling interval cannot kill a healthy
    /// connection.
    pub allowable_throughput_failure_interval_seconds: u32,
}

impl MonitoringOptions {
    pub fn is_valid(&self) -> bool {
        self.minimum_throughput_bytes_per_second > 0
            && self.allowable_throughput_failure_interval_seconds >= 2
    }
}

pub(crate) struct HttpConnectionMonitor {
    options: MonitoringOptions,
    consecutive_failures: AtomicU32,
}

impl HttpConnectionMonitor {
    pub(crate) fn new(options: MonitoringOptions) -> Self {
        Self {
            options,
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

impl StatisticsHandler for HttpConnectionMonitor {
    fn report(&self, channel: &Channel, sample: ChannelStatsSample) {
        let throughput = sample.bytes_read + sample.bytes_written;
        if throughput >= self.options.minimum_throughput_bytes_per_second {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.options.allowable_throughput_failure_interval_seconds {
            warn!(
                channel = channel.id(),
                throughput,
                minimum = self.options.minimum_throughput_bytes_per_second,
                "throughput below configured minimum, shutting down connection"
            );
            channel.shutdown(Some(ChannelError::Application("minimum throughput not met")));
        }
    }
}

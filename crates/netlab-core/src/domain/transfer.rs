//! Transfer throughput reporting shared by the server logs and the client.

use std::time::Duration;

/// Shortest duration used when computing a bitrate, so that a transfer that
/// finished "instantly" does not divide by zero.
pub const MIN_TRANSFER_DURATION: Duration = Duration::from_millis(1);

/// Bitrate in megabits per second (10^6 bits) for `bytes` moved in `elapsed`.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use netlab_core::domain::transfer::bitrate_mbps;
///
/// assert_eq!(bitrate_mbps(1_000_000, Duration::from_secs(8)), 1.0);
/// ```
pub fn bitrate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.max(MIN_TRANSFER_DURATION).as_secs_f64();
    (bytes as f64 * 8.0) / 1_000_000.0 / secs
}

/// Summary of one finished (or interrupted) file transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    /// Bytes moved during this transfer, excluding any resumed prefix.
    pub bytes: u64,
    /// Offset the transfer resumed from.
    pub resumed_from: u64,
    /// Wall-clock time spent moving `bytes`.
    pub elapsed: Duration,
}

impl TransferReport {
    /// Throughput of this transfer in Mbps.
    pub fn mbps(&self) -> f64 {
        bitrate_mbps(self.bytes, self.elapsed)
    }
}

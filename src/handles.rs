//! Acquisition handles issued by the throttling engine.
//!
//! Each handle is an immutable pair of (group, bin names); all mutable
//! state lives in the group's bins. Handles never keep a group alive
//! operationally: destroying the group flips it to shutting-down and
//! every outstanding handle's next operation fails cleanly with `None`,
//! `false`, or the quota sentinel.

use std::fmt;
use std::sync::Arc;

use crate::group::ThrottleGroup;

/// Permission gate for opening connections against a set of bins.
///
/// Obtained from [`Throttler::obtain_connection_throttler`] and meant to
/// be embedded alongside a caller-side connection pool: ask for
/// permission before opening, release after closing, and consult
/// [`over_connection_quota_count`] to decide when pooled connections
/// should be retired.
///
/// [`Throttler::obtain_connection_throttler`]: crate::Throttler::obtain_connection_throttler
/// [`over_connection_quota_count`]: ConnectionThrottler::over_connection_quota_count
#[derive(Clone)]
pub struct ConnectionThrottler {
    group: Arc<ThrottleGroup>,
    bin_names: Arc<[String]>,
}

impl ConnectionThrottler {
    pub(crate) fn new(group: Arc<ThrottleGroup>, bin_names: Arc<[String]>) -> Self {
        Self { group, bin_names }
    }

    /// Ask to open one connection. Non-blocking: either every named bin
    /// has a free slot and a [`FetchThrottler`] for the connection is
    /// returned, or `None` and nothing is held. `None` also means the
    /// group is shutting down, so callers must not retry forever.
    pub fn obtain_connection_permission(&self) -> Option<FetchThrottler> {
        self.group.obtain_connection_permission(&self.bin_names)
    }

    /// Summed excess of open connections over the current limits across
    /// the named bins, each floored at zero, i.e. how many pooled
    /// connections with these characteristics the caller should retire.
    /// Returns `u32::MAX` while the group is shutting down.
    pub fn over_connection_quota_count(&self) -> u32 {
        self.group.over_connection_quota_count(&self.bin_names)
    }

    /// Release one connection obtained through
    /// [`obtain_connection_permission`](Self::obtain_connection_permission).
    pub fn release_connection_permission(&self) {
        self.group.release_connection_permission(&self.bin_names);
    }
}

impl fmt::Debug for ConnectionThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionThrottler")
            .field("bin_names", &self.bin_names)
            .finish_non_exhaustive()
    }
}

/// Permission gate for starting fetches over one granted connection.
#[derive(Clone)]
pub struct FetchThrottler {
    group: Arc<ThrottleGroup>,
    bin_names: Arc<[String]>,
}

impl FetchThrottler {
    pub(crate) fn new(group: Arc<ThrottleGroup>, bin_names: Arc<[String]>) -> Self {
        Self { group, bin_names }
    }

    /// Ask to start fetching one document on this connection, waiting
    /// out each bin's pacing interval. `None` means the group shut down
    /// while waiting; the caller should release the connection and
    /// abandon the work unit.
    pub async fn obtain_fetch_document_permission(&self) -> Option<StreamThrottler> {
        self.group
            .obtain_fetch_document_permission(&self.bin_names)
            .await
    }
}

impl fmt::Debug for FetchThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchThrottler")
            .field("bin_names", &self.bin_names)
            .finish_non_exhaustive()
    }
}

/// Byte-rate gate for one open document stream.
///
/// Call [`obtain_read_permission`] before each block read,
/// [`release_read_permission`] with the actual count after it (short
/// reads give their unread budget back), and [`close_stream`] exactly
/// once when the stream ends.
///
/// [`obtain_read_permission`]: StreamThrottler::obtain_read_permission
/// [`release_read_permission`]: StreamThrottler::release_read_permission
/// [`close_stream`]: StreamThrottler::close_stream
#[derive(Clone)]
pub struct StreamThrottler {
    group: Arc<ThrottleGroup>,
    bin_names: Arc<[String]>,
}

impl StreamThrottler {
    pub(crate) fn new(group: Arc<ThrottleGroup>, bin_names: Arc<[String]>) -> Self {
        Self { group, bin_names }
    }

    /// Wait until reading `byte_count` more bytes keeps every named bin
    /// under its rate. False means shutting down: abandon the stream.
    pub async fn obtain_read_permission(&self, byte_count: usize) -> bool {
        self.group
            .obtain_read_permission(&self.bin_names, byte_count)
            .await
    }

    /// Record how many of the permitted bytes actually arrived.
    pub fn release_read_permission(&self, orig_byte_count: usize, actual_byte_count: usize) {
        self.group
            .release_read_permission(&self.bin_names, orig_byte_count, actual_byte_count);
    }

    /// Note the stream being closed, ending each bin's pacing series
    /// when this was its last stream.
    pub fn close_stream(&self) {
        self.group.close_stream(&self.bin_names);
    }
}

impl fmt::Debug for StreamThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamThrottler")
            .field("bin_names", &self.bin_names)
            .finish_non_exhaustive()
    }
}

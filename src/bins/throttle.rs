//! Throttle bin: paces bytes read from open streams.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Enforces a minimum time per byte read for one bin name.
///
/// Pacing is measured within a series: the interval during which the
/// bin has at least one active stream. The series clock starts when
/// `active_streams` goes 0 to 1 and resets when it returns to 0, so an
/// idle bin does not bank read credit. Within a series, a read of `n`
/// bytes is granted once
/// `now >= series_start + (total_bytes_read + n) * millis_per_byte`.
pub(crate) struct ThrottleBin {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    alive: bool,
    millis_per_byte: f64,
    /// Open streams referencing this bin.
    active_streams: u32,
    /// Bytes granted during the current series, reconciled for short
    /// reads by [`ThrottleBin::end_read`].
    total_bytes_read: u64,
    /// Monotonic start of the current series. `None` while no stream is
    /// active.
    series_start: Option<Instant>,
}

impl ThrottleBin {
    pub fn new(name: &str, minimum_millis_per_byte: f64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State {
                alive: true,
                millis_per_byte: sanitize_rate(minimum_millis_per_byte),
                active_streams: 0,
                total_bytes_read: 0,
                series_start: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn bin_name(&self) -> &str {
        &self.name
    }

    /// Count a stream against this bin, starting a fresh series if it is
    /// the first.
    pub fn begin_fetch(&self) {
        let mut state = self.lock();
        state.active_streams += 1;
        if state.active_streams == 1 {
            state.series_start = Some(Instant::now());
            state.total_bytes_read = 0;
        }
    }

    /// Remove a stream; the last one out ends the series so the next
    /// fetch starts a fresh pacing window.
    pub fn end_fetch(&self) {
        let mut state = self.lock();
        if state.active_streams == 0 {
            warn!(bin = %self.name, "closed a stream that was never opened");
            return;
        }
        state.active_streams -= 1;
        if state.active_streams == 0 {
            state.series_start = None;
            state.total_bytes_read = 0;
        }
    }

    /// Wait until `byte_count` more bytes fit under the series rate,
    /// then provisionally count them as read. Returns false if the bin
    /// shut down while waiting; nothing is counted in that case.
    pub async fn begin_read(&self, byte_count: usize) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking the grant
            // condition, otherwise a notify between the check and the
            // select would be lost.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if !state.alive {
                    return false;
                }
                let now = Instant::now();
                let earliest = match state.series_start {
                    Some(start) if state.millis_per_byte > 0.0 => {
                        let due_millis = (state.total_bytes_read + byte_count as u64) as f64
                            * state.millis_per_byte;
                        start + Duration::from_secs_f64(due_millis / 1000.0)
                    }
                    _ => now,
                };
                if earliest <= now {
                    state.total_bytes_read += byte_count as u64;
                    return true;
                }
                earliest
            };

            debug!(
                bin = %self.name,
                bytes = byte_count,
                wait = ?(deadline - Instant::now()),
                "byte rate wait"
            );
            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                _ = notified => {}
            }
        }
    }

    /// Reconcile a completed read against its grant. A short read gives
    /// the unread portion back to the series budget and wakes a waiter.
    pub fn end_read(&self, orig_byte_count: usize, actual_byte_count: usize) {
        {
            let mut state = self.lock();
            state.total_bytes_read = state
                .total_bytes_read
                .saturating_add(actual_byte_count as u64)
                .saturating_sub(orig_byte_count as u64);
        }
        self.notify.notify_one();
    }

    /// Whether no stream references this bin.
    pub fn is_idle(&self) -> bool {
        self.lock().active_streams == 0
    }

    /// Install a new byte rate and wake all waiters to re-check.
    pub fn update_minimum_millis_per_byte(&self, minimum_millis_per_byte: f64) {
        let rate = sanitize_rate(minimum_millis_per_byte);
        {
            let mut state = self.lock();
            if state.millis_per_byte == rate {
                return;
            }
            debug!(
                bin = %self.name,
                old = state.millis_per_byte,
                new = rate,
                "byte rate changed"
            );
            state.millis_per_byte = rate;
        }
        self.notify.notify_waiters();
    }

    /// Mark the bin dead and release everyone.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.alive = false;
        }
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("poisoned lock")
    }

    #[cfg(test)]
    fn total_bytes(&self) -> u64 {
        self.lock().total_bytes_read
    }
}

/// Negative and NaN rates from a spec are treated as "no pacing".
fn sanitize_rate(millis_per_byte: f64) -> f64 {
    millis_per_byte.max(0.0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_paced_by_cumulative_bytes() {
        let bin = ThrottleBin::new("h1", 1.0);
        bin.begin_fetch();
        let start = Instant::now();

        assert!(bin.begin_read(100).await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        assert!(bin.begin_read(200).await);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_returns_budget() {
        let bin = ThrottleBin::new("h1", 1.0);
        bin.begin_fetch();
        let start = Instant::now();

        assert!(bin.begin_read(100).await);
        assert!(bin.begin_read(200).await);
        // Only 50 of the 200 bytes actually arrived.
        bin.end_read(200, 50);
        assert_eq!(bin.total_bytes(), 150);

        assert!(bin.begin_read(250).await);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_grants_immediately() {
        let bin = ThrottleBin::new("h1", 0.0);
        bin.begin_fetch();
        let start = Instant::now();
        assert!(bin.begin_read(1_000_000).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_resets_when_last_stream_closes() {
        let bin = ThrottleBin::new("h1", 1.0);
        bin.begin_fetch();
        assert!(bin.begin_read(100).await);
        bin.end_fetch();

        // A fresh series starts from zero bytes at a new start time.
        bin.begin_fetch();
        let start = Instant::now();
        assert!(bin.begin_read(50).await);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        bin.end_fetch();
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_survives_while_other_streams_remain() {
        let bin = ThrottleBin::new("h1", 1.0);
        bin.begin_fetch();
        bin.begin_fetch();
        assert!(bin.begin_read(100).await);
        bin.end_fetch();
        // One stream still open: bytes and start time are retained.
        assert_eq!(bin.total_bytes(), 100);
        bin.end_fetch();
        assert_eq!(bin.total_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_reader() {
        let bin = Arc::new(ThrottleBin::new("h1", 1000.0));
        bin.begin_fetch();
        assert!(bin.begin_read(1).await);

        let reader = {
            let bin = Arc::clone(&bin);
            tokio::spawn(async move { bin.begin_read(1000).await })
        };
        tokio::task::yield_now().await;

        bin.shut_down();
        assert!(!reader.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_update_wakes_waiter_into_new_schedule() {
        let bin = Arc::new(ThrottleBin::new("h1", 1000.0));
        bin.begin_fetch();
        let start = Instant::now();

        let reader = {
            let bin = Arc::clone(&bin);
            tokio::spawn(async move { bin.begin_read(100).await })
        };
        tokio::task::yield_now().await;

        // Dropping the rate to 1ms/byte re-paces the waiting read.
        bin.update_minimum_millis_per_byte(1.0);
        assert!(reader.await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}

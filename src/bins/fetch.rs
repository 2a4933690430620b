//! Fetch bin: paces the start of successive fetches.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Enforces a minimum interval between fetch starts for one bin name.
///
/// A reservation is a queue slot, not a grant: it always succeeds while
/// the bin is alive. The grant happens in [`wait_next_fetch`], one
/// permit at a time; each grant advances the pacing deadline by the
/// current interval and passes the wakeup on to the next waiter.
///
/// [`wait_next_fetch`]: FetchBin::wait_next_fetch
pub(crate) struct FetchBin {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    alive: bool,
    /// Fetches waiting in line (reserved but not yet granted).
    reserved: u32,
    min_interval: Duration,
    /// Earliest instant at which the next fetch may begin. `None` until
    /// the first grant.
    next_fetch_earliest: Option<Instant>,
}

impl FetchBin {
    pub fn new(name: &str, minimum_millis_per_fetch: u64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State {
                alive: true,
                reserved: 0,
                min_interval: Duration::from_millis(minimum_millis_per_fetch),
                next_fetch_earliest: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn bin_name(&self) -> &str {
        &self.name
    }

    /// Take a queue slot. Fails only when the bin has shut down.
    pub fn reserve_fetch_request(&self) -> bool {
        let mut state = self.lock();
        if !state.alive {
            return false;
        }
        state.reserved += 1;
        true
    }

    /// Give back an ungranted queue slot and pass the wakeup on.
    pub fn clear_reservation(&self) {
        {
            let mut state = self.lock();
            if state.reserved == 0 {
                warn!(bin = %self.name, "cleared a fetch reservation that was never taken");
                return;
            }
            state.reserved -= 1;
        }
        self.notify.notify_one();
    }

    /// Wait until the pacing deadline, then take the next fetch slot.
    ///
    /// On success the reservation is consumed and the deadline advances
    /// by the interval in effect at the moment of the grant. Returns
    /// false if the bin shut down while waiting; the reservation is then
    /// still held and must be cleared by the caller's rewind.
    pub async fn wait_next_fetch(&self) -> bool {
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
                match state.next_fetch_earliest {
                    Some(earliest) if earliest > now => earliest,
                    _ => {
                        state.next_fetch_earliest = Some(now + state.min_interval);
                        state.reserved = state.reserved.saturating_sub(1);
                        drop(state);
                        // Pass the slot on to the next waiter in line.
                        self.notify.notify_one();
                        return true;
                    }
                }
            };

            debug!(bin = %self.name, wait = ?(deadline - Instant::now()), "fetch pacing wait");
            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                _ = notified => {}
            }
        }
    }

    /// Whether the bin has no queued fetches and its pacing deadline has
    /// already passed, i.e. dropping it loses no constraint.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.reserved == 0
            && state
                .next_fetch_earliest
                .map_or(true, |earliest| earliest <= Instant::now())
    }

    /// Install a new pacing interval and wake all waiters to re-check.
    pub fn update_min_time_between_fetches(&self, minimum_millis_per_fetch: u64) {
        {
            let mut state = self.lock();
            let interval = Duration::from_millis(minimum_millis_per_fetch);
            if state.min_interval == interval {
                return;
            }
            debug!(
                bin = %self.name,
                old = ?state.min_interval,
                new = ?interval,
                "fetch interval changed"
            );
            state.min_interval = interval;
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
    fn reserved_count(&self) -> u32 {
        self.lock().reserved
    }
}

//! Connection bin: caps the number of concurrently open connections.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Gates connection creation for one bin name.
///
/// Purely counter-based: a reservation either succeeds immediately or
/// fails immediately, and callers push retry into their own backpressure
/// loop. `in_use + reserved <= max_active` holds at every reservation
/// checkpoint; lowering `max_active` underneath open connections may
/// violate it transiently, in which case no new reservation succeeds
/// until the count drains back under the limit.
pub(crate) struct ConnectionBin {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    alive: bool,
    /// Confirmed-open connections.
    in_use: u32,
    /// Permissions granted but not yet confirmed.
    reserved: u32,
    max_active: u32,
}

impl ConnectionBin {
    pub fn new(name: &str, max_active: u32) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State {
                alive: true,
                in_use: 0,
                reserved: 0,
                max_active,
            }),
            notify: Notify::new(),
        }
    }

    pub fn bin_name(&self) -> &str {
        &self.name
    }

    /// Try to reserve one connection slot. Returns false when the bin is
    /// at capacity or shut down.
    pub fn reserve_a_connection(&self) -> bool {
        let mut state = self.lock();
        if !state.alive {
            return false;
        }
        if (state.in_use as u64) + (state.reserved as u64) < state.max_active as u64 {
            state.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Back out a reservation that will not be confirmed.
    pub fn clear_reservation(&self) {
        let mut state = self.lock();
        if state.reserved == 0 {
            warn!(bin = %self.name, "cleared a connection reservation that was never taken");
            return;
        }
        state.reserved -= 1;
    }

    /// Convert a reservation into an open connection.
    pub fn note_connection_creation(&self) {
        let mut state = self.lock();
        if state.reserved == 0 {
            warn!(bin = %self.name, "confirmed a connection that was never reserved");
        } else {
            state.reserved -= 1;
        }
        state.in_use += 1;
    }

    /// Record a connection being closed and wake one waiter on the
    /// freed slot.
    pub fn note_connection_destruction(&self) {
        {
            let mut state = self.lock();
            if state.in_use == 0 {
                warn!(bin = %self.name, "released a connection that was never confirmed");
                return;
            }
            state.in_use -= 1;
        }
        self.notify.notify_one();
    }

    /// By how many connections this bin exceeds its current limit,
    /// floored at zero (possible after the limit was adjusted downward).
    pub fn over_quota_excess(&self) -> u32 {
        let state = self.lock();
        state.in_use.saturating_sub(state.max_active)
    }

    /// Whether the bin holds no connections and no reservations.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.in_use == 0 && state.reserved == 0
    }

    /// Install a new connection limit and wake all waiters to re-check.
    pub fn update_max_active_connections(&self, max_active: u32) {
        {
            let mut state = self.lock();
            if state.max_active == max_active {
                return;
            }
            debug!(
                bin = %self.name,
                old = state.max_active,
                new = max_active,
                "connection limit changed"
            );
            state.max_active = max_active;
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
    fn counts(&self) -> (u32, u32) {
        let state = self.lock();
        (state.in_use, state.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_up_to_limit() {
        let bin = ConnectionBin::new("h1", 2);
        assert!(bin.reserve_a_connection());
        assert!(bin.reserve_a_connection());
        assert!(!bin.reserve_a_connection());
        assert_eq!(bin.counts(), (0, 2));
    }

    #[test]
    fn test_confirm_and_release_cycle() {
        let bin = ConnectionBin::new("h1", 1);
        assert!(bin.reserve_a_connection());
        bin.note_connection_creation();
        assert_eq!(bin.counts(), (1, 0));
        assert!(!bin.reserve_a_connection());

        bin.note_connection_destruction();
        assert_eq!(bin.counts(), (0, 0));
        assert!(bin.reserve_a_connection());
    }

    #[test]
    fn test_cleared_reservation_frees_the_slot() {
        let bin = ConnectionBin::new("h1", 1);
        assert!(bin.reserve_a_connection());
        assert!(!bin.reserve_a_connection());
        bin.clear_reservation();
        assert!(bin.reserve_a_connection());
    }

    #[test]
    fn test_zero_limit_blocks_all_reservations() {
        let bin = ConnectionBin::new("h1", 0);
        assert!(!bin.reserve_a_connection());
    }

    #[test]
    fn test_downward_adjustment_stops_new_reservations() {
        let bin = ConnectionBin::new("h1", 2);
        assert!(bin.reserve_a_connection());
        assert!(bin.reserve_a_connection());
        bin.note_connection_creation();
        bin.note_connection_creation();

        bin.update_max_active_connections(1);
        assert_eq!(bin.over_quota_excess(), 1);
        assert!(!bin.reserve_a_connection());

        // One release brings us to the limit; still no headroom.
        bin.note_connection_destruction();
        assert_eq!(bin.over_quota_excess(), 0);
        assert!(!bin.reserve_a_connection());

        // A second release opens a slot again.
        bin.note_connection_destruction();
        assert!(bin.reserve_a_connection());
    }

    #[test]
    fn test_shut_down_refuses_reservations() {
        let bin = ConnectionBin::new("h1", 5);
        bin.shut_down();
        assert!(!bin.reserve_a_connection());
    }

    #[test]
    fn test_unbalanced_release_does_not_corrupt_counters() {
        let bin = ConnectionBin::new("h1", 1);
        bin.note_connection_destruction();
        bin.clear_reservation();
        assert_eq!(bin.counts(), (0, 0));
        assert!(bin.reserve_a_connection());
    }
}

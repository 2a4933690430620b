//! Throttle group: one self-consistent throttling environment.
//!
//! A group owns three lazily populated bin tables (connection, fetch,
//! throttle) and the live spec feeding them. Every multi-bin
//! acquisition follows the same three-phase shape: reserve across all
//! named bins (all or nothing, with reverse-order rewind on the first
//! failure), wait on each reserved bin's grant condition, then confirm.
//! Structural locks (the bin tables) are never held across a wait; each
//! bin blocks on its own notifier, so a group can be torn down without
//! anyone holding a table lock hostage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::bins::{ConnectionBin, FetchBin, ThrottleBin};
use crate::error::ThrottleResult;
use crate::handles::{FetchThrottler, StreamThrottler};
use crate::registry::{build_service_type_name, ServiceRegistry};
use crate::spec::SharedThrottleSpec;

/// Group lifecycle. Draining groups refuse new acquisitions but still
/// accept releases from outstanding handles; dead groups no-op
/// everything with the shutting-down indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Alive,
    Draining,
    Dead,
}

pub(crate) struct ThrottleGroup {
    service_type_name: String,
    service_name: String,
    state: Mutex<GroupState>,
    spec: Mutex<SharedThrottleSpec>,
    connection_bins: Mutex<HashMap<String, Arc<ConnectionBin>>>,
    fetch_bins: Mutex<HashMap<String, Arc<FetchBin>>>,
    throttle_bins: Mutex<HashMap<String, Arc<ThrottleBin>>>,
}

impl ThrottleGroup {
    /// Create a group and register its service activity. Bin parameters
    /// come from `spec`, re-read on every poll.
    pub fn new(
        group_type: &str,
        group_name: &str,
        spec: SharedThrottleSpec,
        registry: &dyn ServiceRegistry,
    ) -> ThrottleResult<Self> {
        let service_type_name = build_service_type_name(group_type, group_name);
        let service_name = registry.register_service(&service_type_name)?;
        info!(group_type, group_name, %service_name, "throttle group created");
        Ok(Self {
            service_type_name,
            service_name,
            state: Mutex::new(GroupState::Alive),
            spec: Mutex::new(spec),
            connection_bins: Mutex::new(HashMap::new()),
            fetch_bins: Mutex::new(HashMap::new()),
            throttle_bins: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the live spec and push its values into existing bins, so
    /// outstanding handles see the new limits on their next operation.
    pub fn update_throttle_specification(&self, spec: SharedThrottleSpec) {
        *self.spec.lock().expect("poisoned lock") = spec;
        self.poll();
    }

    pub fn is_alive(&self) -> bool {
        *self.state.lock().expect("poisoned lock") == GroupState::Alive
    }

    // Connection acquisition (never waits).

    /// Reserve a connection slot in every named bin, then confirm them
    /// all into open connections. All or nothing: the first bin at
    /// capacity rewinds the earlier reservations in reverse order.
    pub fn obtain_connection_permission(
        self: &Arc<Self>,
        bin_names: &Arc<[String]>,
    ) -> Option<FetchThrottler> {
        if !self.is_alive() {
            return None;
        }

        let mut reserved: Vec<Arc<ConnectionBin>> = Vec::with_capacity(bin_names.len());
        for name in bin_names.iter() {
            let bin = self.connection_bin(name);
            if !bin.reserve_a_connection() {
                debug!(bin = %bin.bin_name(), "connection reservation denied, rewinding");
                for held in reserved.iter().rev() {
                    held.clear_reservation();
                }
                return None;
            }
            reserved.push(bin);
        }

        for bin in &reserved {
            bin.note_connection_creation();
        }
        Some(FetchThrottler::new(Arc::clone(self), Arc::clone(bin_names)))
    }

    /// Summed excess of open connections over current limits across the
    /// named bins, each floored at zero. `u32::MAX` when the group is
    /// shutting down, so callers using "release if over" drain out
    /// naturally.
    pub fn over_connection_quota_count(&self, bin_names: &[String]) -> u32 {
        if !self.is_alive() {
            return u32::MAX;
        }
        let bins = self.lock_table(&self.connection_bins);
        let excess: u64 = bin_names
            .iter()
            .filter_map(|name| bins.get(name))
            .map(|bin| bin.over_quota_excess() as u64)
            .sum();
        // u32::MAX is reserved for the shutdown sentinel.
        excess.min(u32::MAX as u64 - 1) as u32
    }

    /// Return one open connection to every named bin.
    pub fn release_connection_permission(&self, bin_names: &[String]) {
        let bins: Vec<_> = {
            let table = self.lock_table(&self.connection_bins);
            bin_names
                .iter()
                .filter_map(|name| table.get(name).cloned())
                .collect()
        };
        for bin in bins {
            bin.note_connection_destruction();
        }
    }

    // Fetch acquisition (may wait on pacing).

    /// Queue on every named fetch bin, wait out each bin's pacing
    /// deadline, then open the read-pacing series on the matching
    /// throttle bins. Shutdown or cancellation mid-wait puts all
    /// unconsumed queue slots back.
    pub async fn obtain_fetch_document_permission(
        self: &Arc<Self>,
        bin_names: &Arc<[String]>,
    ) -> Option<StreamThrottler> {
        if !self.is_alive() {
            return None;
        }

        let mut bins: Vec<Arc<FetchBin>> = Vec::with_capacity(bin_names.len());
        for name in bin_names.iter() {
            let bin = self.fetch_bin(name);
            if !bin.reserve_fetch_request() {
                debug!(bin = %bin.bin_name(), "fetch reservation denied, rewinding");
                for held in bins.iter().rev() {
                    held.clear_reservation();
                }
                return None;
            }
            bins.push(bin);
        }

        // The guard clears every still-reserved slot if the wait fails
        // or the caller's future is dropped mid-pacing.
        let mut pending = FetchReservations::new(&bins);
        while let Some(bin) = pending.next_waiting() {
            if !bin.wait_next_fetch().await {
                return None;
            }
            pending.note_granted();
        }
        drop(pending);

        // Each stream corresponds to one fetch, so throttle bins come
        // into existence here rather than during reserve.
        for name in bin_names.iter() {
            self.throttle_bin(name).begin_fetch();
        }
        Some(StreamThrottler::new(Arc::clone(self), Arc::clone(bin_names)))
    }

    // Stream read acquisition (may wait on byte rate).

    /// Wait for `byte_count` bytes of budget on every named throttle
    /// bin. False means shutting down; provisional grants on earlier
    /// bins are given back.
    pub async fn obtain_read_permission(&self, bin_names: &[String], byte_count: usize) -> bool {
        let mut bins: Vec<Arc<ThrottleBin>> = Vec::with_capacity(bin_names.len());
        {
            let table = self.lock_table(&self.throttle_bins);
            for name in bin_names {
                match table.get(name) {
                    Some(bin) => bins.push(Arc::clone(bin)),
                    // The group was torn down under this stream.
                    None => return false,
                }
            }
        }

        let mut granted = ReadGrants::new(&bins, byte_count);
        while let Some(bin) = granted.next_waiting() {
            if !bin.begin_read(byte_count).await {
                return false;
            }
            granted.note_granted();
        }
        granted.commit();
        true
    }

    /// Reconcile a completed read on every named bin (short reads give
    /// budget back).
    pub fn release_read_permission(
        &self,
        bin_names: &[String],
        orig_byte_count: usize,
        actual_byte_count: usize,
    ) {
        let bins: Vec<_> = {
            let table = self.lock_table(&self.throttle_bins);
            bin_names
                .iter()
                .filter_map(|name| table.get(name).cloned())
                .collect()
        };
        for bin in bins {
            bin.end_read(orig_byte_count, actual_byte_count);
        }
    }

    /// Close a stream against every named bin, ending each bin's series
    /// when it was the last stream.
    pub fn close_stream(&self, bin_names: &[String]) {
        let bins: Vec<_> = {
            let table = self.lock_table(&self.throttle_bins);
            bin_names
                .iter()
                .filter_map(|name| table.get(name).cloned())
                .collect()
        };
        for bin in bins {
            bin.end_fetch();
        }
    }

    // Bookkeeping.

    /// Push current spec values into every existing bin.
    pub fn poll(&self) {
        let spec = self.current_spec();
        {
            let bins = self.lock_table(&self.connection_bins);
            for bin in bins.values() {
                bin.update_max_active_connections(spec.max_open_connections(bin.bin_name()));
            }
        }
        {
            let bins = self.lock_table(&self.fetch_bins);
            for bin in bins.values() {
                bin.update_min_time_between_fetches(spec.minimum_millis_per_fetch(bin.bin_name()));
            }
        }
        {
            let bins = self.lock_table(&self.throttle_bins);
            for bin in bins.values() {
                bin.update_minimum_millis_per_byte(spec.minimum_millis_per_byte(bin.bin_name()));
            }
        }
    }

    /// Drop bins whose removal cannot relax any live constraint: no
    /// counters, no reservations, and (for fetch bins) a pacing deadline
    /// already in the past. A bin whose strong count exceeds the table's
    /// own reference is never dropped: every escaping `Arc` is cloned
    /// under the table lock, so an extra reference means some
    /// acquisition is between its lookup and its counter bump, and
    /// evicting the bin would split its counters across two objects. A
    /// dropped bin is recreated from the live spec on next use.
    pub fn free_unused_resources(&self) {
        let mut dropped = 0usize;
        {
            let mut bins = self.lock_table(&self.connection_bins);
            let before = bins.len();
            bins.retain(|_, bin| Arc::strong_count(bin) > 1 || !bin.is_idle());
            dropped += before - bins.len();
        }
        {
            let mut bins = self.lock_table(&self.fetch_bins);
            let before = bins.len();
            bins.retain(|_, bin| Arc::strong_count(bin) > 1 || !bin.is_idle());
            dropped += before - bins.len();
        }
        {
            let mut bins = self.lock_table(&self.throttle_bins);
            let before = bins.len();
            bins.retain(|_, bin| Arc::strong_count(bin) > 1 || !bin.is_idle());
            dropped += before - bins.len();
        }
        if dropped > 0 {
            debug!(service = %self.service_type_name, dropped, "freed unused bins");
        }
    }

    /// Shut down every bin (releasing all waiters with the
    /// shutting-down indication), discard the tables, and end the
    /// group's service activity. Idempotent.
    pub fn destroy(&self, registry: &dyn ServiceRegistry) -> ThrottleResult<()> {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if *state != GroupState::Alive {
                return Ok(());
            }
            *state = GroupState::Draining;
        }

        {
            let mut bins = self.lock_table(&self.connection_bins);
            for bin in bins.values() {
                bin.shut_down();
            }
            bins.clear();
        }
        {
            let mut bins = self.lock_table(&self.fetch_bins);
            for bin in bins.values() {
                bin.shut_down();
            }
            bins.clear();
        }
        {
            let mut bins = self.lock_table(&self.throttle_bins);
            for bin in bins.values() {
                bin.shut_down();
            }
            bins.clear();
        }

        *self.state.lock().expect("poisoned lock") = GroupState::Dead;
        registry.end_service_activity(&self.service_type_name, &self.service_name)?;
        info!(service = %self.service_type_name, "throttle group destroyed");
        Ok(())
    }

    // Lazy bin creation. Each table's lock is taken only for the lookup
    // or insert; bin parameters are seeded from the live spec so a fresh
    // bin is never unthrottled while waiting for the next poll.

    fn connection_bin(&self, name: &str) -> Arc<ConnectionBin> {
        let mut bins = self.lock_table(&self.connection_bins);
        if let Some(bin) = bins.get(name) {
            return Arc::clone(bin);
        }
        let max = self.current_spec().max_open_connections(name);
        let bin = Arc::new(ConnectionBin::new(name, max));
        bins.insert(name.to_string(), Arc::clone(&bin));
        bin
    }

    fn fetch_bin(&self, name: &str) -> Arc<FetchBin> {
        let mut bins = self.lock_table(&self.fetch_bins);
        if let Some(bin) = bins.get(name) {
            return Arc::clone(bin);
        }
        let millis = self.current_spec().minimum_millis_per_fetch(name);
        let bin = Arc::new(FetchBin::new(name, millis));
        bins.insert(name.to_string(), Arc::clone(&bin));
        bin
    }

    fn throttle_bin(&self, name: &str) -> Arc<ThrottleBin> {
        let mut bins = self.lock_table(&self.throttle_bins);
        if let Some(bin) = bins.get(name) {
            return Arc::clone(bin);
        }
        let millis = self.current_spec().minimum_millis_per_byte(name);
        let bin = Arc::new(ThrottleBin::new(name, millis));
        bins.insert(name.to_string(), Arc::clone(&bin));
        bin
    }

    fn current_spec(&self) -> SharedThrottleSpec {
        Arc::clone(&self.spec.lock().expect("poisoned lock"))
    }

    fn lock_table<'a, T>(&self, table: &'a Mutex<T>) -> MutexGuard<'a, T> {
        table.lock().expect("poisoned lock")
    }
}

/// Rewind guard for the fetch wait phase: on drop, clears the queue
/// slots not yet consumed by a grant. A completed wait phase has
/// consumed every slot, so dropping the guard then clears nothing.
struct FetchReservations<'a> {
    bins: &'a [Arc<FetchBin>],
    granted: usize,
}

impl<'a> FetchReservations<'a> {
    fn new(bins: &'a [Arc<FetchBin>]) -> Self {
        Self { bins, granted: 0 }
    }

    fn next_waiting(&self) -> Option<&'a Arc<FetchBin>> {
        self.bins.get(self.granted)
    }

    fn note_granted(&mut self) {
        self.granted += 1;
    }
}

impl Drop for FetchReservations<'_> {
    fn drop(&mut self) {
        for bin in &self.bins[self.granted..] {
            bin.clear_reservation();
        }
    }
}

/// Rewind guard for the read wait phase: on drop, gives back the bytes
/// provisionally counted on bins already granted. `commit` keeps them
/// once every bin has granted.
struct ReadGrants<'a> {
    bins: &'a [Arc<ThrottleBin>],
    byte_count: usize,
    granted: usize,
    committed: bool,
}

impl<'a> ReadGrants<'a> {
    fn new(bins: &'a [Arc<ThrottleBin>], byte_count: usize) -> Self {
        Self {
            bins,
            byte_count,
            granted: 0,
            committed: false,
        }
    }

    fn next_waiting(&self) -> Option<&'a Arc<ThrottleBin>> {
        self.bins.get(self.granted)
    }

    fn note_granted(&mut self) {
        self.granted += 1;
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ReadGrants<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for bin in &self.bins[..self.granted] {
            bin.end_read(self.byte_count, 0);
        }
    }
}

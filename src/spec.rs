//! Throttle specifications: the per-bin limits supplied by callers.

use std::collections::HashMap;
use std::sync::Arc;

/// Answers the three limit queries for the bins of one throttle group.
///
/// Implementations must be cheap, pure lookups: the engine re-reads the
/// live spec on every `poll` and when seeding a lazily created bin. A
/// spec can be replaced at runtime via
/// [`Throttler::create_or_update_throttle_group`](crate::Throttler::create_or_update_throttle_group);
/// existing bins pick up the new values immediately.
pub trait ThrottleSpec: Send + Sync {
    /// Maximum number of connections that may be open at once against
    /// the named bin.
    fn max_open_connections(&self, bin_name: &str) -> u32;

    /// Minimum milliseconds between successive fetch starts on the
    /// named bin. Zero disables fetch pacing.
    fn minimum_millis_per_fetch(&self, bin_name: &str) -> u64;

    /// Minimum milliseconds per byte read from streams on the named
    /// bin. Zero disables byte-rate pacing.
    fn minimum_millis_per_byte(&self, bin_name: &str) -> f64;
}

/// Shared, replaceable spec handle as stored by each group.
pub(crate) type SharedThrottleSpec = Arc<dyn ThrottleSpec>;

/// Per-bin limit overrides used by [`StaticThrottleSpec`].
#[derive(Debug, Clone, Default)]
struct BinLimits {
    max_open_connections: Option<u32>,
    minimum_millis_per_fetch: Option<u64>,
    minimum_millis_per_byte: Option<f64>,
}

/// A fixed [`ThrottleSpec`] built from per-bin overrides over
/// configurable defaults.
///
/// Defaults are fully open: unlimited connections, no fetch pacing, no
/// byte-rate pacing. Bins not named by any override use the defaults.
#[derive(Debug, Clone)]
pub struct StaticThrottleSpec {
    default_max_open_connections: u32,
    default_minimum_millis_per_fetch: u64,
    default_minimum_millis_per_byte: f64,
    bins: HashMap<String, BinLimits>,
}

impl Default for StaticThrottleSpec {
    fn default() -> Self {
        Self {
            default_max_open_connections: u32::MAX,
            default_minimum_millis_per_fetch: 0,
            default_minimum_millis_per_byte: 0.0,
            bins: HashMap::new(),
        }
    }
}

impl StaticThrottleSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection limit applied to bins without an override.
    pub fn default_max_open_connections(mut self, max: u32) -> Self {
        self.default_max_open_connections = max;
        self
    }

    /// Set the fetch interval applied to bins without an override.
    pub fn default_minimum_millis_per_fetch(mut self, millis: u64) -> Self {
        self.default_minimum_millis_per_fetch = millis;
        self
    }

    /// Set the byte rate applied to bins without an override.
    pub fn default_minimum_millis_per_byte(mut self, millis: f64) -> Self {
        self.default_minimum_millis_per_byte = millis;
        self
    }

    /// Cap open connections for one bin.
    pub fn with_max_open_connections(mut self, bin_name: &str, max: u32) -> Self {
        self.bin_entry(bin_name).max_open_connections = Some(max);
        self
    }

    /// Set the minimum interval between fetch starts for one bin.
    pub fn with_minimum_millis_per_fetch(mut self, bin_name: &str, millis: u64) -> Self {
        self.bin_entry(bin_name).minimum_millis_per_fetch = Some(millis);
        self
    }

    /// Set the minimum milliseconds per byte read for one bin.
    pub fn with_minimum_millis_per_byte(mut self, bin_name: &str, millis: f64) -> Self {
        self.bin_entry(bin_name).minimum_millis_per_byte = Some(millis);
        self
    }

    fn bin_entry(&mut self, bin_name: &str) -> &mut BinLimits {
        self.bins.entry(bin_name.to_string()).or_default()
    }
}

impl ThrottleSpec for StaticThrottleSpec {
    fn max_open_connections(&self, bin_name: &str) -> u32 {
        self.bins
            .get(bin_name)
            .and_then(|b| b.max_open_connections)
            .unwrap_or(self.default_max_open_connections)
    }

    fn minimum_millis_per_fetch(&self, bin_name: &str) -> u64 {
        self.bins
            .get(bin_name)
            .and_then(|b| b.minimum_millis_per_fetch)
            .unwrap_or(self.default_minimum_millis_per_fetch)
    }

    fn minimum_millis_per_byte(&self, bin_name: &str) -> f64 {
        self.bins
            .get(bin_name)
            .and_then(|b| b.minimum_millis_per_byte)
            .unwrap_or(self.default_minimum_millis_per_byte)
    }
}

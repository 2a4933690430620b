//! Root throttler: the registry of throttle groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::ThrottleResult;
use crate::group::ThrottleGroup;
use crate::handles::ConnectionThrottler;
use crate::registry::{InProcessRegistry, ServiceRegistry};
use crate::spec::{SharedThrottleSpec, ThrottleSpec};

/// Multi-dimensional throttling coordinator.
///
/// Maps group types (one per connector family) to sets of named throttle
/// groups, each a self-consistent throttling environment. The root lock
/// guards only the type map; each group set and each group's bin tables
/// lock independently, and no blocking ever happens under a structural
/// lock. Usually one `Throttler` exists per connector family that needs
/// throttling.
pub struct Throttler {
    registry: Arc<dyn ServiceRegistry>,
    group_sets: Mutex<HashMap<String, Arc<GroupSet>>>,
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttler {
    /// Create a throttler backed by the local in-process registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(InProcessRegistry::new()))
    }

    /// Create a throttler backed by a caller-supplied service registry,
    /// e.g. a cluster lock manager apportioning quota among peers.
    pub fn with_registry(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            group_sets: Mutex::new(HashMap::new()),
        }
    }

    /// Install or replace the spec for a group, creating the group if
    /// absent. Idempotent; outstanding handles stay valid and see the
    /// new limits on their next operation.
    pub fn create_or_update_throttle_group(
        &self,
        group_type: &str,
        group_name: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> ThrottleResult<()> {
        let set = self.group_set(group_type);
        set.create_or_update(group_name, spec, &*self.registry)
    }

    /// Destroy a group. Waiters on any of its bins are released with the
    /// shutting-down indication; a no-op for unknown groups.
    pub fn remove_throttle_group(&self, group_type: &str, group_name: &str) -> ThrottleResult<()> {
        let Some(set) = self.existing_group_set(group_type) else {
            return Ok(());
        };
        set.remove(group_name, &*self.registry)
    }

    /// Snapshot of the known group names for a group type, sorted.
    pub fn throttle_groups(&self, group_type: &str) -> Vec<String> {
        match self.existing_group_set(group_type) {
            Some(set) => set.group_names(),
            None => Vec::new(),
        }
    }

    /// Look up a group and bind a connection throttler to it for the
    /// given bin names. Non-blocking; `None` when the group does not
    /// exist or is being torn down.
    pub fn obtain_connection_throttler(
        &self,
        group_type: &str,
        group_name: &str,
        bin_names: &[&str],
    ) -> Option<ConnectionThrottler> {
        let set = self.existing_group_set(group_type)?;
        let group = set.group(group_name)?;
        if !group.is_alive() {
            return None;
        }
        let bin_names: Arc<[String]> = bin_names.iter().map(|s| s.to_string()).collect();
        Some(ConnectionThrottler::new(group, bin_names))
    }

    /// Refresh every bin of every group of this type from its live
    /// spec. Idempotent in the absence of spec changes.
    pub fn poll(&self, group_type: &str) {
        if let Some(set) = self.existing_group_set(group_type) {
            set.poll();
        }
    }

    /// Sweep all groups, dropping bins that no longer constrain
    /// anything.
    pub fn free_unused_resources(&self) {
        for set in self.all_group_sets() {
            set.free_unused_resources();
        }
    }

    /// Destroy all groups, releasing every waiter and ending all
    /// service activity.
    pub fn destroy(&self) -> ThrottleResult<()> {
        let sets: Vec<Arc<GroupSet>> = {
            let mut group_sets = self.group_sets.lock().expect("poisoned lock");
            group_sets.drain().map(|(_, set)| set).collect()
        };
        let mut first_error = None;
        for set in sets {
            if let Err(err) = set.destroy_all(&*self.registry) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn group_set(&self, group_type: &str) -> Arc<GroupSet> {
        let mut group_sets = self.group_sets.lock().expect("poisoned lock");
        Arc::clone(
            group_sets
                .entry(group_type.to_string())
                .or_insert_with(|| Arc::new(GroupSet::new(group_type))),
        )
    }

    fn existing_group_set(&self, group_type: &str) -> Option<Arc<GroupSet>> {
        self.group_sets
            .lock()
            .expect("poisoned lock")
            .get(group_type)
            .cloned()
    }

    fn all_group_sets(&self) -> Vec<Arc<GroupSet>> {
        self.group_sets
            .lock()
            .expect("poisoned lock")
            .values()
            .cloned()
            .collect()
    }
}

/// The namespace of throttle groups for one group type.
struct GroupSet {
    group_type: String,
    groups: Mutex<HashMap<String, Arc<ThrottleGroup>>>,
}

impl GroupSet {
    fn new(group_type: &str) -> Self {
        Self {
            group_type: group_type.to_string(),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn create_or_update(
        &self,
        group_name: &str,
        spec: SharedThrottleSpec,
        registry: &dyn ServiceRegistry,
    ) -> ThrottleResult<()> {
        let mut groups = self.groups.lock().expect("poisoned lock");
        match groups.get(group_name) {
            Some(group) => group.update_throttle_specification(spec),
            None => {
                let group = ThrottleGroup::new(&self.group_type, group_name, spec, registry)?;
                groups.insert(group_name.to_string(), Arc::new(group));
            }
        }
        Ok(())
    }

    /// Removal and destruction happen under the one lock, so a racing
    /// re-creation cannot observe a half-destroyed group.
    fn remove(&self, group_name: &str, registry: &dyn ServiceRegistry) -> ThrottleResult<()> {
        let mut groups = self.groups.lock().expect("poisoned lock");
        if let Some(group) = groups.remove(group_name) {
            info!(group_type = %self.group_type, group_name, "removing throttle group");
            group.destroy(registry)?;
        }
        Ok(())
    }

    fn group(&self, group_name: &str) -> Option<Arc<ThrottleGroup>> {
        self.groups
            .lock()
            .expect("poisoned lock")
            .get(group_name)
            .cloned()
    }

    fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .lock()
            .expect("poisoned lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn poll(&self) {
        let groups: Vec<_> = {
            let groups = self.groups.lock().expect("poisoned lock");
            groups.values().cloned().collect()
        };
        for group in groups {
            group.poll();
        }
    }

    fn free_unused_resources(&self) {
        let groups: Vec<_> = {
            let groups = self.groups.lock().expect("poisoned lock");
            groups.values().cloned().collect()
        };
        for group in groups {
            group.free_unused_resources();
        }
    }

    fn destroy_all(&self, registry: &dyn ServiceRegistry) -> ThrottleResult<()> {
        let drained: Vec<(String, Arc<ThrottleGroup>)> = {
            let mut groups = self.groups.lock().expect("poisoned lock");
            groups.drain().collect()
        };
        let mut first_error = None;
        for (group_name, group) in drained {
            info!(group_type = %self.group_type, %group_name, "removing throttle group");
            if let Err(err) = group.destroy(registry) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

//! Service registration for throttle groups.
//!
//! Every group registers an anonymous service under a name derived from
//! its group type and group name, and ends that activity when the group
//! is destroyed. A cluster lock manager can implement
//! [`ServiceRegistry`] to observe which peers share a throttle pool and
//! apportion global quota among them; the default
//! [`InProcessRegistry`] keeps the bookkeeping local and treats this
//! node as the sole member.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::RegistryError;

/// Prefix of every service type name registered by throttle groups.
pub const SERVICE_TYPE_PREFIX: &str = "_THROTTLEPOOL_";

/// Derive the service type name for a (group type, group name) pair.
pub(crate) fn build_service_type_name(group_type: &str, group_name: &str) -> String {
    format!("{SERVICE_TYPE_PREFIX}{group_type}_{group_name}")
}

/// Tracks which services are active for each throttle pool.
///
/// Registration is anonymous: the registry assigns and returns the
/// service name. Implementations must be thread-safe; both methods are
/// called with structural locks held, so they must not block.
pub trait ServiceRegistry: Send + Sync {
    /// Register an anonymous service of the given type and begin its
    /// activity. Returns the assigned service name.
    fn register_service(&self, service_type: &str) -> Result<String, RegistryError>;

    /// End the activity of a previously registered service.
    fn end_service_activity(
        &self,
        service_type: &str,
        service_name: &str,
    ) -> Result<(), RegistryError>;
}

/// Local, in-process [`ServiceRegistry`].
#[derive(Debug, Default)]
pub struct InProcessRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<String, HashSet<String>>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of services currently active under a service type.
    pub fn active_service_count(&self, service_type: &str) -> usize {
        self.active
            .lock()
            .expect("poisoned lock")
            .get(service_type)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

impl ServiceRegistry for InProcessRegistry {
    fn register_service(&self, service_type: &str) -> Result<String, RegistryError> {
        let service_name = format!("_ANON_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.active
            .lock()
            .expect("poisoned lock")
            .entry(service_type.to_string())
            .or_default()
            .insert(service_name.clone());
        debug!(service_type, %service_name, "registered service");
        Ok(service_name)
    }

    fn end_service_activity(
        &self,
        service_type: &str,
        service_name: &str,
    ) -> Result<(), RegistryError> {
        let mut active = self.active.lock().expect("poisoned lock");
        let removed = active
            .get_mut(service_type)
            .map(|names| names.remove(service_name))
            .unwrap_or(false);
        if !removed {
            return Err(RegistryError::UnknownService {
                service_type: service_type.to_string(),
                service_name: service_name.to_string(),
            });
        }
        debug!(service_type, service_name, "ended service activity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_distinct_names() {
        let registry = InProcessRegistry::new();
        let a = registry.register_service("_THROTTLEPOOL_web_main").unwrap();
        let b = registry.register_service("_THROTTLEPOOL_web_main").unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.active_service_count("_THROTTLEPOOL_web_main"), 2);
    }

    #[test]
    fn test_end_activity_removes_service() {
        let registry = InProcessRegistry::new();
        let name = registry.register_service("_THROTTLEPOOL_web_main").unwrap();
        registry
            .end_service_activity("_THROTTLEPOOL_web_main", &name)
            .unwrap();
        assert_eq!(registry.active_service_count("_THROTTLEPOOL_web_main"), 0);
    }

    #[test]
    fn test_end_activity_unknown_service_is_an_error() {
        let registry = InProcessRegistry::new();
        let err = registry
            .end_service_activity("_THROTTLEPOOL_web_main", "_ANON_99")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownService { .. }));
    }

    #[test]
    fn test_service_type_name_derivation() {
        assert_eq!(
            build_service_type_name("web", "main"),
            "_THROTTLEPOOL_web_main"
        );
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

/// Host-keyed map of shared instances (circuit breakers, rate limiters).
///
/// Lookups take the read lock; the first caller for a new host inserts under
/// the write lock, so racing callers always end up with the same instance.
/// Cloning the registry shares the underlying map.
pub struct HostRegistry<V> {
    entries: Arc<RwLock<HashMap<String, Arc<V>>>>,
}

impl<V> HostRegistry<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }

    pub fn get_or_insert_with<F>(&self, host: &str, create: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(host) {
            return existing;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(host.to_string())
            .or_insert_with(|| {
                debug!(host, "Registering new host entry");
                Arc::new(create())
            })
            .clone()
    }

    /// Registered hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, host: &str) -> Option<Arc<V>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host)
    }
}

impl<V> Clone for HostRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<V> Default for HostRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for HostRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("hosts", &self.hosts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_lazy_insert_once() {
        let registry: HostRegistry<String> = HostRegistry::new();
        let created = AtomicU32::new(0);

        let first = registry.get_or_insert_with("api.github.com", || {
            created.fetch_add(1, Ordering::SeqCst);
            "github".to_string()
        });
        let second = registry.get_or_insert_with("api.github.com", || {
            created.fetch_add(1, Ordering::SeqCst);
            "duplicate".to_string()
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, "github");
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_does_not_insert() {
        let registry: HostRegistry<u32> = HostRegistry::new();
        assert!(registry.get("linear.app").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry: HostRegistry<u32> = HostRegistry::new();
        let shared = registry.clone();

        registry.get_or_insert_with("b.example.com", || 2);
        shared.get_or_insert_with("a.example.com", || 1);

        assert_eq!(registry.hosts(), vec!["a.example.com", "b.example.com"]);
        assert_eq!(shared.len(), 2);

        assert_eq!(shared.remove("a.example.com").as_deref(), Some(&1));
        assert_eq!(registry.hosts(), vec!["b.example.com"]);
    }

    #[test]
    fn test_concurrent_insert_yields_single_instance() {
        let registry: HostRegistry<u32> = HostRegistry::new();
        let created = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let created = created.clone();
                std::thread::spawn(move || {
                    registry.get_or_insert_with("api.notion.com", || {
                        created.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                })
            })
            .collect();

        let instances: Vec<Arc<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}

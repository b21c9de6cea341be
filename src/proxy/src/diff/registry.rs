use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use twox_hash::xxh3::hash64;

/// One prior EXPLAIN of a canonical statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub when: Instant,
    pub id: u64,
}

/// Canonical-hash -> prior-EXPLAIN index shared by every session of the
/// router. Readers take the lock shared; only registering a new explainer
/// takes it exclusively. Entries older than `period` are trimmed on access.
pub struct Registry {
    max_entries: AtomicUsize,
    period: RwLock<Duration>,
    entries: RwLock<HashMap<u64, Vec<RegistryEntry>>>,
}

impl Registry {
    pub fn new(max_entries: usize, period: Duration) -> Self {
        Registry {
            max_entries: AtomicUsize::new(max_entries),
            period: RwLock::new(period),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_max_entries(&self, max_entries: usize) {
        self.max_entries.store(max_entries, Ordering::Relaxed);
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::Relaxed)
    }

    pub fn set_period(&self, period: Duration) {
        *self.period.write().unwrap() = period;
    }

    pub fn period(&self) -> Duration {
        *self.period.read().unwrap()
    }

    pub fn hash_for(canonical: &str) -> u64 {
        hash64(canonical.as_bytes())
    }

    /// Has the statement identified by `hash` been explained enough times
    /// within the period? `Some(entries)` means yes, with the ids of the
    /// queries that explained it; `None` means no, and `id` has been
    /// registered as a new explainer.
    pub fn is_explained(&self, now: Instant, hash: u64, id: u64) -> Option<Vec<RegistryEntry>> {
        let max_entries = self.max_entries();
        let period = self.period();

        {
            let entries = self.entries.read().unwrap();
            if let Some(list) = entries.get(&hash) {
                let stale = list
                    .iter()
                    .any(|e| now.saturating_duration_since(e.when) > period);
                if !stale && list.len() >= max_entries {
                    return Some(list.clone());
                }
            }
        }

        let mut entries = self.entries.write().unwrap();
        let list = entries.entry(hash).or_default();
        list.retain(|e| now.saturating_duration_since(e.when) <= period);
        if list.len() >= max_entries {
            Some(list.clone())
        } else {
            list.push(RegistryEntry { when: now, id });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_entries_register_then_gate() {
        let registry = Registry::new(2, Duration::from_secs(60));
        let now = Instant::now();
        let hash = Registry::hash_for("SELECT * FROM t WHERE id = ?");

        assert!(registry.is_explained(now, hash, 1).is_none());
        assert!(registry.is_explained(now, hash, 2).is_none());

        let prior = registry.is_explained(now, hash, 3).unwrap();
        assert_eq!(prior.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_window_rolls_after_period() {
        let registry = Registry::new(1, Duration::from_secs(10));
        let now = Instant::now();
        let hash = Registry::hash_for("SELECT 1");

        assert!(registry.is_explained(now, hash, 1).is_none());
        assert!(registry.is_explained(now, hash, 2).is_some());

        let later = now + Duration::from_secs(11);
        assert!(registry.is_explained(later, hash, 3).is_none());
    }

    #[test]
    fn test_distinct_canonicals_do_not_interfere() {
        let registry = Registry::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(registry
            .is_explained(now, Registry::hash_for("SELECT a FROM t"), 1)
            .is_none());
        assert!(registry
            .is_explained(now, Registry::hash_for("SELECT b FROM t"), 2)
            .is_none());
    }
}

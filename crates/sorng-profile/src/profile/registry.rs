//! Registry of active profiles: at most one live entry per id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Entry stored in a [`Registry`].
pub trait Registered: Send + Sync {
    /// True once the entry has been asked to stop.
    fn is_stopping(&self) -> bool;
}

/// Result of [`Registry::admit`].
pub enum Admission<T> {
    /// A live entry already holds the id.
    Duplicate,
    Admitted {
        /// Stale holder displaced by the newcomer.
        evicted: Option<Arc<T>>,
        /// The registry was empty before this admission.
        first: bool,
    },
}

/// Map of id → active entry, guarded by one lock.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
    shutdown: AtomicBool,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl<T: Registered> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `entry` under `id` unless a live holder exists.
    pub fn admit(&self, id: &str, entry: Arc<T>) -> Admission<T> {
        let mut entries = self.lock();
        let first = entries.is_empty();

        let evicted = match entries.get(id) {
            Some(cur) if Arc::ptr_eq(cur, &entry) || !cur.is_stopping() => {
                return Admission::Duplicate;
            }
            Some(cur) => Some(cur.clone()),
            None => None,
        };

        entries.insert(id.to_string(), entry);
        Admission::Admitted { evicted, first }
    }

    /// Remove `entry` if it still holds `id`.
    ///
    /// Returns `Some(now_empty)` on removal, `None` when another entry took
    /// over the id.
    pub fn remove_if_current(&self, id: &str, entry: &Arc<T>) -> Option<bool> {
        self.release_if_current(id, entry, || {})
    }

    /// Like [`Registry::remove_if_current`], but runs `release` under the
    /// lock just before removal. A superseded entry never runs it, and no
    /// successor can be admitted while it runs.
    pub fn release_if_current<F: FnOnce()>(&self, id: &str, entry: &Arc<T>, release: F) -> Option<bool> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(cur) if Arc::ptr_eq(cur, entry) => {
                release();
                entries.remove(id);
                Some(entries.is_empty())
            }
            _ => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Refuse further admissions and return every current entry.
    pub fn shutdown(&self) -> Vec<Arc<T>> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry {
        stopping: AtomicBool,
    }

    impl Entry {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stopping: AtomicBool::new(false),
            })
        }
    }

    impl Registered for Entry {
        fn is_stopping(&self) -> bool {
            self.stopping.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn admits_first_entry() {
        let reg = Registry::new();
        match reg.admit("a", Entry::new()) {
            Admission::Admitted { evicted, first } => {
                assert!(evicted.is_none());
                assert!(first);
            }
            Admission::Duplicate => panic!("expected admission"),
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn live_holder_rejects_newcomer() {
        let reg = Registry::new();
        let a = Entry::new();
        reg.admit("x", a.clone());
        assert!(matches!(reg.admit("x", Entry::new()), Admission::Duplicate));
        assert!(matches!(reg.admit("x", a.clone()), Admission::Duplicate));
        assert!(Arc::ptr_eq(&reg.get("x").unwrap(), &a));
    }

    #[test]
    fn stopping_holder_is_evicted() {
        let reg = Registry::new();
        let a = Entry::new();
        reg.admit("x", a.clone());
        reg.admit("y", Entry::new());
        a.stopping.store(true, Ordering::SeqCst);

        let b = Entry::new();
        match reg.admit("x", b.clone()) {
            Admission::Admitted { evicted, first } => {
                assert!(Arc::ptr_eq(&evicted.unwrap(), &a));
                assert!(!first);
            }
            Admission::Duplicate => panic!("expected eviction"),
        }
        assert!(Arc::ptr_eq(&reg.get("x").unwrap(), &b));

        // The evicted entry must not remove its successor.
        assert_eq!(reg.remove_if_current("x", &a), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn superseded_entry_skips_release() {
        let reg = Registry::new();
        let a = Entry::new();
        reg.admit("x", a.clone());
        a.stopping.store(true, Ordering::SeqCst);
        let b = Entry::new();
        reg.admit("x", b.clone());

        let mut released = Vec::new();
        assert_eq!(reg.release_if_current("x", &a, || released.push("a")), None);
        assert_eq!(reg.release_if_current("x", &b, || released.push("b")), Some(true));
        assert_eq!(released, vec!["b"]);
    }

    #[test]
    fn remove_reports_empty() {
        let reg = Registry::new();
        let a = Entry::new();
        let b = Entry::new();
        reg.admit("a", a.clone());
        reg.admit("b", b.clone());
        assert_eq!(reg.remove_if_current("a", &a), Some(false));
        assert_eq!(reg.remove_if_current("b", &b), Some(true));
        assert!(reg.is_empty());
    }

    #[test]
    fn shutdown_flag() {
        let reg = Registry::new();
        reg.admit("a", Entry::new());
        assert!(!reg.is_shutdown());
        assert_eq!(reg.shutdown().len(), 1);
        assert!(reg.is_shutdown());
    }
}

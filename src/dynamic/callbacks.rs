// Callback Table - method name -> callback closure
//
// The table is keyed by method name alone: every dynamic object that declares
// "foo" dispatches to whatever is registered under "foo". Registration is
// last-write-wins.

use super::object::DynamicObject;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// A registered callback. The table owns one reference; every lookup hands out
/// another, so replacing an entry never frees a callback that is still running.
pub type Callback = Arc<dyn Fn(&DynamicObject) + Send + Sync>;

#[derive(Default)]
pub struct CallbackTable {
    entries: RwLock<FxHashMap<Arc<str>, Callback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Install or replace the callback bound to `method`.
    pub fn register<F>(&self, method: &str, callback: F)
    where
        F: Fn(&DynamicObject) + Send + Sync + 'static,
    {
        self.register_shared(method, Arc::new(callback));
    }

    /// Install an already shared callback, e.g. one bound under several names.
    pub fn register_shared(&self, method: &str, callback: Callback) {
        let replaced = self
            .entries
            .write()
            .insert(Arc::from(method), callback)
            .is_some();

        if replaced {
            log::debug!("replaced callback for '{}'", method);
        } else {
            log::debug!("registered callback for '{}'", method);
        }
    }

    /// Snapshot of the callback currently bound to `method`
    pub fn lookup(&self, method: &str) -> Option<Callback> {
        self.entries.read().get(method).cloned()
    }

    /// Remove the binding for `method`, returning whether there was one.
    /// Calls already in flight keep their own snapshot and finish normally.
    pub fn unregister(&self, method: &str) -> bool {
        let removed = self.entries.write().remove(method).is_some();
        if removed {
            log::debug!("unregistered callback for '{}'", method);
        }
        removed
    }

    pub fn contains(&self, method: &str) -> bool {
        self.entries.read().contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTable")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::DynamicObjectRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let table = CallbackTable::new();
        assert!(table.lookup("foo").is_none());
        table.register("foo", |_| {});
        assert!(table.contains("foo"));
        assert!(table.lookup("foo").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let table = Arc::new(CallbackTable::new());
        let registry = DynamicObjectRegistry::new(table.clone());
        let obj = registry.create(["foo"]);

        let hits = Arc::new(AtomicUsize::new(0));
        let first = hits.clone();
        table.register("foo", move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = hits.clone();
        table.register("foo", move |_| {
            second.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(table.len(), 1);

        (table.lookup("foo").unwrap())(&obj);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let table = CallbackTable::new();
        let registry = DynamicObjectRegistry::new(Arc::new(CallbackTable::new()));
        let obj = registry.create(["foo"]);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        table.register("foo", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let snapshot = table.lookup("foo").unwrap();
        assert!(table.unregister("foo"));
        assert!(!table.unregister("foo"));
        snapshot(&obj);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_register_distinct_names() {
        let table = Arc::new(CallbackTable::new());
        let threads: Vec<_> = ["alpha", "beta"]
            .into_iter()
            .map(|name| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        table.register(name, |_| {});
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(table.names(), vec!["alpha".to_string(), "beta".to_string()]);
    }
}

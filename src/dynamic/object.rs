// Dynamic Objects - runtime identities answering a declared set of method names
//
// Usage:
//   let obj = registry.create(["foo", "bar"]);
//   callbacks.register("foo", |obj| println!("foo on {}", obj.id()));
//   registry.invoke(&obj, "foo")?;      // runs the callback once
//   registry.invoke(&obj, "bar")?;      // Err(UnboundMethod)
//   registry.invoke(&obj, "baz");       // panics: never declared

use super::callbacks::CallbackTable;
use crate::error::{HostError, Result};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a dynamic object, unique within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ObjectData {
    id: ObjectId,
    methods: Box<[Arc<str>]>,
}

/// Handle to a dynamic object. Clones share the same identity.
#[derive(Clone)]
pub struct DynamicObject {
    data: Arc<ObjectData>,
}

impl DynamicObject {
    pub fn id(&self) -> ObjectId {
        self.data.id
    }

    /// Declared method names, in declaration order
    pub fn methods(&self) -> impl Iterator<Item = &str> + '_ {
        self.data.methods.iter().map(|m| &**m)
    }

    pub fn declares(&self, method: &str) -> bool {
        self.data.methods.iter().any(|m| &**m == method)
    }

    fn same_object(&self, other: &DynamicObject) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl PartialEq for DynamicObject {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for DynamicObject {}

impl fmt::Debug for DynamicObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicObject")
            .field("id", &self.data.id)
            .field("methods", &self.methods().collect::<Vec<_>>())
            .finish()
    }
}

/// Creates dynamic objects and routes method calls on them through a
/// [`CallbackTable`].
pub struct DynamicObjectRegistry {
    callbacks: Arc<CallbackTable>,
    live: DashMap<ObjectId, DynamicObject>,
    next_id: AtomicU64,
}

impl DynamicObjectRegistry {
    pub fn new(callbacks: Arc<CallbackTable>) -> Self {
        Self {
            callbacks,
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        &self.callbacks
    }

    /// Create an object answering `method_names`. Duplicates collapse to the
    /// first occurrence; the set is fixed for the object's lifetime.
    pub fn create<I, S>(&self, method_names: I) -> DynamicObject
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut methods: Vec<Arc<str>> = Vec::new();
        for name in method_names {
            let name = name.as_ref();
            if !methods.iter().any(|m| &**m == name) {
                methods.push(Arc::from(name));
            }
        }

        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = DynamicObject {
            data: Arc::new(ObjectData {
                id,
                methods: methods.into_boxed_slice(),
            }),
        };
        self.live.insert(id, object.clone());

        log::debug!("created dynamic object #{} {:?}", id, object.methods().collect::<Vec<_>>());
        object
    }

    /// Dispatch `method` on `obj` to the callback registered for it.
    ///
    /// Returns [`HostError::UnboundMethod`] when the method is declared but no
    /// callback is installed, so "no handler" is never confused with "handler
    /// ran and did nothing".
    ///
    /// # Panics
    ///
    /// Invoking a method `obj` never declared, or invoking an object that was
    /// released (or belongs to another registry), is a contract violation and
    /// panics.
    pub fn invoke(&self, obj: &DynamicObject, method: &str) -> Result<()> {
        if !self.is_live(obj) {
            log::error!("invoke of '{}' on released object #{}", method, obj.id());
            panic!(
                "contract violation: object #{} is not live in this registry",
                obj.id()
            );
        }
        if !obj.declares(method) {
            log::error!("invoke of undeclared '{}' on object #{}", method, obj.id());
            panic!(
                "contract violation: '{}' was never declared on object #{}",
                method,
                obj.id()
            );
        }

        // The snapshot is taken under the read lock and run after it is released.
        let callback = self.callbacks.lookup(method).ok_or_else(|| HostError::UnboundMethod {
            object: obj.id(),
            method: method.to_string(),
        })?;

        log::trace!("dispatch '{}' on object #{}", method, obj.id());
        callback(obj);
        Ok(())
    }

    /// Look up a live object by id
    pub fn get(&self, id: ObjectId) -> Option<DynamicObject> {
        self.live.get(&id).map(|entry| entry.value().clone())
    }

    /// Drop the registry's record of `obj`. Returns false if it was not live.
    pub fn release(&self, obj: &DynamicObject) -> bool {
        let removed = self
            .live
            .remove_if(&obj.id(), |_, live| live.same_object(obj))
            .is_some();
        if removed {
            log::debug!("released dynamic object #{}", obj.id());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_live(&self, obj: &DynamicObject) -> bool {
        self.live
            .get(&obj.id())
            .map_or(false, |live| live.same_object(obj))
    }
}

impl fmt::Debug for DynamicObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicObjectRegistry")
            .field("live", &self.live.len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> DynamicObjectRegistry {
        DynamicObjectRegistry::new(Arc::new(CallbackTable::new()))
    }

    #[test]
    fn test_create_declares_names_in_order() {
        let registry = registry();
        let obj = registry.create(["foo", "bar", "foo"]);
        assert_eq!(obj.methods().collect::<Vec<_>>(), vec!["foo", "bar"]);
        assert!(obj.declares("bar"));
        assert!(!obj.declares("baz"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = registry();
        let a = registry.create(["foo"]);
        let b = registry.create(["foo"]);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(registry.get(a.id()), Some(a.clone()));
    }

    #[test]
    fn test_invoke_runs_callback_once_with_object() {
        let registry = registry();
        let obj = registry.create(["foo", "bar"]);

        let seen: Arc<Mutex<Vec<ObjectId>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        registry.callbacks().register("foo", move |obj| log.lock().push(obj.id()));

        registry.invoke(&obj, "foo").unwrap();
        assert_eq!(*seen.lock(), vec![obj.id()]);
    }

    #[test]
    fn test_declared_but_unbound() {
        let registry = registry();
        let obj = registry.create(["foo", "bar"]);
        let err = registry.invoke(&obj, "bar").unwrap_err();
        match err {
            HostError::UnboundMethod { object, method } => {
                assert_eq!(object, obj.id());
                assert_eq!(method, "bar");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "was never declared")]
    fn test_undeclared_method_panics() {
        let registry = registry();
        let obj = registry.create(["foo", "bar"]);
        registry.callbacks().register("baz", |_| {});
        let _ = registry.invoke(&obj, "baz");
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn test_released_object_panics() {
        let registry = registry();
        let obj = registry.create(["foo"]);
        registry.callbacks().register("foo", |_| {});
        assert!(registry.release(&obj));
        let _ = registry.invoke(&obj, "foo");
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn test_foreign_registry_object_panics() {
        let ours = registry();
        let theirs = registry();
        let _ = ours.create(["foo"]);
        let obj = theirs.create(["foo"]);
        ours.callbacks().register("foo", |_| {});
        let _ = ours.invoke(&obj, "foo");
    }

    #[test]
    fn test_callbacks_are_global_by_name() {
        let registry = registry();
        let a = registry.create(["foo"]);
        let b = registry.create(["foo", "other"]);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.callbacks().register("foo", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.invoke(&a, "foo").unwrap();
        registry.invoke(&b, "foo").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_reenter_registry() {
        let callbacks = Arc::new(CallbackTable::new());
        let registry = Arc::new(DynamicObjectRegistry::new(callbacks.clone()));
        let obj = registry.create(["spawn", "noop"]);

        let inner = registry.clone();
        let table = callbacks.clone();
        callbacks.register("spawn", move |obj| {
            table.register("noop", |_| {});
            inner.invoke(obj, "noop").unwrap();
            inner.release(obj);
        });

        registry.invoke(&obj, "spawn").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_released_objects_leave_no_names_behind() {
        let registry = registry();
        let mut last = None;
        for i in 0..10_000 {
            let obj = registry.create([format!("m{}", i)]);
            assert!(registry.release(&obj));
            last = Some(obj);
        }
        assert!(registry.is_empty());

        // the surviving handle is the only owner of its name
        let obj = last.unwrap();
        assert_eq!(Arc::strong_count(&obj.data.methods[0]), 1);
    }

    #[test]
    fn test_release_twice() {
        let registry = registry();
        let obj = registry.create(["foo"]);
        assert!(registry.release(&obj));
        assert!(!registry.release(&obj));
        assert!(registry.get(obj.id()).is_none());
    }
}

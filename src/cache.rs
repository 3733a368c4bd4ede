//! Dependency-indexed caches for expensive computed artifacts.
//!
//! A [`Cache`] maps structural keys to lazily-computed values (assembled
//! operators, factorizations, local solvers). Every entry records the
//! variables it depends on; when any of those variables changes value or
//! identity, the entry is cleared. Invalidation is driven through the
//! per-variable [`Caches`] registry, which knows which caches hold entries
//! for the variable and can clear exactly those entries rather than scanning
//! whole caches.
//!
//! Entry registration is atomic: the value thunk runs before any bookkeeping
//! is installed, so a failing thunk leaves no trace.

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::var::VarId;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique cache identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheId(u64);

/// A cache entry: a clearable shared reference to a cached value.
///
/// Holders keep a `CacheRef` across invalidations; [`CacheRef::value`]
/// returns `None` once the entry has been cleared.
pub struct CacheRef<V> {
    value: Rc<RefCell<Option<Rc<V>>>>,
}

impl<V> Clone for CacheRef<V> {
    fn clone(&self) -> Self {
        CacheRef {
            value: Rc::clone(&self.value),
        }
    }
}

impl<V> CacheRef<V> {
    fn new(value: Rc<V>) -> Self {
        CacheRef {
            value: Rc::new(RefCell::new(Some(value))),
        }
    }

    /// The referenced value, or `None` if the entry has been cleared.
    pub fn value(&self) -> Option<Rc<V>> {
        self.value.borrow().clone()
    }

    /// Clear the entry. Subsequent [`CacheRef::value`] calls return `None`.
    pub fn clear(&self) {
        *self.value.borrow_mut() = None;
    }
}

/// A variable a cache entry can depend on: identity plus cache registry.
pub trait CacheDep {
    fn dep_id(&self) -> VarId;
    fn dep_caches(&self) -> Caches;
}

/// Object-safe view of a cache used by [`Caches`] for invalidation.
trait DepClear {
    fn clear_dependency(&mut self, dep_id: VarId);
}

struct CacheInner<K, V> {
    id: CacheId,
    entries: HashMap<K, CacheRef<V>>,
    // dep id -> key -> all dependency ids of that entry
    deps_map: HashMap<VarId, HashMap<K, Rc<Vec<VarId>>>>,
    // dep id -> that variable's registry, for deregistration
    dep_caches: HashMap<VarId, Weak<RefCell<CachesInner>>>,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn remove_dependency(&mut self, dep_id: VarId) {
        let Some(keys) = self.deps_map.remove(&dep_id) else {
            return;
        };
        let mut deregister: Vec<Weak<RefCell<CachesInner>>> = Vec::new();
        for (key, dep_ids) in keys {
            if let Some(entry) = self.entries.remove(&key) {
                entry.clear();
            }
            // Unwind bookkeeping for the entry's co-dependencies, and drop
            // the registry link for any co-dependency with no entries left.
            for &other in dep_ids.iter() {
                if other == dep_id {
                    continue;
                }
                if let Some(other_keys) = self.deps_map.get_mut(&other) {
                    other_keys.remove(&key);
                    if other_keys.is_empty() {
                        self.deps_map.remove(&other);
                        if let Some(w) = self.dep_caches.remove(&other) {
                            deregister.push(w);
                        }
                    }
                }
            }
        }
        if let Some(w) = self.dep_caches.remove(&dep_id) {
            deregister.push(w);
        }
        let id = self.id;
        for w in deregister {
            if let Some(caches) = w.upgrade() {
                caches.borrow_mut().caches.remove(&id);
            }
        }
    }
}

impl<K: Eq + Hash + Clone, V> DepClear for CacheInner<K, V> {
    fn clear_dependency(&mut self, dep_id: VarId) {
        self.remove_dependency(dep_id);
    }
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.clear();
        }
    }
}

/// A keyed store of computed artifacts with dependency-based invalidation.
///
/// Handles are cheap clones sharing the same store.
pub struct Cache<K, V> {
    inner: Rc<RefCell<CacheInner<K, V>>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone + 'static, V: 'static> Cache<K, V> {
    pub fn new() -> Self {
        Cache {
            inner: Rc::new(RefCell::new(CacheInner {
                id: CacheId(NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed)),
                entries: HashMap::new(),
                deps_map: HashMap::new(),
                dep_caches: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> CacheId {
        self.inner.borrow().id
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// The entry for `key`, if present.
    pub fn get(&self, key: &K) -> Option<CacheRef<V>> {
        self.inner.borrow().entries.get(key).cloned()
    }

    /// Look up `key`, computing and registering the value on a miss.
    ///
    /// The thunk is invoked at most once per key for the lifetime of the
    /// entry; a second `add` with the same key returns the stored value
    /// without recomputation. Each dependency's registry is updated to record
    /// that this cache holds an entry for it.
    pub fn add(
        &self,
        key: K,
        value: impl FnOnce() -> V,
        deps: &[&dyn CacheDep],
    ) -> (CacheRef<V>, Rc<V>) {
        let result: Result<_, Infallible> = self.try_add(key, || Ok(value()), deps);
        match result {
            Ok(pair) => pair,
            Err(e) => match e {},
        }
    }

    /// Fallible form of [`Cache::add`].
    ///
    /// Registration is all-or-nothing: if the thunk fails, no entry and no
    /// dependency bookkeeping are installed.
    pub fn try_add<E>(
        &self,
        key: K,
        value: impl FnOnce() -> Result<V, E>,
        deps: &[&dyn CacheDep],
    ) -> Result<(CacheRef<V>, Rc<V>), E> {
        if let Some(entry) = self.inner.borrow().entries.get(&key) {
            let value = entry
                .value()
                .expect("cache entry cleared behind a live key");
            return Ok((entry.clone(), value));
        }

        let value = Rc::new(value()?);
        let entry = CacheRef::new(Rc::clone(&value));
        let dep_ids = Rc::new(deps.iter().map(|d| d.dep_id()).collect::<Vec<_>>());

        let this: Rc<RefCell<dyn DepClear>> = self.inner.clone();
        let mut inner = self.inner.borrow_mut();
        let id = inner.id;
        inner.entries.insert(key.clone(), entry.clone());
        for dep in deps {
            let dep_id = dep.dep_id();
            let caches = dep.dep_caches();
            caches.register(id, Rc::downgrade(&this));
            inner
                .deps_map
                .entry(dep_id)
                .or_default()
                .insert(key.clone(), Rc::clone(&dep_ids));
            inner
                .dep_caches
                .entry(dep_id)
                .or_insert_with(|| caches.downgrade());
        }
        Ok((entry, value))
    }

    /// Clear every entry, deregistering from all dependency registries.
    pub fn clear(&self) {
        let deregister: Vec<Weak<RefCell<CachesInner>>>;
        let id;
        {
            let mut inner = self.inner.borrow_mut();
            id = inner.id;
            for (_, entry) in inner.entries.drain() {
                entry.clear();
            }
            inner.deps_map.clear();
            deregister = inner.dep_caches.drain().map(|(_, w)| w).collect();
        }
        for w in deregister {
            if let Some(caches) = w.upgrade() {
                caches.borrow_mut().caches.remove(&id);
            }
        }
    }

    /// Clear exactly the entries depending on the given variable.
    pub fn clear_dep(&self, dep_id: VarId) {
        self.inner.borrow_mut().remove_dependency(dep_id);
    }
}

impl<K: Eq + Hash + Clone + 'static, V: 'static> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

struct CachesInner {
    var_id: VarId,
    // (identity, state) of the value this registry last observed
    value_state: (VarId, u64),
    caches: HashMap<CacheId, Weak<RefCell<dyn DepClear>>>,
}

/// Per-variable registry of the caches holding entries that depend on the
/// variable.
///
/// [`Caches::update`] is the invalidation entry point: called with the
/// variable's current (or substituted) value after a solve, it clears all
/// dependent entries if the `(identity, state)` pair has changed since the
/// last observation.
pub struct Caches {
    inner: Rc<RefCell<CachesInner>>,
}

impl Clone for Caches {
    fn clone(&self) -> Self {
        Caches {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Caches {
    pub(crate) fn new(var_id: VarId, state: u64) -> Self {
        Caches {
            inner: Rc::new(RefCell::new(CachesInner {
                var_id,
                value_state: (var_id, state),
                caches: HashMap::new(),
            })),
        }
    }

    /// Number of registered caches still alive.
    pub fn len(&self) -> usize {
        self.inner
            .borrow()
            .caches
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, id: CacheId, cache: Weak<RefCell<dyn DepClear>>) {
        self.inner.borrow_mut().caches.entry(id).or_insert(cache);
    }

    fn downgrade(&self) -> Weak<RefCell<CachesInner>> {
        Rc::downgrade(&self.inner)
    }

    /// Clear, in every registered cache, the entries depending on this
    /// variable.
    pub fn clear(&self) {
        let (var_id, targets) = {
            let inner = self.inner.borrow();
            (
                inner.var_id,
                inner
                    .caches
                    .values()
                    .filter_map(Weak::upgrade)
                    .collect::<Vec<_>>(),
            )
        };
        for cache in targets {
            cache.borrow_mut().clear_dependency(var_id);
        }
        self.inner
            .borrow_mut()
            .caches
            .retain(|_, w| w.upgrade().is_some());
    }

    /// Observe a (possibly substituted) value for this variable. If the
    /// `(identity, state)` pair differs from the last observation, dependent
    /// entries are cleared and the new pair is recorded.
    pub fn update(&self, value_id: VarId, value_state: u64) {
        let changed = self.inner.borrow().value_state != (value_id, value_state);
        if changed {
            self.clear();
            self.inner.borrow_mut().value_state = (value_id, value_state);
        }
    }
}

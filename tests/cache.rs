use std::cell::Cell;
use std::rc::Rc;

use quoll::{Cache, Var};

// ============================================================
// Test 1: memoization — thunk runs at most once per key
// ============================================================

#[test]
fn memoization_computes_once() {
    let cache: Cache<&str, i32> = Cache::new();
    let y = Var::<f64>::from_values(vec![1.0]);

    let calls = Cell::new(0);
    let (_, v1) = cache.add(
        "assembled",
        || {
            calls.set(calls.get() + 1);
            42
        },
        &[&y],
    );
    let (_, v2) = cache.add(
        "assembled",
        || {
            calls.set(calls.get() + 1);
            43
        },
        &[&y],
    );

    assert_eq!(calls.get(), 1, "thunk must run at most once per key");
    assert_eq!(*v1, 42);
    assert!(Rc::ptr_eq(&v1, &v2), "both calls return the same value object");
}

// ============================================================
// Test 2: invalidation on a dependency value change
// ============================================================

#[test]
fn invalidation_on_value_change() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);
    let b = Var::<f64>::from_values(vec![2.0]);

    let (a_entry, _) = cache.add("depends-on-a", || 1, &[&a]);
    cache.add("depends-on-b", || 2, &[&b]);
    assert_eq!(cache.len(), 2);

    a.assign_values(&[5.0]);
    a.update_caches();

    assert!(cache.get(&"depends-on-a").is_none(), "entry purged");
    assert!(a_entry.value().is_none(), "held reference sees the clear");
    assert!(
        cache.get(&"depends-on-b").is_some(),
        "entry with disjoint dependencies unaffected"
    );
}

// ============================================================
// Test 3: invalidation on a dependency identity change
// ============================================================

#[test]
fn invalidation_on_identity_change() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);
    cache.add("depends-on-a", || 1, &[&a]);

    // The variable is rebound to a different value variable.
    let substituted = Var::<f64>::from_values(vec![1.0]);
    a.update_caches_from(&substituted);

    assert!(cache.get(&"depends-on-a").is_none());
}

// ============================================================
// Test 4: unchanged state leaves entries alone
// ============================================================

#[test]
fn update_without_change_keeps_entries() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);
    cache.add("depends-on-a", || 1, &[&a]);

    a.update_caches();
    a.update_caches();

    assert!(cache.get(&"depends-on-a").is_some());
}

// ============================================================
// Test 5: partial clears unwind co-dependency bookkeeping
// ============================================================

#[test]
fn partial_clear_unwinds_codependency_bookkeeping() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);
    let b = Var::<f64>::from_values(vec![2.0]);

    cache.add("ab", || 1, &[&a, &b]);
    cache.add("b-only", || 2, &[&b]);
    assert_eq!(a.caches().len(), 1);
    assert_eq!(b.caches().len(), 1);

    a.update_state();
    a.update_caches();

    assert!(cache.get(&"ab").is_none());
    assert!(cache.get(&"b-only").is_some());
    assert_eq!(a.caches().len(), 0, "no entries left for a");
    assert_eq!(b.caches().len(), 1, "b still has a live entry");

    b.update_state();
    b.update_caches();

    assert!(cache.get(&"b-only").is_none());
    assert_eq!(b.caches().len(), 0);
    assert!(cache.is_empty());
}

// ============================================================
// Test 6: clearing everything deregisters everywhere
// ============================================================

#[test]
fn clear_all() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);
    let b = Var::<f64>::from_values(vec![2.0]);
    let (entry, _) = cache.add("ab", || 1, &[&a, &b]);

    cache.clear();

    assert!(cache.is_empty());
    assert!(entry.value().is_none());
    assert_eq!(a.caches().len(), 0);
    assert_eq!(b.caches().len(), 0);
}

// ============================================================
// Test 7: a failing thunk installs nothing
// ============================================================

#[test]
fn failed_thunk_installs_nothing() {
    let cache: Cache<&str, i32> = Cache::new();
    let a = Var::<f64>::from_values(vec![1.0]);

    let result: Result<_, &str> = cache.try_add("factorization", || Err("singular"), &[&a]);
    assert!(result.is_err());
    assert!(cache.is_empty());
    assert_eq!(a.caches().len(), 0, "no dependency bookkeeping installed");

    // A later add with the same key computes normally.
    let (_, v) = cache.add("factorization", || 7, &[&a]);
    assert_eq!(*v, 7);
    assert_eq!(cache.len(), 1);
}

// ============================================================
// Test 8: dropping the last cache handle clears held references
// ============================================================

#[test]
fn dropping_cache_clears_entries() {
    let a = Var::<f64>::from_values(vec![1.0]);
    let entry = {
        let cache: Cache<&str, i32> = Cache::new();
        let (entry, _) = cache.add("transient", || 9, &[&a]);
        entry
    };
    assert!(entry.value().is_none());
}

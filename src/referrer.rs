//! Reference graph between equations, matrices and right-hand-side terms.
//!
//! Containers register themselves as referrers of the objects they are built
//! from, so that the set of records kept alive by a given object can be
//! enumerated. Registration is explicit: a [`Referrer`] token registers its
//! id on construction and deregisters on drop. No finalizer-driven
//! bookkeeping exists anywhere; all edges appear and disappear at explicit
//! lifecycle events.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REFERRER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a node in the reference graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferrerId(u64);

impl fmt::Display for ReferrerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

thread_local! {
    // node id -> ids of nodes referring to it
    static GRAPH: RefCell<HashMap<ReferrerId, HashSet<ReferrerId>>> =
        RefCell::new(HashMap::new());
}

/// Registration token for one node of the reference graph.
///
/// Not clonable: each token owns its registration, and dropping it removes
/// the node and every edge mentioning it.
pub struct Referrer {
    id: ReferrerId,
}

impl Referrer {
    pub fn new() -> Self {
        let id = ReferrerId(NEXT_REFERRER_ID.fetch_add(1, Ordering::Relaxed));
        GRAPH.with(|g| {
            g.borrow_mut().insert(id, HashSet::new());
        });
        Referrer { id }
    }

    pub fn id(&self) -> ReferrerId {
        self.id
    }

    /// Record that `referrer` refers to (keeps alive) this node.
    pub fn add_referrer(&self, referrer: &Referrer) {
        GRAPH.with(|g| {
            g.borrow_mut()
                .entry(self.id)
                .or_default()
                .insert(referrer.id);
        });
    }
}

impl Default for Referrer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Referrer {
    fn drop(&mut self) {
        GRAPH.with(|g| {
            let mut g = g.borrow_mut();
            g.remove(&self.id);
            for referrers in g.values_mut() {
                referrers.remove(&self.id);
            }
        });
    }
}

impl fmt::Debug for Referrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Referrer").field(&self.id).finish()
    }
}

/// All nodes transitively referring to `id`, including `id` itself, by
/// breadth-first traversal. Sorted by id.
pub fn transitive_referrers(id: ReferrerId) -> Vec<ReferrerId> {
    GRAPH.with(|g| {
        let g = g.borrow();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if g.contains_key(&id) {
            seen.insert(id);
            queue.push_back(id);
        }
        while let Some(node) = queue.pop_front() {
            if let Some(referrers) = g.get(&node) {
                for &r in referrers {
                    if seen.insert(r) {
                        queue.push_back(r);
                    }
                }
            }
        }
        let mut out: Vec<ReferrerId> = seen.into_iter().collect();
        out.sort_unstable();
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_follows_chains() {
        let a = Referrer::new();
        let b = Referrer::new();
        let c = Referrer::new();
        a.add_referrer(&b);
        b.add_referrer(&c);

        let reachable = transitive_referrers(a.id());
        assert!(reachable.contains(&a.id()));
        assert!(reachable.contains(&b.id()));
        assert!(reachable.contains(&c.id()));

        let from_b = transitive_referrers(b.id());
        assert!(!from_b.contains(&a.id()));
    }

    #[test]
    fn drop_deregisters() {
        let a = Referrer::new();
        let a_id = a.id();
        let b = Referrer::new();
        a.add_referrer(&b);
        drop(b);
        let reachable = transitive_referrers(a_id);
        assert_eq!(reachable, vec![a_id]);
        drop(a);
        assert!(transitive_referrers(a_id).is_empty());
    }
}

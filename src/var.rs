//! Variables: shared handles to mutable dense value vectors.
//!
//! A [`Var`] has identity (a process-unique [`VarId`]), a state counter that
//! is bumped on every mutation, a [`SpaceType`], and an attached [`Caches`]
//! registry recording which caches hold entries depending on it. Handles are
//! cheap to clone and compare by identity. A *replacement* handle shares the
//! identity but carries no values: it can still answer structural queries
//! (identity, space, length) after the values have been reclaimed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::{CacheDep, Caches};
use crate::float::Float;
use crate::space::{RelSpaceType, SpaceType};

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique variable identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    fn fresh() -> Self {
        VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

struct VarData<F> {
    state: Cell<u64>,
    /// `None` for replacement handles.
    values: RefCell<Option<Vec<F>>>,
    caches: Caches,
}

/// A variable: a shared handle to a mutable dense value vector.
///
/// Equality, ordering into dependency lists, and cache bookkeeping are all by
/// identity ([`VarId`]); value comparison is explicit via [`Var::values`].
pub struct Var<F: Float> {
    id: VarId,
    len: usize,
    space_type: SpaceType,
    checkpointed: bool,
    alias: bool,
    data: Rc<VarData<F>>,
}

impl<F: Float> Clone for Var<F> {
    fn clone(&self) -> Self {
        Var {
            id: self.id,
            len: self.len,
            space_type: self.space_type,
            checkpointed: self.checkpointed,
            alias: self.alias,
            data: Rc::clone(&self.data),
        }
    }
}

impl<F: Float> Var<F> {
    fn with_values(values: Vec<F>, space_type: SpaceType, checkpointed: bool) -> Self {
        let id = VarId::fresh();
        Var {
            id,
            len: values.len(),
            space_type,
            checkpointed,
            alias: false,
            data: Rc::new(VarData {
                state: Cell::new(0),
                values: RefCell::new(Some(values)),
                caches: Caches::new(id, 0),
            }),
        }
    }

    /// A new zero-valued checkpointed variable in the primal space.
    pub fn new(len: usize) -> Self {
        Self::new_typed(len, SpaceType::Primal)
    }

    /// A new zero-valued checkpointed variable in the given space.
    pub fn new_typed(len: usize, space_type: SpaceType) -> Self {
        Self::with_values(vec![F::zero(); len], space_type, true)
    }

    /// A new zero-valued non-checkpointed variable in the primal space.
    ///
    /// Non-checkpointed variables hold static data: tangent-linear
    /// propagation treats their directional derivative as identically zero
    /// unless they are declared as controls.
    pub fn new_static(len: usize) -> Self {
        Self::with_values(vec![F::zero(); len], SpaceType::Primal, false)
    }

    /// A new checkpointed primal variable initialized from `values`.
    pub fn from_values(values: Vec<F>) -> Self {
        Self::with_values(values, SpaceType::Primal, true)
    }

    /// A new checkpointed variable initialized from `values`, in the given
    /// space.
    pub fn from_values_typed(values: Vec<F>, space_type: SpaceType) -> Self {
        Self::with_values(values, space_type, true)
    }

    /// A new non-checkpointed primal variable initialized from `values`.
    pub fn static_from_values(values: Vec<F>) -> Self {
        Self::with_values(values, SpaceType::Primal, false)
    }

    /// A new zero-valued variable with this variable's length, in the space
    /// resolved relative to this variable's space.
    pub fn new_rel(&self, rel: RelSpaceType) -> Self {
        Self::new_typed(self.len, self.space_type.relative(rel))
    }

    /// A new zero-valued variable in the conjugate dual of this variable's
    /// space.
    pub fn new_conjugate_dual(&self) -> Self {
        Self::new_typed(self.len, self.space_type.conjugate_dual())
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    /// The state counter, incremented on every mutation.
    pub fn state(&self) -> u64 {
        self.data.state.get()
    }

    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_checkpointed(&self) -> bool {
        self.checkpointed
    }

    pub fn is_alias(&self) -> bool {
        self.alias
    }

    /// Whether this handle is a replacement: structural queries work, numeric
    /// ones panic.
    pub fn is_replacement(&self) -> bool {
        self.data.values.borrow().is_none()
    }

    /// An alias handle: same identity and storage, flagged as an alias.
    /// Aliases are rejected as solutions and dependencies.
    pub fn alias(&self) -> Self {
        let mut aliased = self.clone();
        aliased.alias = true;
        aliased
    }

    /// A replacement handle: same identity, space, length and cache registry,
    /// with the value storage dropped.
    pub fn replacement(&self) -> Self {
        Var {
            id: self.id,
            len: self.len,
            space_type: self.space_type,
            checkpointed: self.checkpointed,
            alias: false,
            data: Rc::new(VarData {
                state: Cell::new(self.state()),
                values: RefCell::new(None),
                caches: self.caches(),
            }),
        }
    }

    /// The per-variable cache registry.
    pub fn caches(&self) -> Caches {
        self.data.caches.clone()
    }

    fn bump(&self) {
        self.data.state.set(self.data.state.get() + 1);
    }

    /// Mark the variable as externally mutated, bumping its state counter.
    pub fn update_state(&self) {
        self.bump();
    }

    /// Check this variable's cache registry against its own current state,
    /// clearing dependent entries on a change.
    pub fn update_caches(&self) {
        self.data.caches.update(self.id, self.state());
    }

    /// Check this variable's cache registry against a substituted value,
    /// clearing dependent entries on an identity or state change.
    pub fn update_caches_from(&self, value: &Var<F>) {
        self.data.caches.update(value.id(), value.state());
    }

    fn read<R>(&self, f: impl FnOnce(&[F]) -> R) -> R {
        match &*self.data.values.borrow() {
            Some(values) => f(values),
            None => panic!("variable {} is a replacement and has no value", self.id),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut [F]) -> R) -> R {
        let r = match &mut *self.data.values.borrow_mut() {
            Some(values) => f(values),
            None => panic!("variable {} is a replacement and has no value", self.id),
        };
        self.bump();
        r
    }

    /// A copy of the value vector.
    pub fn values(&self) -> Vec<F> {
        self.read(|v| v.to_vec())
    }

    /// The `i`th value.
    pub fn value(&self, i: usize) -> F {
        self.read(|v| v[i])
    }

    /// Assign the values of `other` to this variable.
    pub fn assign(&self, other: &Var<F>) {
        if Rc::ptr_eq(&self.data, &other.data) {
            return;
        }
        let values = other.values();
        self.assign_values(&values);
    }

    /// Assign from a slice. Lengths must agree.
    pub fn assign_values(&self, values: &[F]) {
        assert_eq!(
            values.len(),
            self.len,
            "assign length mismatch: variable {} has {} values, got {}",
            self.id,
            self.len,
            values.len()
        );
        self.write(|v| v.copy_from_slice(values));
    }

    /// Zero the values.
    pub fn zero(&self) {
        self.write(|v| v.fill(F::zero()));
    }

    /// A new variable (fresh identity) with the same values, space and
    /// length.
    pub fn copy(&self) -> Var<F> {
        Self::with_values(self.values(), self.space_type, true)
    }

    /// `self += alpha * x`.
    pub fn axpy(&self, alpha: F, x: &Var<F>) {
        assert_eq!(
            x.len, self.len,
            "axpy length mismatch: {} vs {}",
            self.len, x.len
        );
        if Rc::ptr_eq(&self.data, &x.data) {
            let scale = F::one() + alpha;
            self.write(|v| {
                for vi in v.iter_mut() {
                    *vi = *vi * scale;
                }
            });
            return;
        }
        let xv = x.values();
        self.write(|v| {
            for (vi, xi) in v.iter_mut().zip(&xv) {
                *vi = *vi + alpha * *xi;
            }
        });
    }

    /// The Euclidean inner product of the value vectors.
    pub fn inner(&self, other: &Var<F>) -> F {
        assert_eq!(
            other.len, self.len,
            "inner length mismatch: {} vs {}",
            self.len, other.len
        );
        let ov = other.values();
        self.read(|v| {
            let mut s = F::zero();
            for (a, b) in v.iter().zip(&ov) {
                s = s + *a * *b;
            }
            s
        })
    }
}

impl<F: Float> PartialEq for Var<F> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<F: Float> Eq for Var<F> {}

impl<F: Float> std::hash::Hash for Var<F> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<F: Float> fmt::Debug for Var<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("space_type", &self.space_type)
            .field("state", &self.state())
            .finish()
    }
}

impl<F: Float> CacheDep for Var<F> {
    fn dep_id(&self) -> VarId {
        self.id
    }

    fn dep_caches(&self) -> Caches {
        self.caches()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_counts_mutations() {
        let x = Var::<f64>::from_values(vec![1.0, 2.0]);
        assert_eq!(x.state(), 0);
        x.zero();
        x.assign_values(&[3.0, 4.0]);
        x.axpy(2.0, &x.copy());
        assert_eq!(x.state(), 3);
        assert_eq!(x.values(), vec![9.0, 12.0]);
    }

    #[test]
    fn axpy_aliased_handle() {
        let x = Var::<f64>::from_values(vec![1.0, 2.0]);
        let same = x.clone();
        x.axpy(1.0, &same);
        assert_eq!(x.values(), vec![2.0, 4.0]);
    }

    #[test]
    fn replacement_keeps_identity() {
        let x = Var::<f64>::from_values(vec![1.0]);
        let r = x.replacement();
        assert_eq!(r.id(), x.id());
        assert_eq!(r.len(), 1);
        assert!(r.is_replacement());
        assert!(!x.is_replacement());
    }
}

//! Adjoint right-hand-side accumulators.
//!
//! During adjoint replay, each equation subtracts its derivative actions into
//! the right-hand sides of equations that have not yet been replayed. An
//! [`AdjointRhs`] is one such per-component accumulator, lazily allocated in
//! the conjugate dual space of its forward variable. [`AdjointEquationRhs`]
//! groups the accumulators of one equation, and [`AdjointModelRhs`] those of
//! a block of equations, as consumed by the fixed-point adjoint iteration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::float::Float;
use crate::var::Var;

/// The value of one adjoint derivative action.
///
/// `Scaled(alpha, v)` stands for `alpha * v` without materializing the
/// product.
#[derive(Clone, Debug)]
pub enum AdjointAction<F: Float> {
    /// Structurally zero: no contribution.
    Zero,
    Var(Var<F>),
    Scaled(F, Var<F>),
}

impl<F: Float> AdjointAction<F> {
    /// `b -= action`.
    pub fn subtract_from(&self, b: &Var<F>) {
        match self {
            AdjointAction::Zero => {}
            AdjointAction::Var(v) => b.axpy(-F::one(), v),
            AdjointAction::Scaled(alpha, v) => b.axpy(-*alpha, v),
        }
    }
}

struct AdjointRhsInner<F: Float> {
    x: Var<F>,
    b: Option<Var<F>>,
}

/// A lazily-initialized adjoint right-hand-side accumulator for one forward
/// solution component.
///
/// Handles are cheap clones sharing the same accumulator. The underlying
/// variable lives in the conjugate dual space of the forward variable and is
/// allocated (zero) on first use.
pub struct AdjointRhs<F: Float> {
    inner: Rc<RefCell<AdjointRhsInner<F>>>,
}

impl<F: Float> Clone for AdjointRhs<F> {
    fn clone(&self) -> Self {
        AdjointRhs {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<F: Float> AdjointRhs<F> {
    pub fn new(x: &Var<F>) -> Self {
        AdjointRhs {
            inner: Rc::new(RefCell::new(AdjointRhsInner {
                x: x.clone(),
                b: None,
            })),
        }
    }

    fn force(&self) -> Var<F> {
        let mut inner = self.inner.borrow_mut();
        if inner.b.is_none() {
            inner.b = Some(inner.x.new_conjugate_dual());
        }
        inner.b.clone().unwrap()
    }

    /// Whether the accumulator has been allocated.
    pub fn is_initialized(&self) -> bool {
        self.inner.borrow().b.is_some()
    }

    /// The accumulator variable, allocating it (zero) if needed.
    pub fn b(&self) -> Var<F> {
        self.force()
    }

    /// A fresh copy of the accumulator. Use when the consumer may return or
    /// modify the right-hand side it is handed.
    pub fn b_copy(&self) -> Var<F> {
        self.force().copy()
    }

    /// Set the accumulator to the given value.
    pub fn assign(&self, value: &Var<F>) {
        self.force().assign(value);
    }

    /// Subtract a derivative action from the accumulator. A
    /// [`AdjointAction::Zero`] contribution leaves it untouched (and
    /// unallocated).
    pub fn sub(&self, action: AdjointAction<F>) {
        if matches!(action, AdjointAction::Zero) {
            return;
        }
        let b = self.force();
        action.subtract_from(&b);
    }
}

/// The adjoint right-hand-side accumulators of one equation, one per
/// solution component.
pub struct AdjointEquationRhs<F: Float> {
    b: Vec<AdjointRhs<F>>,
}

impl<F: Float> AdjointEquationRhs<F> {
    pub fn new(eq_x: &[Var<F>]) -> Self {
        AdjointEquationRhs {
            b: eq_x.iter().map(AdjointRhs::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    /// A handle to the accumulator for component `m`.
    pub fn comp(&self, m: usize) -> AdjointRhs<F> {
        self.b[m].clone()
    }

    /// The accumulator variables, allocating as needed.
    pub fn b(&self) -> Vec<Var<F>> {
        self.b.iter().map(AdjointRhs::b).collect()
    }

    /// Fresh copies of the accumulator variables.
    pub fn b_copies(&self) -> Vec<Var<F>> {
        self.b.iter().map(AdjointRhs::b_copy).collect()
    }
}

/// The adjoint right-hand sides of a block of equations.
pub struct AdjointModelRhs<F: Float> {
    eqs: Vec<AdjointEquationRhs<F>>,
}

impl<F: Float> AdjointModelRhs<F> {
    /// One [`AdjointEquationRhs`] per equation, given each equation's
    /// solution components.
    pub fn new(eq_x: &[&[Var<F>]]) -> Self {
        AdjointModelRhs {
            eqs: eq_x.iter().map(|x| AdjointEquationRhs::new(x)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.eqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eqs.is_empty()
    }

    pub fn eq(&self, i: usize) -> &AdjointEquationRhs<F> {
        &self.eqs[i]
    }
}

//! Tangent-linear variable lookup.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::equation::EquationError;
use crate::float::Float;
use crate::var::{Var, VarId};

/// Maps forward variables to their tangent-linear variables for one
/// directional derivative.
///
/// Controls map to the declared direction components; other checkpointed
/// variables get a zero tangent variable, allocated on first lookup and
/// memoized by identity. Non-checkpointed variables that are not controls
/// hold static data and have an identically-zero tangent, reported as
/// `None`.
pub struct TangentLinearMap<F: Float> {
    controls: Vec<(Var<F>, Var<F>)>,
    map: RefCell<HashMap<VarId, Var<F>>>,
}

impl<F: Float> TangentLinearMap<F> {
    /// Bind controls `m` to direction components `dm`.
    pub fn new(m: &[Var<F>], dm: &[Var<F>]) -> Result<Self, EquationError> {
        if m.len() != dm.len() {
            return Err(EquationError::ControlCountMismatch {
                controls: m.len(),
                directions: dm.len(),
            });
        }
        Ok(TangentLinearMap {
            controls: m.iter().cloned().zip(dm.iter().cloned()).collect(),
            map: RefCell::new(HashMap::new()),
        })
    }

    /// The direction component for `x`, if `x` is a control.
    pub fn control_direction(&self, x: &Var<F>) -> Option<Var<F>> {
        self.controls
            .iter()
            .find(|(m, _)| m.id() == x.id())
            .map(|(_, dm)| dm.clone())
    }

    /// The tangent-linear variable for `x`, or `None` if its tangent is
    /// identically zero (non-checkpointed data that is not a control).
    pub fn tangent(&self, x: &Var<F>) -> Option<Var<F>> {
        if let Some(dm) = self.control_direction(x) {
            return Some(dm);
        }
        if !x.is_checkpointed() {
            return None;
        }
        let mut map = self.map.borrow_mut();
        Some(
            map.entry(x.id())
                .or_insert_with(|| Var::new_typed(x.len(), x.space_type()))
                .clone(),
        )
    }

    /// The tangent-linear variable for a solution variable.
    ///
    /// Panics if `x` has no tangent variable; solution variables are
    /// checkpointed and always have one.
    pub fn var(&self, x: &Var<F>) -> Var<F> {
        self.tangent(x)
            .unwrap_or_else(|| panic!("variable {} has no tangent-linear variable", x.id()))
    }
}

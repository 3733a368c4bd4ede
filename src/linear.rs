//! Compositional linear equations: `A x = sum_i b_i`.
//!
//! A [`LinearEquation`] decomposes a linear solve into a left-hand operator
//! ([`Matrix`]) and additively-combined right-hand-side terms ([`Rhs`]), each
//! independently differentiable. The residual is `F(x, y_1, y_2, ...) =
//! A x - sum_i b_i`, or `x - sum_i b_i` when no operator is given (identity).
//!
//! Dependency indices are baked into the equation at construction and used
//! for all later lookups, so the assembly order of the dependency list is
//! fixed: solutions first, then each term's dependencies, then the
//! operator's.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::adjoint::AdjointAction;
use crate::equation::{
    push_unique, Equation, EquationError, EquationRecord, SolveError, ZeroAssignment,
};
use crate::float::Float;
use crate::referrer::Referrer;
use crate::space::RelSpaceType;
use crate::tangent::TangentLinearMap;
use crate::var::{Var, VarId};

/// Accumulation mode for action evaluations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accumulate {
    /// Set the target equal to the result.
    Assign,
    /// Add the result to the target.
    Add,
    /// Subtract the result from the target.
    Subtract,
}

/// The validated record of a [`Matrix`]: non-linear dependencies and initial
/// guess declarations.
///
/// Matrices are shared between a forward equation and its tangent-linear
/// equations, so the variable list sits behind interior mutability and
/// `drop_references` takes `&self`.
pub struct MatrixRecord<F: Float> {
    referrer: Referrer,
    nl_deps: RefCell<Vec<Var<F>>>,
    ic: bool,
    adj_ic: bool,
}

impl<F: Float> MatrixRecord<F> {
    pub fn new(nl_deps: Vec<Var<F>>, ic: bool, adj_ic: bool) -> Result<Self, EquationError> {
        let ids: std::collections::HashSet<VarId> = nl_deps.iter().map(Var::id).collect();
        if ids.len() != nl_deps.len() {
            return Err(EquationError::DuplicateNonlinearDependency);
        }
        Ok(MatrixRecord {
            referrer: Referrer::new(),
            nl_deps: RefCell::new(nl_deps),
            ic,
            adj_ic,
        })
    }

    pub fn referrer(&self) -> &Referrer {
        &self.referrer
    }

    pub fn nonlinear_dependencies(&self) -> Vec<Var<F>> {
        self.nl_deps.borrow().clone()
    }

    pub fn has_initial_condition(&self) -> bool {
        self.ic
    }

    pub fn adjoint_has_initial_condition(&self) -> bool {
        self.adj_ic
    }

    pub fn drop_references(&self) {
        let mut nl_deps = self.nl_deps.borrow_mut();
        for v in nl_deps.iter_mut() {
            *v = v.replacement();
        }
    }
}

/// A possibly-nonlinear operator `A(y) x`.
pub trait Matrix<F: Float> {
    fn record(&self) -> &MatrixRecord<F>;

    fn nonlinear_dependencies(&self) -> Vec<Var<F>> {
        self.record().nonlinear_dependencies()
    }

    /// Whether solving `A x = b` uses an initial guess.
    fn has_initial_condition(&self) -> bool {
        self.record().has_initial_condition()
    }

    /// Whether solving the adjoint system uses an initial guess.
    fn adjoint_has_initial_condition(&self) -> bool {
        self.record().adjoint_has_initial_condition()
    }

    /// Evaluate `A x` into `b` under the given accumulation mode.
    fn forward_action(
        &self,
        _nl_deps: &[Var<F>],
        _x: &[Var<F>],
        _b: &[Var<F>],
        _mode: Accumulate,
    ) -> Result<(), SolveError> {
        panic!("forward_action is not implemented for this matrix");
    }

    /// Evaluate component `b_index` of the adjoint action on `adj_x` into
    /// `b` under the given accumulation mode.
    fn adjoint_action(
        &self,
        _nl_deps: &[Var<F>],
        _adj_x: &[Var<F>],
        _b: &Var<F>,
        _b_index: usize,
        _mode: Accumulate,
    ) -> Result<(), SolveError> {
        panic!("adjoint_action is not implemented for this matrix");
    }

    /// Solve `A x = b` for `x`. `x` may hold an initial guess.
    fn forward_solve(&self, x: &[Var<F>], nl_deps: &[Var<F>], b: &[Var<F>])
        -> Result<(), SolveError>;

    /// The action of the adjoint of the derivative of `A x` with respect to
    /// non-linear dependency `nl_dep_index` on `adj_x`, accumulated into `b`.
    fn adjoint_derivative_action(
        &self,
        _nl_deps: &[Var<F>],
        _nl_dep_index: usize,
        _x: &[Var<F>],
        _adj_x: &[Var<F>],
        _b: &Var<F>,
        _mode: Accumulate,
    ) -> Result<(), SolveError> {
        panic!("adjoint_derivative_action is not implemented for this matrix");
    }

    /// Solve the adjoint system for `adj_x`. `adj_x` may hold an initial
    /// guess; returning `Ok(None)` signals a structurally zero solution.
    fn adjoint_solve(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        nl_deps: &[Var<F>],
        b: &[Var<F>],
    ) -> Result<Option<Vec<Var<F>>>, SolveError>;

    /// Right-hand-side terms obtained by differentiating `-A x` with respect
    /// to the operator's dependencies along the tangent direction, excluding
    /// the `-A tau_x` term. An empty collection means no terms.
    fn tangent_linear_rhs(
        &self,
        _m: &[Var<F>],
        _dm: &[Var<F>],
        _tlm_map: &TangentLinearMap<F>,
        _x: &[Var<F>],
    ) -> Result<Vec<Rc<dyn Rhs<F>>>, EquationError> {
        panic!("tangent_linear_rhs is not implemented for this matrix");
    }

    fn drop_references(&self) {
        self.record().drop_references();
    }
}

/// The validated record of an [`Rhs`]: dependencies and non-linear
/// dependencies.
pub struct RhsRecord<F: Float> {
    referrer: Referrer,
    deps: RefCell<Vec<Var<F>>>,
    nl_deps: RefCell<Vec<Var<F>>>,
}

impl<F: Float> RhsRecord<F> {
    /// `nl_deps` defaults to all of `deps` when `None`.
    pub fn new(deps: Vec<Var<F>>, nl_deps: Option<Vec<Var<F>>>) -> Result<Self, EquationError> {
        let dep_ids: std::collections::HashSet<VarId> = deps.iter().map(Var::id).collect();
        if dep_ids.len() != deps.len() {
            return Err(EquationError::DuplicateDependency);
        }
        let nl_deps = nl_deps.unwrap_or_else(|| deps.clone());
        let nl_dep_ids: std::collections::HashSet<VarId> =
            nl_deps.iter().map(Var::id).collect();
        if nl_dep_ids.len() != nl_deps.len() {
            return Err(EquationError::DuplicateNonlinearDependency);
        }
        if !nl_dep_ids.is_subset(&dep_ids) {
            return Err(EquationError::NonlinearDependencyNotDependency);
        }
        Ok(RhsRecord {
            referrer: Referrer::new(),
            deps: RefCell::new(deps),
            nl_deps: RefCell::new(nl_deps),
        })
    }

    pub fn referrer(&self) -> &Referrer {
        &self.referrer
    }

    pub fn dependencies(&self) -> Vec<Var<F>> {
        self.deps.borrow().clone()
    }

    pub fn nonlinear_dependencies(&self) -> Vec<Var<F>> {
        self.nl_deps.borrow().clone()
    }

    pub fn drop_references(&self) {
        for list in [&self.deps, &self.nl_deps] {
            let mut list = list.borrow_mut();
            for v in list.iter_mut() {
                *v = v.replacement();
            }
        }
    }
}

/// One additive right-hand-side contribution `b_i(y)`.
pub trait Rhs<F: Float> {
    fn record(&self) -> &RhsRecord<F>;

    fn dependencies(&self) -> Vec<Var<F>> {
        self.record().dependencies()
    }

    fn nonlinear_dependencies(&self) -> Vec<Var<F>> {
        self.record().nonlinear_dependencies()
    }

    /// Add this term to `b`. `deps` holds the values of exactly this term's
    /// declared dependencies, in declaration order.
    fn add_forward(&self, b: &[Var<F>], deps: &[Var<F>]) -> Result<(), SolveError>;

    /// Subtract the action of the adjoint of this term's derivative with
    /// respect to dependency `dep_index` (into this term's dependency list)
    /// on `adj_x` from `b`.
    fn subtract_adjoint_derivative_action(
        &self,
        nl_deps: &[Var<F>],
        dep_index: usize,
        adj_x: &[Var<F>],
        b: &Var<F>,
    ) -> Result<(), SolveError>;

    /// Right-hand-side terms obtained by differentiating this term along the
    /// tangent direction. An empty collection means no terms.
    fn tangent_linear_rhs(
        &self,
        m: &[Var<F>],
        dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Vec<Rc<dyn Rhs<F>>>, EquationError>;

    fn drop_references(&self) {
        self.record().drop_references();
    }
}

/// The solution of a linear equation `A x = sum_i b_i`.
pub struct LinearEquation<F: Float> {
    record: EquationRecord<F>,
    b: Vec<Rc<dyn Rhs<F>>>,
    b_dep_indices: Vec<Vec<usize>>,
    b_nl_dep_indices: Vec<Vec<usize>>,
    b_dep_ids: Vec<HashMap<VarId, usize>>,
    a: Option<Rc<dyn Matrix<F>>>,
    a_dep_indices: Vec<usize>,
    a_nl_dep_indices: Vec<usize>,
    a_nl_dep_ids: HashMap<VarId, usize>,
    a_x_indices: Vec<usize>,
}

impl<F: Float> LinearEquation<F> {
    /// With the default adjoint space: conjugate dual without an operator,
    /// primal with one.
    pub fn new(
        x: Vec<Var<F>>,
        b: Vec<Rc<dyn Rhs<F>>>,
        a: Option<Rc<dyn Matrix<F>>>,
    ) -> Result<Self, EquationError> {
        Self::build(x, b, a, None)
    }

    /// With explicit per-component adjoint spaces.
    pub fn with_adj_types(
        x: Vec<Var<F>>,
        b: Vec<Rc<dyn Rhs<F>>>,
        a: Option<Rc<dyn Matrix<F>>>,
        adj_types: Vec<RelSpaceType>,
    ) -> Result<Self, EquationError> {
        Self::build(x, b, a, Some(adj_types))
    }

    fn build(
        x: Vec<Var<F>>,
        b: Vec<Rc<dyn Rhs<F>>>,
        a: Option<Rc<dyn Matrix<F>>>,
        adj_types: Option<Vec<RelSpaceType>>,
    ) -> Result<Self, EquationError> {
        let adj_types = adj_types.unwrap_or_else(|| {
            let uniform = if a.is_none() {
                RelSpaceType::ConjugateDual
            } else {
                RelSpaceType::Primal
            };
            vec![uniform; x.len()]
        });

        let mut deps: Vec<Var<F>> = Vec::new();
        let mut dep_index: HashMap<VarId, usize> = HashMap::new();
        let mut nl_deps: Vec<Var<F>> = Vec::new();
        let mut nl_dep_index: HashMap<VarId, usize> = HashMap::new();

        let mut x_ids = std::collections::HashSet::new();
        for xi in &x {
            if !x_ids.insert(xi.id()) {
                return Err(EquationError::DuplicateSolve);
            }
            push_unique(&mut deps, &mut dep_index, xi);
        }

        let mut b_dep_indices = Vec::with_capacity(b.len());
        let mut b_nl_dep_indices = Vec::with_capacity(b.len());
        let mut b_dep_ids = Vec::with_capacity(b.len());
        for term in &b {
            let mut term_dep_indices = Vec::new();
            for dep in term.dependencies() {
                if x_ids.contains(&dep.id()) {
                    return Err(EquationError::RhsDependsOnSolution);
                }
                term_dep_indices.push(push_unique(&mut deps, &mut dep_index, &dep));
            }
            b_dep_indices.push(term_dep_indices);

            let mut term_nl_dep_indices = Vec::new();
            for dep in term.nonlinear_dependencies() {
                term_nl_dep_indices.push(push_unique(&mut nl_deps, &mut nl_dep_index, &dep));
            }
            b_nl_dep_indices.push(term_nl_dep_indices);

            b_dep_ids.push(
                term.dependencies()
                    .iter()
                    .enumerate()
                    .map(|(i, dep)| (dep.id(), i))
                    .collect::<HashMap<_, _>>(),
            );
        }

        let mut a_dep_indices = Vec::new();
        let mut a_nl_dep_indices = Vec::new();
        let mut a_nl_dep_ids = HashMap::new();
        let mut a_x_indices = Vec::new();
        if let Some(a) = &a {
            let a_nl_deps = a.nonlinear_dependencies();
            for dep in &a_nl_deps {
                a_dep_indices.push(push_unique(&mut deps, &mut dep_index, dep));
                a_nl_dep_indices.push(push_unique(&mut nl_deps, &mut nl_dep_index, dep));
            }
            a_nl_dep_ids = a_nl_deps
                .iter()
                .enumerate()
                .map(|(i, dep)| (dep.id(), i))
                .collect();
            if !a_nl_deps.is_empty() {
                // A nonlinear in x: the solution values are needed again to
                // linearize A x.
                for xi in &x {
                    a_x_indices.push(push_unique(&mut nl_deps, &mut nl_dep_index, xi));
                }
            }
        }

        let record = EquationRecord::builder(x, deps)
            .nl_deps(nl_deps)
            .ic(a.as_ref().is_some_and(|a| a.has_initial_condition()))
            .adj_ic(a.as_ref().is_some_and(|a| a.adjoint_has_initial_condition()))
            .adj_types(adj_types)
            .build()?;

        for term in &b {
            term.record().referrer().add_referrer(record.referrer());
        }
        if let Some(a) = &a {
            a.record().referrer().add_referrer(record.referrer());
        }

        Ok(LinearEquation {
            record,
            b,
            b_dep_indices,
            b_nl_dep_indices,
            b_dep_ids,
            a,
            a_dep_indices,
            a_nl_dep_indices,
            a_nl_dep_ids,
            a_x_indices,
        })
    }

    fn select(values: &[Var<F>], indices: &[usize]) -> Vec<Var<F>> {
        indices.iter().map(|&j| values[j].clone()).collect()
    }
}

impl<F: Float> Equation<F> for LinearEquation<F> {
    fn record(&self) -> &EquationRecord<F> {
        &self.record
    }

    fn record_mut(&mut self) -> &mut EquationRecord<F> {
        &mut self.record
    }

    fn forward_solve(&self, x: &[Var<F>], deps: Option<&[Var<F>]>) -> Result<(), SolveError> {
        let deps = deps.unwrap_or_else(|| self.record.dependencies());

        let b_vars: Vec<Var<F>> = match &self.a {
            None => {
                // Identity operator: accumulate directly into the solution.
                for xi in x {
                    xi.zero();
                }
                x.to_vec()
            }
            Some(_) => x
                .iter()
                .enumerate()
                .map(|(m, xi)| {
                    let space = xi
                        .space_type()
                        .relative(self.record.adj_x_type()[m])
                        .conjugate_dual();
                    Var::new_typed(xi.len(), space)
                })
                .collect(),
        };

        for (i, term) in self.b.iter().enumerate() {
            let term_deps = Self::select(deps, &self.b_dep_indices[i]);
            term.add_forward(&b_vars, &term_deps)?;
        }

        if let Some(a) = &self.a {
            let a_deps = Self::select(deps, &self.a_dep_indices);
            a.forward_solve(x, &a_deps, &b_vars)?;
        }
        Ok(())
    }

    fn adjoint_jacobian_solve(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        nl_deps: &[Var<F>],
        b: Vec<Var<F>>,
    ) -> Result<Option<Vec<Var<F>>>, SolveError> {
        match &self.a {
            None => Ok(Some(b)),
            Some(a) => {
                let a_nl_deps = Self::select(nl_deps, &self.a_nl_dep_indices);
                a.adjoint_solve(adj_x, &a_nl_deps, &b)
            }
        }
    }

    fn adjoint_derivative_action(
        &self,
        nl_deps: &[Var<F>],
        dep_index: usize,
        adj_x: &[Var<F>],
    ) -> Result<AdjointAction<F>, SolveError> {
        let eq_deps = self.record.dependencies();
        if dep_index >= eq_deps.len() {
            return Err(SolveError::DependencyIndexOutOfBounds { index: dep_index });
        }
        if dep_index < self.record.x().len() {
            return match &self.a {
                None => Ok(AdjointAction::Var(adj_x[dep_index].clone())),
                Some(a) => {
                    let result = eq_deps[dep_index].new_conjugate_dual();
                    let a_nl_deps = Self::select(nl_deps, &self.a_nl_dep_indices);
                    a.adjoint_action(&a_nl_deps, adj_x, &result, dep_index, Accumulate::Assign)?;
                    Ok(AdjointAction::Var(result))
                }
            };
        }

        let dep = &eq_deps[dep_index];
        let dep_id = dep.id();
        let result = dep.new_conjugate_dual();
        for (i, term) in self.b.iter().enumerate() {
            let Some(&term_dep_index) = self.b_dep_ids[i].get(&dep_id) else {
                continue;
            };
            let term_nl_deps = Self::select(nl_deps, &self.b_nl_dep_indices[i]);
            term.subtract_adjoint_derivative_action(&term_nl_deps, term_dep_index, adj_x, &result)?;
        }
        if let Some(a) = &self.a {
            if let Some(&a_nl_dep_index) = self.a_nl_dep_ids.get(&dep_id) {
                let a_nl_deps = Self::select(nl_deps, &self.a_nl_dep_indices);
                let x_values = Self::select(nl_deps, &self.a_x_indices);
                a.adjoint_derivative_action(
                    &a_nl_deps,
                    a_nl_dep_index,
                    &x_values,
                    adj_x,
                    &result,
                    Accumulate::Add,
                )?;
            }
        }
        Ok(AdjointAction::Var(result))
    }

    fn tangent_linear(
        &self,
        m: &[Var<F>],
        dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Box<dyn Equation<F>>, EquationError> {
        let mut tlm_b: Vec<Rc<dyn Rhs<F>>> = match &self.a {
            None => Vec::new(),
            Some(a) => a.tangent_linear_rhs(m, dm, tlm_map, self.record.x())?,
        };
        for term in &self.b {
            tlm_b.extend(term.tangent_linear_rhs(m, dm, tlm_map)?);
        }

        let tlm_x: Vec<Var<F>> = self.record.x().iter().map(|x| tlm_map.var(x)).collect();
        if tlm_b.is_empty() {
            Ok(Box::new(ZeroAssignment::new(tlm_x)?))
        } else {
            Ok(Box::new(LinearEquation::with_adj_types(
                tlm_x,
                tlm_b,
                self.a.clone(),
                self.record.adj_x_type().to_vec(),
            )?))
        }
    }

    fn drop_references(&mut self) {
        self.record.drop_references();
        for term in &self.b {
            term.drop_references();
        }
        if let Some(a) = &self.a {
            a.drop_references();
        }
    }
}

//! The equation abstraction: residual-based forward, adjoint and
//! tangent-linear contract.
//!
//! An equation defines a forward solution implicitly, as the value `x` for
//! which the residual `F(x, y_0, y_1, ...) = 0`, where the `y_i` are
//! dependencies. Concrete equations implement [`Equation`]: the forward
//! solve, the adjoint Jacobian solve, derivative actions with respect to
//! individual dependencies, and the derivation of a tangent-linear equation.
//! The provided driver methods wrap these with cache invalidation, state
//! bookkeeping and space-type validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::adjoint::{AdjointAction, AdjointRhs};
use crate::float::Float;
use crate::referrer::{Referrer, ReferrerId};
use crate::space::{RelSpaceType, SpaceType};
use crate::tangent::TangentLinearMap;
use crate::var::{Var, VarId};

/// Errors raised while constructing equations, matrices, right-hand-side
/// terms or tangent-linear maps. All are raised before any solve occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EquationError {
    SolutionNotCheckpointed,
    SolutionIsAlias,
    SolutionNotDependency,
    DuplicateDependency,
    AliasDependency,
    DuplicateNonlinearDependency,
    NonlinearDependencyNotDependency,
    DuplicateInitialCondition,
    InitialConditionNotSolution,
    DuplicateAdjointInitialCondition,
    AdjointInitialConditionNotSolution,
    AdjointTypeCountMismatch { expected: usize, found: usize },
    /// A variable is the solution of two different equations.
    DuplicateSolve,
    /// A right-hand-side term depends on a solution variable.
    RhsDependsOnSolution,
    ControlCountMismatch { controls: usize, directions: usize },
    NormSqCountMismatch { expected: usize, found: usize },
    NonSquareMatrix { len: usize },
    MatrixShapeMismatch { expected: usize, found: usize },
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EquationError::SolutionNotCheckpointed => {
                write!(f, "solution must be checkpointed")
            }
            EquationError::SolutionIsAlias => write!(f, "solution cannot be an alias"),
            EquationError::SolutionNotDependency => {
                write!(f, "solution must be a dependency")
            }
            EquationError::DuplicateDependency => write!(f, "duplicate dependency"),
            EquationError::AliasDependency => write!(f, "dependency cannot be an alias"),
            EquationError::DuplicateNonlinearDependency => {
                write!(f, "duplicate non-linear dependency")
            }
            EquationError::NonlinearDependencyNotDependency => {
                write!(f, "non-linear dependency is not a dependency")
            }
            EquationError::DuplicateInitialCondition => {
                write!(f, "duplicate initial condition dependency")
            }
            EquationError::InitialConditionNotSolution => {
                write!(f, "initial condition dependency is not a solution")
            }
            EquationError::DuplicateAdjointInitialCondition => {
                write!(f, "duplicate adjoint initial condition dependency")
            }
            EquationError::AdjointInitialConditionNotSolution => {
                write!(f, "adjoint initial condition dependency is not a solution")
            }
            EquationError::AdjointTypeCountMismatch { expected, found } => write!(
                f,
                "invalid adjoint type count: expected {}, found {}",
                expected, found
            ),
            EquationError::DuplicateSolve => write!(f, "duplicate solve"),
            EquationError::RhsDependsOnSolution => {
                write!(f, "right-hand-side term depends on a solution variable")
            }
            EquationError::ControlCountMismatch {
                controls,
                directions,
            } => write!(
                f,
                "control count mismatch: {} controls, {} direction components",
                controls, directions
            ),
            EquationError::NormSqCountMismatch { expected, found } => write!(
                f,
                "invalid squared norm callable count: expected {}, found {}",
                expected, found
            ),
            EquationError::NonSquareMatrix { len } => {
                write!(f, "coefficient vector of length {} is not square", len)
            }
            EquationError::MatrixShapeMismatch { expected, found } => write!(
                f,
                "matrix shape mismatch: expected {} columns, found {}",
                expected, found
            ),
        }
    }
}

impl std::error::Error for EquationError {}

/// Which solver pass an error was raised from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationPass {
    Forward,
    Adjoint,
}

impl fmt::Display for IterationPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationPass::Forward => write!(f, "forward"),
            IterationPass::Adjoint => write!(f, "adjoint"),
        }
    }
}

/// Errors raised while solving. All abort the computation at the point of
/// failure; no recovery is attempted in this crate.
#[derive(Clone, Debug, PartialEq)]
pub enum SolveError {
    /// NaN encountered in a fixed-point residual norm.
    FixedPointNan {
        pass: IterationPass,
        iteration: usize,
    },
    /// The fixed-point iteration cap was reached without convergence.
    FixedPointMaxIterations {
        pass: IterationPass,
        iterations: usize,
    },
    SingularMatrix,
    /// An adjoint solution came back in the wrong space.
    SpaceTypeMismatch {
        expected: SpaceType,
        found: SpaceType,
    },
    DependencyIndexOutOfBounds { index: usize },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveError::FixedPointNan { pass, iteration } => write!(
                f,
                "fixed point iteration, {} iteration {}, NaN encountered",
                pass, iteration
            ),
            SolveError::FixedPointMaxIterations { pass, iterations } => write!(
                f,
                "fixed point iteration, {} iteration {}, failed to converge",
                pass, iterations
            ),
            SolveError::SingularMatrix => write!(f, "matrix is singular"),
            SolveError::SpaceTypeMismatch { expected, found } => write!(
                f,
                "space type mismatch: expected {}, found {}",
                expected, found
            ),
            SolveError::DependencyIndexOutOfBounds { index } => {
                write!(f, "dependency index {} out of bounds", index)
            }
        }
    }
}

impl std::error::Error for SolveError {}

fn unique_ids<F: Float>(vars: &[Var<F>]) -> Option<HashSet<VarId>> {
    let ids: HashSet<VarId> = vars.iter().map(Var::id).collect();
    (ids.len() == vars.len()).then_some(ids)
}

/// The validated record of one equation: its solution variables, dependency
/// lists and adjoint space declarations.
///
/// Every equation embeds a record; the record answers the structural queries
/// the drivers and containers need, and survives `drop_references` (with the
/// variables swapped for replacement handles).
pub struct EquationRecord<F: Float> {
    referrer: Referrer,
    x: Vec<Var<F>>,
    deps: Vec<Var<F>>,
    nl_deps: Vec<Var<F>>,
    ic_deps: Vec<Var<F>>,
    adj_ic_deps: Vec<Var<F>>,
    adj_x_type: Vec<RelSpaceType>,
}

impl<F: Float> EquationRecord<F> {
    /// Start building a record with solutions `x` and dependencies `deps`
    /// (which must contain every solution).
    pub fn builder(x: Vec<Var<F>>, deps: Vec<Var<F>>) -> EquationRecordBuilder<F> {
        EquationRecordBuilder {
            x,
            deps,
            nl_deps: None,
            ic_deps: None,
            ic: None,
            adj_ic_deps: None,
            adj_ic: None,
            adj_uniform: RelSpaceType::ConjugateDual,
            adj_per_component: None,
        }
    }

    pub fn id(&self) -> ReferrerId {
        self.referrer.id()
    }

    pub fn referrer(&self) -> &Referrer {
        &self.referrer
    }

    /// The forward solution variables.
    pub fn x(&self) -> &[Var<F>] {
        &self.x
    }

    pub fn dependencies(&self) -> &[Var<F>] {
        &self.deps
    }

    /// Dependencies needed to linearize the residual; required again during
    /// adjoint and tangent-linear calculations.
    pub fn nonlinear_dependencies(&self) -> &[Var<F>] {
        &self.nl_deps
    }

    /// Dependencies whose value must be available before the forward solve
    /// (non-zero initial guess support).
    pub fn initial_condition_dependencies(&self) -> &[Var<F>] {
        &self.ic_deps
    }

    pub fn adjoint_initial_condition_dependencies(&self) -> &[Var<F>] {
        &self.adj_ic_deps
    }

    /// Per-component space of the adjoint solution, relative to the forward
    /// solution.
    pub fn adj_x_type(&self) -> &[RelSpaceType] {
        &self.adj_x_type
    }

    /// New zero variables suitable for storing the adjoint solution.
    pub fn new_adj_x(&self) -> Vec<Var<F>> {
        self.x
            .iter()
            .zip(&self.adj_x_type)
            .map(|(x, &rel)| x.new_rel(rel))
            .collect()
    }

    /// Swap every held variable for a replacement handle, releasing the
    /// value storage while keeping structural queries answerable.
    pub fn drop_references(&mut self) {
        for list in [
            &mut self.x,
            &mut self.deps,
            &mut self.nl_deps,
            &mut self.ic_deps,
            &mut self.adj_ic_deps,
        ] {
            for v in list.iter_mut() {
                *v = v.replacement();
            }
        }
    }
}

/// Builder for [`EquationRecord`]. Validation happens in
/// [`EquationRecordBuilder::build`].
pub struct EquationRecordBuilder<F: Float> {
    x: Vec<Var<F>>,
    deps: Vec<Var<F>>,
    nl_deps: Option<Vec<Var<F>>>,
    ic_deps: Option<Vec<Var<F>>>,
    ic: Option<bool>,
    adj_ic_deps: Option<Vec<Var<F>>>,
    adj_ic: Option<bool>,
    adj_uniform: RelSpaceType,
    adj_per_component: Option<Vec<RelSpaceType>>,
}

impl<F: Float> EquationRecordBuilder<F> {
    /// Non-linear dependencies. Defaults to all dependencies.
    pub fn nl_deps(mut self, nl_deps: Vec<Var<F>>) -> Self {
        self.nl_deps = Some(nl_deps);
        self
    }

    /// Explicit initial-condition dependencies. Must be solutions.
    pub fn ic_deps(mut self, ic_deps: Vec<Var<F>>) -> Self {
        self.ic_deps = Some(ic_deps);
        self
    }

    /// Whether all solutions are initial-condition dependencies. Defaults to
    /// `true` when no explicit list is given, `false` otherwise.
    pub fn ic(mut self, ic: bool) -> Self {
        self.ic = Some(ic);
        self
    }

    pub fn adj_ic_deps(mut self, adj_ic_deps: Vec<Var<F>>) -> Self {
        self.adj_ic_deps = Some(adj_ic_deps);
        self
    }

    pub fn adj_ic(mut self, adj_ic: bool) -> Self {
        self.adj_ic = Some(adj_ic);
        self
    }

    /// Uniform adjoint space relative to the solutions. Defaults to the
    /// conjugate dual.
    pub fn adj_type(mut self, adj_type: RelSpaceType) -> Self {
        self.adj_uniform = adj_type;
        self
    }

    /// Per-component adjoint spaces. Length must match the solution count.
    pub fn adj_types(mut self, adj_types: Vec<RelSpaceType>) -> Self {
        self.adj_per_component = Some(adj_types);
        self
    }

    pub fn build(self) -> Result<EquationRecord<F>, EquationError> {
        let EquationRecordBuilder {
            x,
            deps,
            nl_deps,
            ic_deps,
            ic,
            adj_ic_deps,
            adj_ic,
            adj_uniform,
            adj_per_component,
        } = self;

        let dep_ids = unique_ids(&deps).ok_or(EquationError::DuplicateDependency)?;
        for dep in &deps {
            if dep.is_alias() {
                return Err(EquationError::AliasDependency);
            }
        }

        let x_ids: HashSet<VarId> = x.iter().map(Var::id).collect();
        for xi in &x {
            if !xi.is_checkpointed() {
                return Err(EquationError::SolutionNotCheckpointed);
            }
            if xi.is_alias() {
                return Err(EquationError::SolutionIsAlias);
            }
            if !dep_ids.contains(&xi.id()) {
                return Err(EquationError::SolutionNotDependency);
            }
        }

        let nl_deps = nl_deps.unwrap_or_else(|| deps.clone());
        let nl_dep_ids =
            unique_ids(&nl_deps).ok_or(EquationError::DuplicateNonlinearDependency)?;
        if !nl_dep_ids.is_subset(&dep_ids) {
            return Err(EquationError::NonlinearDependencyNotDependency);
        }

        let (ic_deps, ic) = match ic_deps {
            None => (Vec::new(), ic.unwrap_or(true)),
            Some(list) => (list, ic.unwrap_or(false)),
        };
        let ic_dep_ids = unique_ids(&ic_deps).ok_or(EquationError::DuplicateInitialCondition)?;
        if !ic_dep_ids.is_subset(&x_ids) {
            return Err(EquationError::InitialConditionNotSolution);
        }
        let ic_deps = if ic { x.clone() } else { ic_deps };

        let (adj_ic_deps, adj_ic) = match adj_ic_deps {
            None => (Vec::new(), adj_ic.unwrap_or(true)),
            Some(list) => (list, adj_ic.unwrap_or(false)),
        };
        let adj_ic_dep_ids =
            unique_ids(&adj_ic_deps).ok_or(EquationError::DuplicateAdjointInitialCondition)?;
        if !adj_ic_dep_ids.is_subset(&x_ids) {
            return Err(EquationError::AdjointInitialConditionNotSolution);
        }
        let adj_ic_deps = if adj_ic { x.clone() } else { adj_ic_deps };

        let adj_x_type = match adj_per_component {
            None => vec![adj_uniform; x.len()],
            Some(types) => {
                if types.len() != x.len() {
                    return Err(EquationError::AdjointTypeCountMismatch {
                        expected: x.len(),
                        found: types.len(),
                    });
                }
                types
            }
        };

        Ok(EquationRecord {
            referrer: Referrer::new(),
            x,
            deps,
            nl_deps,
            ic_deps,
            adj_ic_deps,
            adj_x_type,
        })
    }
}

/// Observer of the two tape extension points of [`Equation::solve_observed`]:
/// initial-condition registration before the forward solve, and the record of
/// the solved equation after it.
pub trait SolveObserver<F: Float> {
    fn initial_condition(&mut self, _dep: &Var<F>) {}
    fn equation_solved(&mut self, _record: &EquationRecord<F>) {}
}

/// An equation on the tape.
///
/// Implementors supply the residual-specific operations
/// ([`Equation::forward_solve`], [`Equation::adjoint_jacobian_solve`],
/// [`Equation::tangent_linear`], and usually
/// [`Equation::adjoint_derivative_action`]); the provided driver methods
/// ([`Equation::forward`], [`Equation::adjoint`], [`Equation::solve`]) add
/// cache invalidation, state bookkeeping and validation around them.
pub trait Equation<F: Float> {
    fn record(&self) -> &EquationRecord<F>;

    fn record_mut(&mut self) -> &mut EquationRecord<F>;

    /// Compute the forward solution, writing it into `x` (which may hold an
    /// initial guess). When `deps` is supplied it replaces the attached
    /// dependencies as the source of dependency values; this indirection is
    /// what allows an equation to be re-used after value substitution, e.g.
    /// inside a fixed-point iteration or a tangent-linear replay.
    fn forward_solve(&self, x: &[Var<F>], deps: Option<&[Var<F>]>) -> Result<(), SolveError>;

    /// Solve the adjoint Jacobian system for the adjoint solution.
    ///
    /// `adj_x` optionally holds an initial guess and may be modified or
    /// returned; `b` is the right-hand side and may be modified or returned.
    /// Returning `Ok(None)` signals a structurally zero adjoint solution.
    fn adjoint_jacobian_solve(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        nl_deps: &[Var<F>],
        b: Vec<Var<F>>,
    ) -> Result<Option<Vec<Var<F>>>, SolveError>;

    /// Derive the equation for the directional derivative with respect to
    /// controls `m` along direction `dm`.
    ///
    /// A structurally zero derivative must be expressed as a
    /// [`ZeroAssignment`] over the tangent variables, never omitted.
    fn tangent_linear(
        &self,
        m: &[Var<F>],
        dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Box<dyn Equation<F>>, EquationError>;

    /// The action of the adjoint of the residual derivative with respect to
    /// dependency `dep_index` on the adjoint solution. This is the
    /// *negative* of an adjoint right-hand-side term.
    fn adjoint_derivative_action(
        &self,
        _nl_deps: &[Var<F>],
        _dep_index: usize,
        _adj_x: &[Var<F>],
    ) -> Result<AdjointAction<F>, SolveError> {
        panic!("adjoint_derivative_action is not implemented for this equation");
    }

    /// Subtract derivative actions into the requested per-dependency
    /// accumulators.
    ///
    /// The default loops over [`Equation::adjoint_derivative_action`];
    /// override for batched or cached computation.
    fn subtract_adjoint_derivative_actions(
        &self,
        adj_x: &[Var<F>],
        nl_deps: &[Var<F>],
        dep_bs: &BTreeMap<usize, AdjointRhs<F>>,
    ) -> Result<(), SolveError> {
        for (&dep_index, dep_b) in dep_bs {
            dep_b.sub(self.adjoint_derivative_action(nl_deps, dep_index, adj_x)?);
        }
        Ok(())
    }

    /// Forward solve driver: refresh caches against the (possibly
    /// substituted) dependency values, solve, then bump solution states and
    /// refresh caches against the new solution values.
    fn forward(&self, x: &[Var<F>], deps: Option<&[Var<F>]>) -> Result<(), SolveError> {
        let record = self.record();
        match deps {
            Some(values) => {
                debug_assert_eq!(values.len(), record.dependencies().len());
                for (dep, value) in record.dependencies().iter().zip(values) {
                    dep.update_caches_from(value);
                }
            }
            None => {
                for dep in record.dependencies() {
                    dep.update_caches();
                }
            }
        }
        self.forward_solve(x, deps)?;
        for xi in x {
            xi.update_state();
        }
        for (attached, solved) in record.x().iter().zip(x) {
            attached.update_caches_from(solved);
        }
        Ok(())
    }

    /// Adjoint driver: solve the adjoint Jacobian system for the given
    /// right-hand side `b`, validate the space of the result, and propagate
    /// derivative actions into `dep_bs`.
    ///
    /// Returns `Ok(None)` when the adjoint solution is structurally zero, in
    /// which case nothing is propagated and upstream accumulation stops.
    fn adjoint(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        nl_deps: &[Var<F>],
        b: Vec<Var<F>>,
        dep_bs: &BTreeMap<usize, AdjointRhs<F>>,
    ) -> Result<Option<Vec<Var<F>>>, SolveError> {
        let record = self.record();
        for (dep, value) in record.nonlinear_dependencies().iter().zip(nl_deps) {
            dep.update_caches_from(value);
        }
        let adj_x = match self.adjoint_jacobian_solve(adj_x, nl_deps, b)? {
            None => return Ok(None),
            Some(adj_x) => adj_x,
        };
        for (m, adj) in adj_x.iter().enumerate() {
            let expected = record.x()[m].space_type().relative(record.adj_x_type()[m]);
            if adj.space_type() != expected {
                return Err(SolveError::SpaceTypeMismatch {
                    expected,
                    found: adj.space_type(),
                });
            }
        }
        self.subtract_adjoint_derivative_actions(&adj_x, nl_deps, dep_bs)?;
        Ok(Some(adj_x))
    }

    /// Propagate derivative actions for an already-known adjoint solution.
    fn adjoint_cached(
        &self,
        adj_x: &[Var<F>],
        nl_deps: &[Var<F>],
        dep_bs: &BTreeMap<usize, AdjointRhs<F>>,
    ) -> Result<(), SolveError> {
        for (dep, value) in self
            .record()
            .nonlinear_dependencies()
            .iter()
            .zip(nl_deps)
        {
            dep.update_caches_from(value);
        }
        self.subtract_adjoint_derivative_actions(adj_x, nl_deps, dep_bs)
    }

    /// Compute the forward solution in place.
    fn solve(&self) -> Result<(), SolveError> {
        let x = self.record().x().to_vec();
        self.forward(&x, None)
    }

    /// Compute the forward solution, reporting initial-condition
    /// dependencies and the solved record to `observer`.
    fn solve_observed(&self, observer: &mut dyn SolveObserver<F>) -> Result<(), SolveError> {
        for dep in self.record().initial_condition_dependencies() {
            observer.initial_condition(dep);
        }
        let x = self.record().x().to_vec();
        self.forward(&x, None)?;
        observer.equation_solved(self.record());
        Ok(())
    }

    /// Release value storage held through this equation, keeping structural
    /// queries answerable.
    fn drop_references(&mut self) {
        self.record_mut().drop_references();
    }
}

/// The assignment `x = 0`, with residual `F(x) = x`.
pub struct ZeroAssignment<F: Float> {
    record: EquationRecord<F>,
}

impl<F: Float> ZeroAssignment<F> {
    pub fn new(x: Vec<Var<F>>) -> Result<Self, EquationError> {
        let record = EquationRecord::builder(x.clone(), x)
            .nl_deps(Vec::new())
            .ic(false)
            .adj_ic(false)
            .build()?;
        Ok(ZeroAssignment { record })
    }
}

impl<F: Float> Equation<F> for ZeroAssignment<F> {
    fn record(&self) -> &EquationRecord<F> {
        &self.record
    }

    fn record_mut(&mut self) -> &mut EquationRecord<F> {
        &mut self.record
    }

    fn forward_solve(&self, x: &[Var<F>], _deps: Option<&[Var<F>]>) -> Result<(), SolveError> {
        for xi in x {
            xi.zero();
        }
        Ok(())
    }

    fn adjoint_jacobian_solve(
        &self,
        _adj_x: Option<Vec<Var<F>>>,
        _nl_deps: &[Var<F>],
        b: Vec<Var<F>>,
    ) -> Result<Option<Vec<Var<F>>>, SolveError> {
        Ok(Some(b))
    }

    fn adjoint_derivative_action(
        &self,
        _nl_deps: &[Var<F>],
        dep_index: usize,
        adj_x: &[Var<F>],
    ) -> Result<AdjointAction<F>, SolveError> {
        if dep_index < adj_x.len() {
            Ok(AdjointAction::Var(adj_x[dep_index].clone()))
        } else {
            Err(SolveError::DependencyIndexOutOfBounds { index: dep_index })
        }
    }

    fn tangent_linear(
        &self,
        _m: &[Var<F>],
        _dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Box<dyn Equation<F>>, EquationError> {
        let tlm_x = self.record.x().iter().map(|x| tlm_map.var(x)).collect();
        Ok(Box::new(ZeroAssignment::new(tlm_x)?))
    }
}

// Referenced by LinearEquation and FixedPointSolver construction; kept here
// so all dependency-list assembly shares one implementation.
pub(crate) fn push_unique<F: Float>(
    list: &mut Vec<Var<F>>,
    index: &mut HashMap<VarId, usize>,
    var: &Var<F>,
) -> usize {
    let id = var.id();
    if let Some(&i) = index.get(&id) {
        i
    } else {
        list.push(var.clone());
        index.insert(id, list.len() - 1);
        list.len() - 1
    }
}

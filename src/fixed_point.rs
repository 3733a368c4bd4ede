//! Fixed-point solution of cyclic groups of equations.
//!
//! A [`FixedPointSolver`] composes sub-equations with overlapping
//! dependencies — later equations may feed earlier ones, forming a directed
//! cycle — and iterates their forward solves to convergence. Tangent-linear
//! and adjoint information is derived using the approach described in:
//!
//!   - Jean Charles Gilbert, "Automatic differentiation and iterative
//!     processes", Optimization Methods and Software, 1(1), pp. 13--21, 1992,
//!     doi: 10.1080/10556789208805503
//!   - Bruce Christianson, "Reverse accumulation and attractive fixed
//!     points", Optimization Methods and Software, 3(4), pp. 311--326, 1994,
//!     doi: 10.1080/10556789408805572
//!
//! The adjoint of a converged fixed point is itself the fixed point of the
//! adjoint map, solved here by a symmetric iteration in reverse sub-equation
//! order. The tangent-linear model is simply a new fixed point over the
//! linearized sub-equations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::adjoint::{AdjointModelRhs, AdjointRhs};
use crate::equation::{
    push_unique, Equation, EquationError, EquationRecord, IterationPass, SolveError,
};
use crate::float::Float;
use crate::tangent::TangentLinearMap;
use crate::var::{Var, VarId};

/// The squared norm of one solution component, used in convergence tests.
pub type NormSq<F> = Rc<dyn Fn(&Var<F>) -> F>;

/// The square of the l2 norm of the value vector. The default convergence
/// norm.
pub fn l2_norm_sq<F: Float>(x: &Var<F>) -> F {
    x.inner(x)
}

/// Parameters controlling a fixed-point solve.
#[derive(Clone, Debug)]
pub struct FixedPointParameters<F> {
    /// Absolute tolerance on the change in the solution in one iteration.
    pub absolute_tolerance: F,
    /// Relative tolerance on the change in the solution in one iteration.
    pub relative_tolerance: F,
    /// Maximum permitted iterations (default: 1000).
    pub maximum_iterations: usize,
    /// Whether forward solves start from the current values rather than zero
    /// (default: true).
    pub nonzero_initial_guess: bool,
    /// As `nonzero_initial_guess`, for adjoint solves (default: true).
    pub adjoint_nonzero_initial_guess: bool,
    /// One adjoint iteration solves all sub-equations in reverse order; this
    /// offset selects which is solved first (default: 0).
    pub adjoint_eqs_index_0: usize,
}

impl<F: Float> FixedPointParameters<F> {
    pub fn new(absolute_tolerance: F, relative_tolerance: F) -> Self {
        FixedPointParameters {
            absolute_tolerance,
            relative_tolerance,
            maximum_iterations: 1000,
            nonzero_initial_guess: true,
            adjoint_nonzero_initial_guess: true,
            adjoint_eqs_index_0: 0,
        }
    }
}

/// An equation solving a cyclic group of sub-equations to convergence.
///
/// The solution is the concatenation of all sub-equation solutions.
/// Cross-equation structure is addressed by index: at construction, every
/// sub-equation dependency that is another sub-equation's solution is mapped
/// to its `(equation, component)` pair, and the adjoint iteration uses these
/// pairs to route derivative contributions between sub-equations.
pub struct FixedPointSolver<F: Float> {
    record: EquationRecord<F>,
    eqs: Vec<Box<dyn Equation<F>>>,
    eq_x_indices: Vec<Vec<usize>>,
    eq_dep_indices: Vec<Vec<usize>>,
    eq_nl_dep_indices: Vec<Vec<usize>>,
    eq_dep_index_map: Vec<HashMap<VarId, usize>>,
    dep_eq_index_map: HashMap<VarId, Vec<usize>>,
    dep_b_indices: Vec<BTreeMap<usize, (usize, usize)>>,
    parameters: FixedPointParameters<F>,
    norm_sqs: Vec<Vec<NormSq<F>>>,
    adj_norm_sqs: Vec<Vec<NormSq<F>>>,
}

impl<F: Float> FixedPointSolver<F> {
    /// With the default l2 convergence norms.
    pub fn new(
        eqs: Vec<Box<dyn Equation<F>>>,
        parameters: FixedPointParameters<F>,
    ) -> Result<Self, EquationError> {
        let norm_sqs: Vec<Vec<NormSq<F>>> = eqs
            .iter()
            .map(|eq| {
                let f: NormSq<F> = Rc::new(l2_norm_sq);
                vec![f; eq.record().x().len()]
            })
            .collect();
        let adj_norm_sqs = norm_sqs.clone();
        Self::with_norm_sqs(eqs, parameters, norm_sqs, adj_norm_sqs)
    }

    /// With custom per-component squared norms for the forward and adjoint
    /// convergence tests. The total squared norm is the sum over components.
    pub fn with_norm_sqs(
        eqs: Vec<Box<dyn Equation<F>>>,
        parameters: FixedPointParameters<F>,
        norm_sqs: Vec<Vec<NormSq<F>>>,
        adj_norm_sqs: Vec<Vec<NormSq<F>>>,
    ) -> Result<Self, EquationError> {
        for sqs in [&norm_sqs, &adj_norm_sqs] {
            if sqs.len() != eqs.len() {
                return Err(EquationError::NormSqCountMismatch {
                    expected: eqs.len(),
                    found: sqs.len(),
                });
            }
            for (eq, eq_sqs) in eqs.iter().zip(sqs.iter()) {
                if eq_sqs.len() != eq.record().x().len() {
                    return Err(EquationError::NormSqCountMismatch {
                        expected: eq.record().x().len(),
                        found: eq_sqs.len(),
                    });
                }
            }
        }

        let n = eqs.len();

        let mut x_ids = HashSet::new();
        for eq in &eqs {
            for x in eq.record().x() {
                if !x_ids.insert(x.id()) {
                    return Err(EquationError::DuplicateSolve);
                }
            }
        }

        let mut x: Vec<Var<F>> = Vec::new();
        let mut deps: Vec<Var<F>> = Vec::new();
        let mut dep_index: HashMap<VarId, usize> = HashMap::new();
        let mut nl_deps: Vec<Var<F>> = Vec::new();
        let mut nl_dep_index: HashMap<VarId, usize> = HashMap::new();
        let mut adj_x_type = Vec::new();

        let mut eq_x_indices: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut eq_dep_indices: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut eq_nl_dep_indices: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, eq) in eqs.iter().enumerate() {
            let record = eq.record();
            for (xi, &adj_type) in record.x().iter().zip(record.adj_x_type()) {
                x.push(xi.clone());
                eq_x_indices[i].push(x.len() - 1);
                adj_x_type.push(adj_type);
            }
            for dep in record.dependencies() {
                eq_dep_indices[i].push(push_unique(&mut deps, &mut dep_index, dep));
            }
            for dep in record.nonlinear_dependencies() {
                eq_nl_dep_indices[i].push(push_unique(&mut nl_deps, &mut nl_dep_index, dep));
            }
        }

        // Initial-condition dependencies: values needed before the first
        // pass. A dependency of equation i that is the solution of a
        // not-yet-solved equation needs a value, as do the sub-equations' own
        // declared initial conditions.
        let ic_deps = if parameters.nonzero_initial_guess {
            let mut collected: Vec<Var<F>> = Vec::new();
            let mut collected_ids = HashSet::new();
            let mut remaining: HashSet<VarId> = x_ids.clone();
            for eq in &eqs {
                let record = eq.record();
                for xi in record.x() {
                    remaining.remove(&xi.id());
                }
                for dep in record.dependencies() {
                    if remaining.contains(&dep.id()) && collected_ids.insert(dep.id()) {
                        collected.push(dep.clone());
                    }
                }
                for dep in record.initial_condition_dependencies() {
                    if collected_ids.insert(dep.id()) {
                        collected.push(dep.clone());
                    }
                }
            }
            collected
        } else {
            Vec::new()
        };

        let i0 = parameters.adjoint_eqs_index_0 % n.max(1);
        let adj_ic_deps = if parameters.adjoint_nonzero_initial_guess {
            let mut collected: Vec<Var<F>> = Vec::new();
            let mut collected_ids = HashSet::new();
            let mut remaining: HashSet<VarId> = x_ids.clone();
            for raw in (0..n).rev() {
                let i = (raw + n - i0) % n;
                let record = eqs[i].record();
                for xi in record.x() {
                    remaining.remove(&xi.id());
                }
                for dep in record.dependencies() {
                    if remaining.contains(&dep.id()) && collected_ids.insert(dep.id()) {
                        collected.push(dep.clone());
                    }
                }
                for dep in record.adjoint_initial_condition_dependencies() {
                    if collected_ids.insert(dep.id()) {
                        collected.push(dep.clone());
                    }
                }
            }
            collected
        } else {
            Vec::new()
        };

        let eq_dep_index_map: Vec<HashMap<VarId, usize>> = eqs
            .iter()
            .map(|eq| {
                eq.record()
                    .dependencies()
                    .iter()
                    .enumerate()
                    .map(|(j, dep)| (dep.id(), j))
                    .collect()
            })
            .collect();

        let mut dep_eq_index_map: HashMap<VarId, Vec<usize>> = HashMap::new();
        for (i, eq) in eqs.iter().enumerate() {
            for dep in eq.record().dependencies() {
                dep_eq_index_map.entry(dep.id()).or_default().push(i);
            }
        }

        // dep_map: solution id -> (owning equation, component)
        let mut dep_map: HashMap<VarId, (usize, usize)> = HashMap::new();
        for (k, eq) in eqs.iter().enumerate() {
            for (m, xi) in eq.record().x().iter().enumerate() {
                dep_map.insert(xi.id(), (k, m));
            }
        }
        let mut dep_b_indices: Vec<BTreeMap<usize, (usize, usize)>> = vec![BTreeMap::new(); n];
        for (i, eq) in eqs.iter().enumerate() {
            for (j, dep) in eq.record().dependencies().iter().enumerate() {
                if let Some(&(k, m)) = dep_map.get(&dep.id()) {
                    if k != i {
                        dep_b_indices[i].insert(j, (k, m));
                    }
                }
            }
        }

        let record = EquationRecord::builder(x, deps)
            .nl_deps(nl_deps)
            .ic_deps(ic_deps)
            .adj_ic_deps(adj_ic_deps)
            .adj_types(adj_x_type)
            .build()?;

        for eq in &eqs {
            eq.record().referrer().add_referrer(record.referrer());
        }

        Ok(FixedPointSolver {
            record,
            eqs,
            eq_x_indices,
            eq_dep_indices,
            eq_nl_dep_indices,
            eq_dep_index_map,
            dep_eq_index_map,
            dep_b_indices,
            parameters,
            norm_sqs,
            adj_norm_sqs,
        })
    }

    pub fn parameters(&self) -> &FixedPointParameters<F> {
        &self.parameters
    }

    fn select(values: &[Var<F>], indices: &[usize]) -> Vec<Var<F>> {
        indices.iter().map(|&j| values[j].clone()).collect()
    }

    fn norm_sq(groups: &[Vec<Var<F>>], norm_sqs: &[Vec<NormSq<F>>]) -> F {
        let mut total = F::zero();
        for (vars, sqs) in groups.iter().zip(norm_sqs) {
            for (v, sq) in vars.iter().zip(sqs) {
                total = total + sq(v);
            }
        }
        total
    }

    fn tolerance_sq(&self, solution_norm_sq: impl FnOnce() -> F) -> F {
        let abs_sq = self.parameters.absolute_tolerance * self.parameters.absolute_tolerance;
        if self.parameters.relative_tolerance == F::zero() {
            abs_sq
        } else {
            let rel_sq = solution_norm_sq()
                * self.parameters.relative_tolerance
                * self.parameters.relative_tolerance;
            abs_sq.max(rel_sq)
        }
    }
}

impl<F: Float> Equation<F> for FixedPointSolver<F> {
    fn record(&self) -> &EquationRecord<F> {
        &self.record
    }

    fn record_mut(&mut self) -> &mut EquationRecord<F> {
        &mut self.record
    }

    fn forward_solve(&self, x: &[Var<F>], deps: Option<&[Var<F>]>) -> Result<(), SolveError> {
        let n = self.eqs.len();
        let eq_x: Vec<Vec<Var<F>>> = (0..n)
            .map(|i| Self::select(x, &self.eq_x_indices[i]))
            .collect();
        let eq_deps: Vec<Option<Vec<Var<F>>>> = match deps {
            None => vec![None; n],
            Some(deps) => (0..n)
                .map(|i| Some(Self::select(deps, &self.eq_dep_indices[i])))
                .collect(),
        };

        if !self.parameters.nonzero_initial_guess {
            for xi in x {
                xi.zero();
            }
            for (attached, solved) in self.record.x().iter().zip(x) {
                attached.update_caches_from(solved);
            }
        }

        let mut it = 0usize;
        let mut previous: Vec<Vec<Var<F>>> = eq_x
            .iter()
            .map(|vars| vars.iter().map(Var::copy).collect())
            .collect();
        loop {
            it += 1;

            for (i, eq) in self.eqs.iter().enumerate() {
                eq.forward(&eq_x[i], eq_deps[i].as_deref())?;
            }

            // Residual: previous iterate minus new iterate, reusing the
            // snapshot storage.
            let residual = previous;
            for (r_vars, x_vars) in residual.iter().zip(&eq_x) {
                for (r, xv) in r_vars.iter().zip(x_vars) {
                    r.axpy(-F::one(), xv);
                }
            }
            let r_norm_sq = Self::norm_sq(&residual, &self.norm_sqs);
            let tolerance_sq = self.tolerance_sq(|| Self::norm_sq(&eq_x, &self.norm_sqs));
            if r_norm_sq.is_nan() {
                return Err(SolveError::FixedPointNan {
                    pass: IterationPass::Forward,
                    iteration: it,
                });
            }
            if r_norm_sq < tolerance_sq || r_norm_sq == F::zero() {
                break;
            }
            if it >= self.parameters.maximum_iterations {
                return Err(SolveError::FixedPointMaxIterations {
                    pass: IterationPass::Forward,
                    iterations: it,
                });
            }

            previous = residual;
            for (p_vars, x_vars) in previous.iter().zip(&eq_x) {
                for (p, xv) in p_vars.iter().zip(x_vars) {
                    p.assign(xv);
                }
            }
        }
        Ok(())
    }

    fn adjoint_jacobian_solve(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        nl_deps: &[Var<F>],
        b: Vec<Var<F>>,
    ) -> Result<Option<Vec<Var<F>>>, SolveError> {
        let n = self.eqs.len();
        let i0 = self.parameters.adjoint_eqs_index_0 % n.max(1);

        let mut adj_x: Vec<Var<F>> = match adj_x {
            Some(adj_x) => adj_x,
            None => self.record.new_adj_x(),
        };
        let mut eq_adj_x: Vec<Vec<Var<F>>> = (0..n)
            .map(|i| Self::select(&adj_x, &self.eq_x_indices[i]))
            .collect();
        let eq_nl_deps: Vec<Vec<Var<F>>> = (0..n)
            .map(|i| Self::select(nl_deps, &self.eq_nl_dep_indices[i]))
            .collect();

        let eq_x_lists: Vec<&[Var<F>]> = self.eqs.iter().map(|eq| eq.record().x()).collect();
        let adj_b = AdjointModelRhs::new(&eq_x_lists);

        let mut eq_dep_bs: Vec<BTreeMap<usize, AdjointRhs<F>>> = vec![BTreeMap::new(); n];
        for i in 0..n {
            for (j, &k) in self.eq_x_indices[i].iter().enumerate() {
                adj_b.eq(i).comp(j).assign(&b[k]);
            }
            for (&j, &(k, m)) in &self.dep_b_indices[i] {
                eq_dep_bs[i].insert(j, adj_b.eq(k).comp(m));
            }
        }

        if self.parameters.adjoint_nonzero_initial_guess {
            for (i, eq) in self.eqs.iter().enumerate() {
                eq.subtract_adjoint_derivative_actions(
                    &eq_adj_x[i],
                    &eq_nl_deps[i],
                    &eq_dep_bs[i],
                )?;
            }
        } else {
            for adj in &adj_x {
                adj.zero();
            }
        }

        let mut it = 0usize;
        let mut previous: Vec<Vec<Var<F>>> = eq_adj_x
            .iter()
            .map(|vars| vars.iter().map(Var::copy).collect())
            .collect();
        loop {
            it += 1;

            for raw in (0..n).rev() {
                let i = (raw + n - i0) % n;

                // The sub-solve may return the right-hand side itself, so it
                // gets a copy.
                let eq_b = adj_b.eq(i).b_copies();
                let solved = self.eqs[i].adjoint_jacobian_solve(
                    Some(eq_adj_x[i].clone()),
                    &eq_nl_deps[i],
                    eq_b,
                )?;
                eq_adj_x[i] = match solved {
                    None => self.eqs[i].record().new_adj_x(),
                    Some(solved) => {
                        self.eqs[i].subtract_adjoint_derivative_actions(
                            &solved,
                            &eq_nl_deps[i],
                            &eq_dep_bs[i],
                        )?;
                        solved
                    }
                };

                for (adj, &k) in eq_adj_x[i].iter().zip(&self.eq_x_indices[i]) {
                    adj_x[k] = adj.clone();
                }

                // Reset this equation's right-hand side to the outer seeds
                // for the next pass.
                for (j, &k) in self.eq_x_indices[i].iter().enumerate() {
                    adj_b.eq(i).comp(j).assign(&b[k]);
                }
            }

            let residual = previous;
            for (r_vars, adj_vars) in residual.iter().zip(&eq_adj_x) {
                for (r, adj) in r_vars.iter().zip(adj_vars) {
                    r.axpy(-F::one(), adj);
                }
            }
            let r_norm_sq = Self::norm_sq(&residual, &self.adj_norm_sqs);
            let tolerance_sq =
                self.tolerance_sq(|| Self::norm_sq(&eq_adj_x, &self.adj_norm_sqs));
            if r_norm_sq.is_nan() {
                return Err(SolveError::FixedPointNan {
                    pass: IterationPass::Adjoint,
                    iteration: it,
                });
            }
            if r_norm_sq < tolerance_sq || r_norm_sq == F::zero() {
                break;
            }
            if it >= self.parameters.maximum_iterations {
                return Err(SolveError::FixedPointMaxIterations {
                    pass: IterationPass::Adjoint,
                    iterations: it,
                });
            }

            previous = residual;
            for (p_vars, adj_vars) in previous.iter().zip(&eq_adj_x) {
                for (p, adj) in p_vars.iter().zip(adj_vars) {
                    p.assign(adj);
                }
            }
        }

        Ok(Some(adj_x))
    }

    fn subtract_adjoint_derivative_actions(
        &self,
        adj_x: &[Var<F>],
        nl_deps: &[Var<F>],
        dep_bs: &BTreeMap<usize, AdjointRhs<F>>,
    ) -> Result<(), SolveError> {
        let n = self.eqs.len();
        let mut eq_dep_bs: Vec<BTreeMap<usize, AdjointRhs<F>>> = vec![BTreeMap::new(); n];
        for (&dep_index, dep_b) in dep_bs {
            let dep = &self.record.dependencies()[dep_index];
            if let Some(eq_indices) = self.dep_eq_index_map.get(&dep.id()) {
                for &i in eq_indices {
                    let j = self.eq_dep_index_map[i][&dep.id()];
                    eq_dep_bs[i].insert(j, dep_b.clone());
                }
            }
        }

        for (i, eq) in self.eqs.iter().enumerate() {
            let eq_adj_x = Self::select(adj_x, &self.eq_x_indices[i]);
            let eq_nl_deps = Self::select(nl_deps, &self.eq_nl_dep_indices[i]);
            eq.subtract_adjoint_derivative_actions(&eq_adj_x, &eq_nl_deps, &eq_dep_bs[i])?;
        }
        Ok(())
    }

    fn tangent_linear(
        &self,
        m: &[Var<F>],
        dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Box<dyn Equation<F>>, EquationError> {
        let tlm_eqs: Vec<Box<dyn Equation<F>>> = self
            .eqs
            .iter()
            .map(|eq| eq.tangent_linear(m, dm, tlm_map))
            .collect::<Result<_, _>>()?;
        Ok(Box::new(FixedPointSolver::with_norm_sqs(
            tlm_eqs,
            self.parameters.clone(),
            self.norm_sqs.clone(),
            self.adj_norm_sqs.clone(),
        )?))
    }

    fn drop_references(&mut self) {
        self.record.drop_references();
        for eq in &mut self.eqs {
            eq.drop_references();
        }
    }
}

use std::collections::BTreeMap;
use std::rc::Rc;

use approx::assert_relative_eq;
use quoll::{
    AdjointRhs, Equation, EquationError, EquationRecord, FixedPointParameters, FixedPointSolver,
    IterationPass, LinearEquation, MatrixActionRhs, Rhs, SolveError, SolveObserver, SpaceType,
    TangentLinearMap, Var, VarId,
};

/// The cyclic system
///
///   x = 0.5 y + c
///   y = x
///
/// with fixed point x = y = 2 c.
fn make_system(
    c_value: f64,
    parameters: FixedPointParameters<f64>,
) -> (Var<f64>, Var<f64>, Var<f64>, FixedPointSolver<f64>) {
    let x = Var::<f64>::new(1);
    let y = Var::<f64>::new(1);
    let c = Var::static_from_values(vec![c_value]);

    let eq1_terms: Vec<Rc<dyn Rhs<f64>>> = vec![
        Rc::new(MatrixActionRhs::scaled_identity(0.5, &y).unwrap()),
        Rc::new(MatrixActionRhs::identity(&c).unwrap()),
    ];
    let eq1 = LinearEquation::new(vec![x.clone()], eq1_terms, None).unwrap();

    let eq2_terms: Vec<Rc<dyn Rhs<f64>>> = vec![Rc::new(MatrixActionRhs::identity(&x).unwrap())];
    let eq2 = LinearEquation::new(vec![y.clone()], eq2_terms, None).unwrap();

    let solver =
        FixedPointSolver::new(vec![Box::new(eq1), Box::new(eq2)], parameters).unwrap();
    (x, y, c, solver)
}

fn dep_index_of(record: &EquationRecord<f64>, id: VarId) -> usize {
    record
        .dependencies()
        .iter()
        .position(|dep| dep.id() == id)
        .expect("dependency present")
}

// ============================================================
// Test 1: forward convergence to the known fixed point
// ============================================================

#[test]
fn forward_converges() {
    let (x, y, _c, solver) = make_system(1.0, FixedPointParameters::new(1e-12, 0.0));
    solver.solve().unwrap();
    assert_relative_eq!(x.value(0), 2.0, max_relative = 1e-10);
    assert_relative_eq!(y.value(0), 2.0, max_relative = 1e-10);
}

#[test]
fn forward_converges_with_relative_tolerance() {
    let (x, _y, _c, solver) = make_system(1.0, FixedPointParameters::new(0.0, 1e-12));
    solver.solve().unwrap();
    assert_relative_eq!(x.value(0), 2.0, max_relative = 1e-10);
}

#[test]
fn zeroed_initial_guess() {
    let mut parameters = FixedPointParameters::new(1e-12, 0.0);
    parameters.nonzero_initial_guess = false;
    let (x, y, _c, solver) = make_system(1.0, parameters);
    x.assign_values(&[1.0e6]);
    y.assign_values(&[-1.0e6]);
    solver.solve().unwrap();
    assert_relative_eq!(x.value(0), 2.0, max_relative = 1e-10);
}

#[test]
fn starting_at_the_fixed_point_terminates_immediately() {
    let (x, y, _c, solver) = make_system(1.0, FixedPointParameters::new(1e-12, 0.0));
    x.assign_values(&[2.0]);
    y.assign_values(&[2.0]);
    solver.solve().unwrap();
    assert_eq!(x.value(0), 2.0);
    assert_eq!(y.value(0), 2.0);
}

// ============================================================
// Test 2: failure modes
// ============================================================

#[test]
fn iteration_cap_is_fatal() {
    let mut parameters = FixedPointParameters::new(1e-12, 0.0);
    parameters.maximum_iterations = 3;
    let (_x, _y, _c, solver) = make_system(1.0, parameters);
    assert!(matches!(
        solver.solve(),
        Err(SolveError::FixedPointMaxIterations {
            pass: IterationPass::Forward,
            iterations: 3
        })
    ));
}

#[test]
fn zero_iteration_cap_fails_on_first_pass() {
    let mut parameters = FixedPointParameters::new(1e-12, 0.0);
    parameters.maximum_iterations = 0;
    let (_x, _y, _c, solver) = make_system(1.0, parameters);
    assert!(matches!(
        solver.solve(),
        Err(SolveError::FixedPointMaxIterations { .. })
    ));
}

#[test]
fn nan_is_fatal_immediately() {
    let (_x, _y, _c, solver) = make_system(f64::NAN, FixedPointParameters::new(1e-12, 0.0));
    assert!(matches!(
        solver.solve(),
        Err(SolveError::FixedPointNan {
            pass: IterationPass::Forward,
            iteration: 1
        })
    ));
}

#[test]
fn duplicate_solve_rejected() {
    let x = Var::<f64>::new(1);
    let y = Var::from_values(vec![1.0]);
    let eq1 = LinearEquation::new(
        vec![x.clone()],
        vec![Rc::new(MatrixActionRhs::identity(&y).unwrap()) as Rc<dyn Rhs<f64>>],
        None,
    )
    .unwrap();
    let eq2 = LinearEquation::new(
        vec![x.clone()],
        vec![Rc::new(MatrixActionRhs::scaled_identity(2.0, &y).unwrap()) as Rc<dyn Rhs<f64>>],
        None,
    )
    .unwrap();
    let result = FixedPointSolver::new(
        vec![Box::new(eq1), Box::new(eq2)],
        FixedPointParameters::new(1e-12, 0.0),
    );
    assert!(matches!(result, Err(EquationError::DuplicateSolve)));
}

// ============================================================
// Test 3: initial-condition dependencies of the cycle
// ============================================================

struct InitialConditionRecorder {
    initial_conditions: Vec<VarId>,
}

impl SolveObserver<f64> for InitialConditionRecorder {
    fn initial_condition(&mut self, dep: &Var<f64>) {
        self.initial_conditions.push(dep.id());
    }
}

#[test]
fn cycle_needs_later_solutions_as_initial_conditions() {
    let (_x, y, _c, solver) = make_system(1.0, FixedPointParameters::new(1e-12, 0.0));

    // The first equation reads y before the second has solved it.
    let ic: Vec<VarId> = solver
        .record()
        .initial_condition_dependencies()
        .iter()
        .map(Var::id)
        .collect();
    assert_eq!(ic, vec![y.id()]);

    let mut observer = InitialConditionRecorder {
        initial_conditions: Vec::new(),
    };
    solver.solve_observed(&mut observer).unwrap();
    assert_eq!(observer.initial_conditions, vec![y.id()]);
}

// ============================================================
// Test 4: adjoint of the fixed point, checked by finite
// differences of the converged forward map
// ============================================================

#[test]
fn adjoint_matches_finite_difference() {
    let (x, _y, c, solver) = make_system(1.0, FixedPointParameters::new(1e-13, 0.0));
    solver.solve().unwrap();
    let base = x.value(0);

    // Seed d(J)/d(solution) for J = x.
    let seed_x = Var::new_typed(1, SpaceType::ConjugateDual);
    seed_x.assign_values(&[1.0]);
    let seed_y = Var::new_typed(1, SpaceType::ConjugateDual);
    let b = vec![seed_x, seed_y];

    let c_index = dep_index_of(solver.record(), c.id());
    let dep_b = AdjointRhs::new(&c);
    let mut dep_bs = BTreeMap::new();
    dep_bs.insert(c_index, dep_b.clone());

    let adj = solver.adjoint(None, &[], b, &dep_bs).unwrap();
    assert!(adj.is_some(), "adjoint is not structurally zero");

    let gradient = dep_b.b().value(0);
    assert_relative_eq!(gradient, 2.0, max_relative = 1e-9);

    // Finite-difference check of the composite derivative dx*/dc.
    let h = 1e-7;
    c.assign_values(&[1.0 + h]);
    solver.solve().unwrap();
    let fd = (x.value(0) - base) / h;
    assert_relative_eq!(gradient, fd, max_relative = 1e-5);
}

#[test]
fn adjoint_with_offset_start_index() {
    let mut parameters = FixedPointParameters::new(1e-13, 0.0);
    parameters.adjoint_eqs_index_0 = 1;
    let (x, _y, c, solver) = make_system(1.0, parameters);
    solver.solve().unwrap();
    assert_relative_eq!(x.value(0), 2.0, max_relative = 1e-10);

    let seed_x = Var::new_typed(1, SpaceType::ConjugateDual);
    seed_x.assign_values(&[1.0]);
    let b = vec![seed_x, Var::new_typed(1, SpaceType::ConjugateDual)];

    let c_index = dep_index_of(solver.record(), c.id());
    let dep_b = AdjointRhs::new(&c);
    let mut dep_bs = BTreeMap::new();
    dep_bs.insert(c_index, dep_b.clone());

    solver.adjoint(None, &[], b, &dep_bs).unwrap();
    assert_relative_eq!(dep_b.b().value(0), 2.0, max_relative = 1e-9);
}

// ============================================================
// Test 5: tangent-linear of the fixed point is a fixed point of
// the linearized system
// ============================================================

#[test]
fn tangent_linear_solves_linearized_fixed_point() {
    let (x, _y, c, solver) = make_system(1.0, FixedPointParameters::new(1e-13, 0.0));
    solver.solve().unwrap();

    let dc = Var::static_from_values(vec![1.0]);
    let tlm_map = TangentLinearMap::new(&[c.clone()], &[dc.clone()]).unwrap();
    let tlm = solver
        .tangent_linear(&[c.clone()], &[dc.clone()], &tlm_map)
        .unwrap();
    tlm.solve().unwrap();

    // x* = 2 c, so the directional derivative along dc = 1 is 2.
    let tau_x = tlm_map.var(&x);
    assert_relative_eq!(tau_x.value(0), 2.0, max_relative = 1e-9);
}

use std::collections::BTreeMap;
use std::rc::Rc;

use approx::assert_relative_eq;
use quoll::{
    transitive_referrers, AdjointRhs, ConstantMatrix, Equation, EquationError, FactorizationCache,
    LinearEquation, MatrixActionRhs, Rhs, SpaceType, TangentLinearMap, Var,
};

fn terms(list: Vec<Rc<dyn Rhs<f64>>>) -> Vec<Rc<dyn Rhs<f64>>> {
    list
}

// ============================================================
// Test 1: identity operator — the solution is the term sum
// ============================================================

#[test]
fn identity_solve_sums_terms() {
    let x = Var::<f64>::new(2);
    let y = Var::from_values(vec![1.0, 2.0]);
    let z = Var::from_values(vec![10.0, 20.0]);

    let eq = LinearEquation::new(
        vec![x.clone()],
        terms(vec![
            Rc::new(MatrixActionRhs::identity(&y).unwrap()),
            Rc::new(MatrixActionRhs::scaled_identity(2.0, &z).unwrap()),
        ]),
        None,
    )
    .unwrap();
    eq.solve().unwrap();

    assert_eq!(x.values(), vec![21.0, 42.0]);
}

// ============================================================
// Test 2: a term may not depend on a solution variable
// ============================================================

#[test]
fn rhs_depending_on_solution_rejected() {
    let x = Var::<f64>::new(2);
    let result = LinearEquation::new(
        vec![x.clone()],
        terms(vec![Rc::new(MatrixActionRhs::identity(&x).unwrap())]),
        None,
    );
    assert_eq!(result.err(), Some(EquationError::RhsDependsOnSolution));
}

// ============================================================
// Test 3: adjoint superposition over terms sharing a dependency
// ============================================================

#[test]
fn adjoint_derivative_action_superposes() {
    let x = Var::<f64>::new(2);
    let y = Var::from_values(vec![1.0, 2.0]);

    let term1 = Rc::new(MatrixActionRhs::identity(&y).unwrap());
    let term2 = Rc::new(MatrixActionRhs::scaled_identity(2.0, &y).unwrap());
    let eq = LinearEquation::new(
        vec![x.clone()],
        terms(vec![term1.clone(), term2.clone()]),
        None,
    )
    .unwrap();

    let adj = Var::new_typed(2, SpaceType::ConjugateDual);
    adj.assign_values(&[1.0, -3.0]);

    // Dependencies are [x, y]; y is index 1.
    let action = eq
        .adjoint_derivative_action(&[], 1, &[adj.clone()])
        .unwrap();
    let combined = AdjointRhs::new(&y);
    combined.sub(action);

    // Each term contributes its own adjoint action; the total is the sum.
    let separate = y.new_conjugate_dual();
    term1
        .subtract_adjoint_derivative_action(&[], 0, &[adj.clone()], &separate)
        .unwrap();
    term2
        .subtract_adjoint_derivative_action(&[], 0, &[adj.clone()], &separate)
        .unwrap();

    // combined.b() = -action = +3 adj; separate = -3 adj.
    assert_eq!(combined.b().values(), vec![3.0, -9.0]);
    assert_eq!(separate.values(), vec![-3.0, 9.0]);
}

// ============================================================
// Test 4: dense operator solve with cached factorization
// ============================================================

#[test]
fn constant_matrix_solve_caches_factorization() {
    let cache = FactorizationCache::<f64>::new();
    let coefficients = Var::static_from_values(vec![2.0, 1.0, 1.0, 3.0]);
    let a = Rc::new(ConstantMatrix::with_cache(coefficients.clone(), cache.clone()).unwrap());

    let x = Var::<f64>::new(2);
    let y = Var::from_values(vec![5.0, 10.0]);
    let eq = LinearEquation::new(
        vec![x.clone()],
        terms(vec![Rc::new(MatrixActionRhs::identity(&y).unwrap())]),
        Some(a),
    )
    .unwrap();

    // [2 1; 1 3] x = [5; 10] has solution [1; 3].
    eq.solve().unwrap();
    assert_relative_eq!(x.value(0), 1.0, max_relative = 1e-12);
    assert_relative_eq!(x.value(1), 3.0, max_relative = 1e-12);
    assert_eq!(cache.len(), 1);

    // A second solve reuses the factorization.
    y.assign_values(&[4.0, 7.0]);
    eq.solve().unwrap();
    assert_eq!(cache.len(), 1);
    assert_relative_eq!(x.value(0), 1.0, max_relative = 1e-12);
    assert_relative_eq!(x.value(1), 2.0, max_relative = 1e-12);

    // Mutating the coefficients invalidates the factorization.
    coefficients.assign_values(&[1.0, 0.0, 0.0, 1.0]);
    coefficients.update_caches();
    assert!(cache.is_empty());

    eq.solve().unwrap();
    assert_eq!(cache.len(), 1);
    assert_relative_eq!(x.value(0), 4.0, max_relative = 1e-12);
    assert_relative_eq!(x.value(1), 7.0, max_relative = 1e-12);
}

// ============================================================
// Test 5: adjoint solve through a dense operator
// ============================================================

#[test]
fn constant_matrix_adjoint() {
    let a = Rc::new(ConstantMatrix::from_rows(vec![vec![2.0, 1.0], vec![0.0, 3.0]]).unwrap());
    let x = Var::<f64>::new(2);
    let y = Var::from_values(vec![1.0, 1.0]);
    let eq = LinearEquation::new(
        vec![x.clone()],
        terms(vec![Rc::new(MatrixActionRhs::identity(&y).unwrap())]),
        Some(a),
    )
    .unwrap();
    eq.solve().unwrap();

    // Adjoint system A^T lambda = seed with seed = [1; 0]:
    // 2 l0 = 1, l0 + 3 l1 = 0 => lambda = [0.5; -1/6].
    let seed = Var::new_typed(2, SpaceType::ConjugateDual);
    seed.assign_values(&[1.0, 0.0]);

    let dep_b = AdjointRhs::new(&y);
    let mut dep_bs = BTreeMap::new();
    dep_bs.insert(1, dep_b.clone());

    let adj = eq
        .adjoint(None, &[], vec![seed], &dep_bs)
        .unwrap()
        .expect("adjoint is not structurally zero");

    assert_relative_eq!(adj[0].value(0), 0.5, max_relative = 1e-12);
    assert_relative_eq!(adj[0].value(1), -1.0 / 6.0, max_relative = 1e-12);
    // The identity term contributes -(-lambda) = +lambda to y's accumulator.
    assert_relative_eq!(dep_b.b().value(0), 0.5, max_relative = 1e-12);
    assert_relative_eq!(dep_b.b().value(1), -1.0 / 6.0, max_relative = 1e-12);
}

// ============================================================
// Test 6: tangent-linear shares the operator
// ============================================================

#[test]
fn tangent_linear_shares_operator_and_factorization() {
    let cache = FactorizationCache::<f64>::new();
    let coefficients = Var::static_from_values(vec![2.0, 1.0, 1.0, 3.0]);
    let a = Rc::new(ConstantMatrix::with_cache(coefficients, cache.clone()).unwrap());

    let x = Var::<f64>::new(2);
    let y = Var::from_values(vec![5.0, 10.0]);
    let eq = LinearEquation::new(
        vec![x.clone()],
        terms(vec![Rc::new(MatrixActionRhs::identity(&y).unwrap())]),
        Some(a),
    )
    .unwrap();
    eq.solve().unwrap();

    let dy = Var::static_from_values(vec![5.0, 0.0]);
    let tlm_map = TangentLinearMap::new(&[y.clone()], &[dy.clone()]).unwrap();
    let tlm_eq = eq
        .tangent_linear(&[y.clone()], &[dy.clone()], &tlm_map)
        .unwrap();
    tlm_eq.solve().unwrap();

    // A tau = dy: [2 1; 1 3] tau = [5; 0] => tau = [3; -1].
    let tau = tlm_map.var(&x);
    assert_relative_eq!(tau.value(0), 3.0, max_relative = 1e-12);
    assert_relative_eq!(tau.value(1), -1.0, max_relative = 1e-12);
    // Same operator, same cached factorization.
    assert_eq!(cache.len(), 1);
}

// ============================================================
// Test 7: reference graph connects terms to their equation
// ============================================================

#[test]
fn terms_are_referenced_by_their_equation() {
    let x = Var::<f64>::new(1);
    let y = Var::from_values(vec![1.0]);
    let term = Rc::new(MatrixActionRhs::identity(&y).unwrap());
    let term_id = term.record().referrer().id();

    let eq = LinearEquation::new(vec![x], terms(vec![term]), None).unwrap();
    let reachable = transitive_referrers(term_id);
    assert!(reachable.contains(&eq.record().id()));

    let eq_id = eq.record().id();
    drop(eq);
    assert!(!transitive_referrers(term_id).contains(&eq_id));
}

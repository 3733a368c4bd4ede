use std::hint::black_box;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion};
use quoll::{
    Equation, FixedPointParameters, FixedPointSolver, LinearEquation, MatrixActionRhs, Rhs, Var,
};

/// x = 0.5 y + c, y = x; fixed point x = y = 2 c.
fn build_solver(n: usize) -> (Var<f64>, FixedPointSolver<f64>) {
    let x = Var::<f64>::new(n);
    let y = Var::<f64>::new(n);
    let c = Var::static_from_values(vec![1.0; n]);

    let eq1_terms: Vec<Rc<dyn Rhs<f64>>> = vec![
        Rc::new(MatrixActionRhs::scaled_identity(0.5, &y).unwrap()),
        Rc::new(MatrixActionRhs::identity(&c).unwrap()),
    ];
    let eq1 = LinearEquation::new(vec![x.clone()], eq1_terms, None).unwrap();
    let eq2_terms: Vec<Rc<dyn Rhs<f64>>> = vec![Rc::new(MatrixActionRhs::identity(&x).unwrap())];
    let eq2 = LinearEquation::new(vec![y.clone()], eq2_terms, None).unwrap();

    let solver = FixedPointSolver::new(
        vec![Box::new(eq1), Box::new(eq2)],
        FixedPointParameters::new(1e-12, 0.0),
    )
    .unwrap();
    (x, solver)
}

fn bench_forward(c: &mut Criterion) {
    c.bench_function("fixed_point_forward_n32", |b| {
        b.iter(|| {
            let (x, solver) = build_solver(32);
            solver.solve().unwrap();
            black_box(x.value(0))
        })
    });
}

fn bench_construction(c: &mut Criterion) {
    c.bench_function("fixed_point_construction_n32", |b| {
        b.iter(|| {
            let (_, solver) = build_solver(32);
            black_box(solver.record().dependencies().len())
        })
    });
}

criterion_group!(benches, bench_forward, bench_construction);
criterion_main!(benches);

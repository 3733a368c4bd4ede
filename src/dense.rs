//! Dense linear algebra backend: LU factorization, a value-independent
//! operator with cached factorizations, and dense right-hand-side terms.
//!
//! Factorizations are stored in a [`Cache`] keyed by the coefficient
//! variable's identity, with the coefficient variable as the entry's
//! dependency: mutating the coefficients and refreshing caches invalidates
//! the factorization. A per-thread default cache is used unless one is
//! injected per instance.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cache::{Cache, CacheRef};
use crate::equation::{EquationError, SolveError};
use crate::float::Float;
use crate::linear::{Accumulate, Matrix, MatrixRecord, Rhs, RhsRecord};
use crate::tangent::TangentLinearMap;
use crate::var::{Var, VarId};

/// LU factors of a square matrix, with partial pivoting.
///
/// Stores the combined L/U factors in a single matrix (L below the diagonal
/// with implicit unit diagonal, U on and above) plus the row permutation.
pub struct LuFactors<F> {
    lu: Vec<Vec<F>>,
    perm: Vec<usize>,
    n: usize,
}

impl<F: Float> LuFactors<F> {
    /// Factorize an `n x n` matrix. Fails on a zero or near-zero pivot.
    // Explicit indexing is clearer for pivoted LU: row/col indices drive
    // pivot search and elimination
    #[allow(clippy::needless_range_loop)]
    pub fn factor(a: &[Vec<F>]) -> Result<Self, SolveError> {
        let n = a.len();
        debug_assert!(a.iter().all(|row| row.len() == n));

        let mut lu: Vec<Vec<F>> = a.to_vec();
        let mut perm: Vec<usize> = (0..n).collect();
        let eps = F::from(1e-12).unwrap_or_else(F::epsilon);

        for col in 0..n {
            let mut pivot_row = col;
            let mut pivot_val = lu[col][col].abs();
            for row in (col + 1)..n {
                let v = lu[row][col].abs();
                if v > pivot_val {
                    pivot_val = v;
                    pivot_row = row;
                }
            }
            if pivot_val <= eps {
                return Err(SolveError::SingularMatrix);
            }
            if pivot_row != col {
                lu.swap(col, pivot_row);
                perm.swap(col, pivot_row);
            }
            let pivot = lu[col][col];
            for row in (col + 1)..n {
                let factor = lu[row][col] / pivot;
                lu[row][col] = factor;
                for k in (col + 1)..n {
                    let sub = factor * lu[col][k];
                    lu[row][k] = lu[row][k] - sub;
                }
            }
        }
        Ok(LuFactors { lu, perm, n })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Solve `A x = b`.
    pub fn solve(&self, b: &[F]) -> Vec<F> {
        let n = self.n;
        debug_assert_eq!(b.len(), n);
        let mut y = vec![F::zero(); n];
        for i in 0..n {
            let mut s = b[self.perm[i]];
            for j in 0..i {
                s = s - self.lu[i][j] * y[j];
            }
            y[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = y[i];
            for j in (i + 1)..n {
                s = s - self.lu[i][j] * y[j];
            }
            y[i] = s / self.lu[i][i];
        }
        y
    }

    /// Solve `A^T y = b`, reusing the factors of `A`.
    pub fn solve_transposed(&self, b: &[F]) -> Vec<F> {
        let n = self.n;
        debug_assert_eq!(b.len(), n);
        // With P A = L U: A^T y = b becomes U^T L^T (P y) = b.
        let mut z = vec![F::zero(); n];
        for i in 0..n {
            let mut s = b[i];
            for j in 0..i {
                s = s - self.lu[j][i] * z[j];
            }
            z[i] = s / self.lu[i][i];
        }
        let mut w = z;
        for i in (0..n).rev() {
            let mut s = w[i];
            for j in (i + 1)..n {
                s = s - self.lu[j][i] * w[j];
            }
            w[i] = s;
        }
        let mut y = vec![F::zero(); n];
        for i in 0..n {
            y[self.perm[i]] = w[i];
        }
        y
    }
}

/// Structural key of a cached factorization: the coefficient variable's
/// identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FactorizationKey(pub VarId);

pub type FactorizationCache<F> = Cache<FactorizationKey, LuFactors<F>>;

thread_local! {
    static FACTORIZATIONS_F32: RefCell<FactorizationCache<f32>> = RefCell::new(Cache::new());
    static FACTORIZATIONS_F64: RefCell<FactorizationCache<f64>> = RefCell::new(Cache::new());
}

/// Selects the per-thread default factorization cache for a float type.
pub trait FactorizationCacheLocal: Float {
    fn local() -> &'static std::thread::LocalKey<RefCell<FactorizationCache<Self>>>;
}

impl FactorizationCacheLocal for f32 {
    fn local() -> &'static std::thread::LocalKey<RefCell<FactorizationCache<Self>>> {
        &FACTORIZATIONS_F32
    }
}

impl FactorizationCacheLocal for f64 {
    fn local() -> &'static std::thread::LocalKey<RefCell<FactorizationCache<Self>>> {
        &FACTORIZATIONS_F64
    }
}

/// A handle to the per-thread default factorization cache.
pub fn factorization_cache<F: FactorizationCacheLocal>() -> FactorizationCache<F> {
    F::local().with(|cache| cache.borrow().clone())
}

/// Replace the per-thread default factorization cache.
pub fn set_factorization_cache<F: FactorizationCacheLocal>(cache: FactorizationCache<F>) {
    F::local().with(|slot| *slot.borrow_mut() = cache);
}

/// A square, value-independent operator with dense coefficients.
///
/// The coefficients live in a variable, row-major. Forward and adjoint
/// solves are direct (no initial guess) and share one cached factorization.
pub struct ConstantMatrix<F: Float> {
    record: MatrixRecord<F>,
    a: Var<F>,
    n: usize,
    cache: FactorizationCache<F>,
}

impl<F: Float + FactorizationCacheLocal> ConstantMatrix<F> {
    /// With the per-thread default factorization cache. The coefficient
    /// variable's length must be a perfect square.
    pub fn new(a: Var<F>) -> Result<Self, EquationError> {
        Self::with_cache(a, factorization_cache::<F>())
    }

    /// Build the coefficient variable from rows.
    pub fn from_rows(rows: Vec<Vec<F>>) -> Result<Self, EquationError> {
        let n = rows.len();
        let mut values = Vec::with_capacity(n * n);
        for row in &rows {
            if row.len() != n {
                return Err(EquationError::MatrixShapeMismatch {
                    expected: n,
                    found: row.len(),
                });
            }
            values.extend_from_slice(row);
        }
        Self::new(Var::static_from_values(values))
    }
}

impl<F: Float> ConstantMatrix<F> {
    /// With an explicit factorization cache.
    pub fn with_cache(a: Var<F>, cache: FactorizationCache<F>) -> Result<Self, EquationError> {
        let len = a.len();
        let n = (len as f64).sqrt().round() as usize;
        if n * n != len {
            return Err(EquationError::NonSquareMatrix { len });
        }
        Ok(ConstantMatrix {
            record: MatrixRecord::new(Vec::new(), false, false)?,
            a,
            n,
            cache,
        })
    }

    /// The coefficient variable.
    pub fn coefficients(&self) -> Var<F> {
        self.a.clone()
    }

    fn rows(&self) -> Vec<Vec<F>> {
        if self.n == 0 {
            return Vec::new();
        }
        self.a.values().chunks(self.n).map(<[F]>::to_vec).collect()
    }

    fn factors(&self) -> Result<(CacheRef<LuFactors<F>>, Rc<LuFactors<F>>), SolveError> {
        self.cache.try_add(
            FactorizationKey(self.a.id()),
            || LuFactors::factor(&self.rows()),
            &[&self.a],
        )
    }
}

fn accumulate<F: Float>(b: &Var<F>, values: &[F], mode: Accumulate) {
    match mode {
        Accumulate::Assign => b.assign_values(values),
        Accumulate::Add => {
            let mut acc = b.values();
            for (a, v) in acc.iter_mut().zip(values) {
                *a = *a + *v;
            }
            b.assign_values(&acc);
        }
        Accumulate::Subtract => {
            let mut acc = b.values();
            for (a, v) in acc.iter_mut().zip(values) {
                *a = *a - *v;
            }
            b.assign_values(&acc);
        }
    }
}

fn apply<F: Float>(rows: &[Vec<F>], x: &[F]) -> Vec<F> {
    rows.iter()
        .map(|row| {
            let mut s = F::zero();
            for (a, xi) in row.iter().zip(x) {
                s = s + *a * *xi;
            }
            s
        })
        .collect()
}

fn apply_transposed<F: Float>(rows: &[Vec<F>], x: &[F]) -> Vec<F> {
    let cols = rows.first().map_or(0, Vec::len);
    let mut out = vec![F::zero(); cols];
    for (row, xi) in rows.iter().zip(x) {
        for (o, a) in out.iter_mut().zip(row) {
            *o = *o + *a * *xi;
        }
    }
    out
}

impl<F: Float> Matrix<F> for ConstantMatrix<F> {
    fn record(&self) -> &MatrixRecord<F> {
        &self.record
    }

    fn forward_action(
        &self,
        _nl_deps: &[Var<F>],
        x: &[Var<F>],
        b: &[Var<F>],
        mode: Accumulate,
    ) -> Result<(), SolveError> {
        assert_eq!(x.len(), 1, "dense operators act on single-component solutions");
        accumulate(&b[0], &apply(&self.rows(), &x[0].values()), mode);
        Ok(())
    }

    fn adjoint_action(
        &self,
        _nl_deps: &[Var<F>],
        adj_x: &[Var<F>],
        b: &Var<F>,
        b_index: usize,
        mode: Accumulate,
    ) -> Result<(), SolveError> {
        assert_eq!(adj_x.len(), 1, "dense operators act on single-component solutions");
        if b_index != 0 {
            return Err(SolveError::DependencyIndexOutOfBounds { index: b_index });
        }
        accumulate(b, &apply_transposed(&self.rows(), &adj_x[0].values()), mode);
        Ok(())
    }

    fn forward_solve(
        &self,
        x: &[Var<F>],
        _nl_deps: &[Var<F>],
        b: &[Var<F>],
    ) -> Result<(), SolveError> {
        assert_eq!(x.len(), 1, "dense operators act on single-component solutions");
        let (_, factors) = self.factors()?;
        x[0].assign_values(&factors.solve(&b[0].values()));
        Ok(())
    }

    fn adjoint_solve(
        &self,
        adj_x: Option<Vec<Var<F>>>,
        _nl_deps: &[Var<F>],
        b: &[Var<F>],
    ) -> Result<Option<Vec<Var<F>>>, SolveError> {
        let (_, factors) = self.factors()?;
        let solution = factors.solve_transposed(&b[0].values());
        let adj_x = match adj_x {
            Some(adj_x) => {
                adj_x[0].assign_values(&solution);
                adj_x
            }
            None => {
                let adj = b[0].new_conjugate_dual();
                adj.assign_values(&solution);
                vec![adj]
            }
        };
        Ok(Some(adj_x))
    }

    fn tangent_linear_rhs(
        &self,
        _m: &[Var<F>],
        _dm: &[Var<F>],
        _tlm_map: &TangentLinearMap<F>,
        _x: &[Var<F>],
    ) -> Result<Vec<Rc<dyn Rhs<F>>>, EquationError> {
        // Value-independent operator: no derivative terms.
        Ok(Vec::new())
    }
}

/// The right-hand-side term `b += A y` for constant dense `A` and dependency
/// `y`.
///
/// Declared linear in `y`: the adjoint derivative action `b -= A^T adj`
/// needs no dependency values, and the tangent-linear term is `A tau_y`.
pub struct MatrixActionRhs<F: Float> {
    record: RhsRecord<F>,
    a: Rc<Vec<Vec<F>>>,
}

impl<F: Float> MatrixActionRhs<F> {
    pub fn new(a: Vec<Vec<F>>, y: &Var<F>) -> Result<Self, EquationError> {
        Self::from_shared(Rc::new(a), y)
    }

    fn from_shared(a: Rc<Vec<Vec<F>>>, y: &Var<F>) -> Result<Self, EquationError> {
        for row in a.iter() {
            if row.len() != y.len() {
                return Err(EquationError::MatrixShapeMismatch {
                    expected: y.len(),
                    found: row.len(),
                });
            }
        }
        Ok(MatrixActionRhs {
            record: RhsRecord::new(vec![y.clone()], Some(Vec::new()))?,
            a,
        })
    }

    /// The term `b += y`.
    pub fn identity(y: &Var<F>) -> Result<Self, EquationError> {
        Self::scaled_identity(F::one(), y)
    }

    /// The term `b += alpha y`.
    pub fn scaled_identity(alpha: F, y: &Var<F>) -> Result<Self, EquationError> {
        let n = y.len();
        let mut rows = vec![vec![F::zero(); n]; n];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = alpha;
        }
        Self::new(rows, y)
    }

    fn dep(&self) -> Var<F> {
        self.record.dependencies()[0].clone()
    }
}

impl<F: Float> Rhs<F> for MatrixActionRhs<F> {
    fn record(&self) -> &RhsRecord<F> {
        &self.record
    }

    fn add_forward(&self, b: &[Var<F>], deps: &[Var<F>]) -> Result<(), SolveError> {
        assert_eq!(b.len(), 1, "dense terms apply to single-component equations");
        accumulate(&b[0], &apply(&self.a, &deps[0].values()), Accumulate::Add);
        Ok(())
    }

    fn subtract_adjoint_derivative_action(
        &self,
        _nl_deps: &[Var<F>],
        dep_index: usize,
        adj_x: &[Var<F>],
        b: &Var<F>,
    ) -> Result<(), SolveError> {
        if dep_index != 0 {
            return Err(SolveError::DependencyIndexOutOfBounds { index: dep_index });
        }
        assert_eq!(adj_x.len(), 1, "dense terms apply to single-component equations");
        accumulate(
            b,
            &apply_transposed(&self.a, &adj_x[0].values()),
            Accumulate::Subtract,
        );
        Ok(())
    }

    fn tangent_linear_rhs(
        &self,
        _m: &[Var<F>],
        _dm: &[Var<F>],
        tlm_map: &TangentLinearMap<F>,
    ) -> Result<Vec<Rc<dyn Rhs<F>>>, EquationError> {
        match tlm_map.tangent(&self.dep()) {
            Some(tau) => Ok(vec![Rc::new(Self::from_shared(Rc::clone(&self.a), &tau)?)]),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lu_solves_known_system() {
        // [2 1; 1 3] x = [5; 10] has solution x = [1; 3]
        let a = vec![vec![2.0_f64, 1.0], vec![1.0, 3.0]];
        let factors = LuFactors::factor(&a).unwrap();
        let x = factors.solve(&[5.0, 10.0]);
        assert!((x[0] - 1.0).abs() < 1e-12, "x[0] = {}", x[0]);
        assert!((x[1] - 3.0).abs() < 1e-12, "x[1] = {}", x[1]);
    }

    #[test]
    fn lu_transpose_solve() {
        // Non-symmetric so the transpose solve is distinguishable.
        let a = vec![vec![2.0_f64, 1.0], vec![0.0, 3.0]];
        let factors = LuFactors::factor(&a).unwrap();
        // A^T = [2 0; 1 3], so A^T y = [4; 10] gives y0 = 2, y1 = 8/3.
        let y = factors.solve_transposed(&[4.0, 10.0]);
        assert!((y[0] - 2.0).abs() < 1e-12, "y[0] = {}", y[0]);
        assert!((y[1] - 8.0 / 3.0).abs() < 1e-12, "y[1] = {}", y[1]);
    }

    #[test]
    fn lu_pivoting() {
        // Leading zero forces a row swap.
        let a = vec![vec![0.0_f64, 1.0], vec![1.0, 0.0]];
        let factors = LuFactors::factor(&a).unwrap();
        let x = factors.solve(&[3.0, 7.0]);
        assert_eq!(x, vec![7.0, 3.0]);
    }

    #[test]
    fn lu_singular() {
        let a = vec![vec![1.0_f64, 2.0], vec![2.0, 4.0]];
        assert!(matches!(
            LuFactors::factor(&a),
            Err(SolveError::SingularMatrix)
        ));
    }
}

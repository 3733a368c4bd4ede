//! Conversions between quoll variables and nalgebra vectors/matrices.
//!
//! Enabled with the `nalgebra` feature.

use nalgebra::{DMatrix, DVector};

use crate::dense::{ConstantMatrix, FactorizationCacheLocal};
use crate::equation::EquationError;
use crate::float::Float;
use crate::space::SpaceType;
use crate::var::Var;

/// Copy a variable's values into a `DVector`.
pub fn to_dvector<F: Float + nalgebra::Scalar>(x: &Var<F>) -> DVector<F> {
    DVector::from_vec(x.values())
}

/// A new checkpointed variable initialized from a `DVector`.
pub fn from_dvector<F: Float + nalgebra::Scalar>(v: &DVector<F>, space_type: SpaceType) -> Var<F> {
    Var::from_values_typed(v.as_slice().to_vec(), space_type)
}

/// Assign a `DVector` into an existing variable. Lengths must agree.
pub fn assign_dvector<F: Float + nalgebra::Scalar>(x: &Var<F>, v: &DVector<F>) {
    x.assign_values(v.as_slice());
}

/// A [`ConstantMatrix`] from a square `DMatrix`.
pub fn constant_matrix_from<F>(m: &DMatrix<F>) -> Result<ConstantMatrix<F>, EquationError>
where
    F: Float + FactorizationCacheLocal + nalgebra::Scalar,
{
    let rows = (0..m.nrows())
        .map(|i| m.row(i).iter().copied().collect::<Vec<F>>())
        .collect();
    ConstantMatrix::from_rows(rows)
}

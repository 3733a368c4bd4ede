//! Equation-level adjoint and tangent-linear differentiation.
//!
//! quoll differentiates computations expressed as sequences of
//! implicitly-defined equation solves. Each equation declares its solution
//! variables, dependencies and residual-specific operations; the crate
//! records enough structure to replay the solves backward (adjoint) or
//! forward (tangent-linear), with dependency-indexed caching of expensive
//! artifacts and support for models containing internal fixed-point
//! iteration.

pub mod adjoint;
pub mod cache;
pub mod dense;
pub mod equation;
pub mod fixed_point;
pub mod float;
pub mod linear;
#[cfg(feature = "nalgebra")]
pub mod nalgebra_support;
pub mod referrer;
pub mod space;
pub mod tangent;
pub mod var;

pub use adjoint::{AdjointAction, AdjointEquationRhs, AdjointModelRhs, AdjointRhs};
pub use cache::{Cache, CacheDep, CacheId, CacheRef, Caches};
pub use dense::{
    factorization_cache, set_factorization_cache, ConstantMatrix, FactorizationCache,
    FactorizationCacheLocal, FactorizationKey, LuFactors, MatrixActionRhs,
};
pub use equation::{
    Equation, EquationError, EquationRecord, EquationRecordBuilder, IterationPass, SolveError,
    SolveObserver, ZeroAssignment,
};
pub use fixed_point::{l2_norm_sq, FixedPointParameters, FixedPointSolver, NormSq};
pub use float::Float;
pub use linear::{Accumulate, LinearEquation, Matrix, MatrixRecord, Rhs, RhsRecord};
pub use referrer::{transitive_referrers, Referrer, ReferrerId};
pub use space::{RelSpaceType, SpaceType};
pub use tangent::TangentLinearMap;
pub use var::{Var, VarId};

//! # wass-barycenter
//!
//! Barycenters under optimal transport: one weighted measure that sits "in
//! the middle" of many.
//!
//! ## The Problem
//!
//! Given `M` weighted point clouds (or `M` pairwise-distance matrices whose
//! points live in unrelated spaces), find a single measure of `k` points
//! minimising the weighted sum of its entropic transport costs to all of
//! them. When the inputs share a space this is the Wasserstein barycenter;
//! when only their internal structure is comparable it is the
//! Gromov-Wasserstein (GW) barycenter, optionally "fused" with per-point
//! features.
//!
//! ## Key Types
//!
//! | Type | Use Case |
//! |------|----------|
//! | [`BarycenterProblem`] | Measures (padded or flat + segments) and mixing weights |
//! | [`GwBarycenterProblem`] | Structures, loss, optional fused features |
//! | [`GwBarycenterSolver`] | Fixed-point GW barycenter: `[k, k]` structure |
//! | [`WassersteinBarycenter`] | Free-support barycenter: `[k, d]` points |
//! | [`GromovWasserstein`] | One entropic (fused) GW solve |
//! | [`Sinkhorn`] | One entropic linear OT solve (log domain) |
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use wass_barycenter::{
//!     BarycenterInit, BarycenterProblem, GwBarycenterConfig, GwBarycenterProblem,
//!     GwBarycenterSolver, Segments,
//! };
//!
//! // Two triangles of different scale, given as one flat array.
//! let y = array![
//!     [0.0, 0.0], [1.0, 0.0], [0.0, 1.0],
//!     [0.0, 0.0], [2.0, 0.0], [0.0, 2.0],
//! ];
//! let problem = GwBarycenterProblem::from_point_clouds(
//!     BarycenterProblem::segmented(y, None, Segments::from_counts(vec![3, 3])).with_epsilon(0.1),
//! );
//!
//! let solver = GwBarycenterSolver::new(GwBarycenterConfig::default()).unwrap();
//! let state = solver.solve(&problem, BarycenterInit::Size(3), None, Some(0)).unwrap();
//!
//! assert_eq!(state.c.dim(), (3, 3));
//! assert!(state.num_iterations() >= 5);
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Inner solves not converging**: not an error. Check
//!    `state.gw_convergence` (or [`GwBarycenterState::status`]); raise the
//!    inner budgets or epsilon.
//! 2. **KL loss on zero structures**: the KL loss takes `ln` of structure
//!    entries, floored at [`loss::KL_LOG_FLOOR`]. A zero diagonal is fine,
//!    but barycenter entries built only from zeros end up near the floor.
//!    A NaN or infinite cost is reported as [`Status::Diverged`].
//! 3. **Feature update under KL**: only the squared-Euclidean loss can move
//!    fused features; KL returns [`Error::NotImplemented`].
//! 4. **Debiasing**: problems accept it, solvers refuse it.
//! 5. **Low rank**: requesting a rank is rejected at construction.
//!
//! ## References
//!
//! - Peyré, Cuturi & Solomon (2016). "Gromov-Wasserstein Averaging of Kernel and Distance Matrices"
//! - Vayer et al. (2019). "Optimal Transport for structured data with application on graphs"
//! - Cuturi & Doucet (2014). "Fast Computation of Wasserstein Barycenters"
//! - Peyré & Cuturi (2019). "Computational Optimal Transport"

use thiserror::Error;

pub mod continuous;
pub mod fixed_point;
pub mod geometry;
pub mod gromov;
pub mod gw_problem;
pub mod gw_solver;
pub mod loss;
pub mod parts;
pub mod problem;
pub mod segment;
pub mod sinkhorn;

pub use continuous::{
    FreeInit, WassersteinBarycenter, WassersteinBarycenterConfig, WassersteinBarycenterState,
};
pub use fixed_point::{fixpoint_iter, Status};
pub use geometry::{build_geometry, CostFn, Geometry, ScaleCost, Support};
pub use gromov::{GromovConfig, GromovWasserstein, GwOutput, QuadraticProblem};
pub use gw_problem::{barycentric_projection, GwBarycenterProblem, StructureKind};
pub use gw_solver::{BarycenterInit, GwBarycenterConfig, GwBarycenterSolver, GwBarycenterState};
pub use loss::GwLoss;
pub use parts::Parts;
pub use problem::{BarycenterProblem, PointArray, WeightArray};
pub use segment::{max_segment_size, pad_cost_matrices, segment_point_cloud, Segments};
pub use sinkhorn::{LinearProblem, Sinkhorn, SinkhornConfig, SinkhornOutput};

/// Barycenter error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Two lengths that must agree do not.
    #[error("length mismatch: expected {0}, got {1}")]
    LengthMismatch(usize, usize),

    /// Cost matrix shape mismatch.
    #[error("cost matrix shape mismatch: expected ({0}, {1}), got ({2}, {3})")]
    CostShapeMismatch(usize, usize, usize, usize),

    /// An array has the wrong shape.
    #[error("{what} shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Invalid regularization parameter.
    #[error("regularization parameter must be positive and finite, got {0}")]
    InvalidRegularization(f64),

    /// Loss name other than `sqeucl` or `kl`.
    #[error("unknown loss `{0}`, expected `sqeucl` or `kl`")]
    UnknownLoss(String),

    /// Recognised configuration without an implementation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Fused problem or state without its feature array.
    #[error("fused problem requires features")]
    MissingFeatures,

    /// Operation needs measures and the problem has none.
    #[error("problem has no measures")]
    MissingMeasures,

    /// Inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),
}

/// Result type for barycenter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// This is the classic "log-sum-exp trick":
/// \[
/// \log \sum_i \exp(x_i) = m + \log \sum_i \exp(x_i - m), \quad m = \max_i x_i
/// \]
///
/// Returns `-∞` if `len == 0`.
#[inline]
pub(crate) fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f64) -> f64 {
    if len == 0 {
        return f64::NEG_INFINITY;
    }

    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        // If everything is -inf (or NaN), propagate the max.
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

//! Ground costs and geometries.
//!
//! A [`Geometry`] is a materialised (and possibly rescaled) cost matrix
//! together with the entropic regularisation used to solve transport
//! problems on it. Measures enter either as raw point clouds paired with a
//! [`CostFn`], or as precomputed cost matrices; [`Support`] tags the two and
//! [`build_geometry`] turns either into a geometry.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Relative epsilon used when a problem leaves the regularisation unset.
pub const DEFAULT_RELATIVE_EPSILON: f64 = 0.05;

const MIN_EPSILON: f64 = 1e-6;

/// Pairwise ground cost between points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CostFn {
    /// `‖x − y‖²`.
    #[default]
    SqEuclidean,
    /// `‖x − y‖`.
    Euclidean,
}

impl CostFn {
    /// Cost between two points of equal dimension.
    pub fn pairwise(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        debug_assert_eq!(x.len(), y.len());
        let sq: f64 = x.iter().zip(y.iter()).map(|(&a, &b)| (a - b) * (a - b)).sum();
        match self {
            CostFn::SqEuclidean => sq,
            CostFn::Euclidean => sq.sqrt(),
        }
    }

    /// Cost matrix `C[i, j] = cost(x_i, y_j)` of shape `(m, n)`.
    pub fn cost_matrix(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != y.ncols() {
            return Err(Error::LengthMismatch(x.ncols(), y.ncols()));
        }
        let mut cost = Array2::zeros((x.nrows(), y.nrows()));
        for (i, xi) in x.outer_iter().enumerate() {
            for (j, yj) in y.outer_iter().enumerate() {
                cost[[i, j]] = self.pairwise(xi, yj);
            }
        }
        Ok(cost)
    }

    /// Point minimising `Σ_j w_j cost(z, x_j)` for weights that sum to one.
    ///
    /// For the squared Euclidean cost this is `Σ_j w_j x_j`. The weights are
    /// not renormalised: an all-zero weight row maps to the origin.
    pub fn barycenter(&self, weights: ArrayView1<f64>, xs: ArrayView2<f64>) -> Result<Array1<f64>> {
        if weights.len() != xs.nrows() {
            return Err(Error::LengthMismatch(xs.nrows(), weights.len()));
        }
        match self {
            CostFn::SqEuclidean => Ok(weights.dot(&xs)),
            CostFn::Euclidean => Err(Error::NotImplemented("barycenter for the Euclidean cost")),
        }
    }
}

/// Rescaling applied to a cost matrix before it is used.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum ScaleCost {
    /// Leave the cost untouched.
    #[default]
    Unit,
    /// Divide by a fixed factor.
    Factor(f64),
    /// Divide by the mean entry.
    Mean,
    /// Divide by the largest entry.
    MaxCost,
}

impl ScaleCost {
    fn apply(&self, cost: &mut Array2<f64>) {
        let scale = match self {
            ScaleCost::Unit => return,
            ScaleCost::Factor(f) => *f,
            ScaleCost::Mean => cost.mean().unwrap_or(0.0),
            ScaleCost::MaxCost => cost.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        if scale.is_finite() && scale != 0.0 {
            cost.mapv_inplace(|c| c / scale);
        }
    }
}

/// One measure's support, as seen by [`build_geometry`].
#[derive(Debug, Clone, Copy)]
pub enum Support<'a> {
    /// Raw coordinates `[n, d]`, compared with `cost_fn`.
    PointCloud {
        points: ArrayView2<'a, f64>,
        cost_fn: CostFn,
    },
    /// A precomputed `[n, n]` cost matrix.
    CostMatrix(ArrayView2<'a, f64>),
}

/// A cost matrix plus its entropic regularisation.
#[derive(Debug, Clone)]
pub struct Geometry {
    cost: Array2<f64>,
    epsilon: f64,
}

/// Build the geometry of a single measure's support.
pub fn build_geometry(
    support: Support<'_>,
    epsilon: Option<f64>,
    scale_cost: ScaleCost,
) -> Result<Geometry> {
    let cost = match support {
        Support::PointCloud { points, cost_fn } => cost_fn.cost_matrix(points, points)?,
        Support::CostMatrix(matrix) => {
            if matrix.nrows() != matrix.ncols() {
                return Err(Error::CostShapeMismatch(
                    matrix.nrows(),
                    matrix.nrows(),
                    matrix.nrows(),
                    matrix.ncols(),
                ));
            }
            matrix.to_owned()
        }
    };
    Geometry::from_cost(cost, epsilon, scale_cost)
}

impl Geometry {
    /// Wrap an explicit cost matrix.
    pub fn from_cost(
        mut cost: Array2<f64>,
        epsilon: Option<f64>,
        scale_cost: ScaleCost,
    ) -> Result<Self> {
        scale_cost.apply(&mut cost);
        let epsilon = match epsilon {
            Some(eps) => {
                if eps <= 0.0 || !eps.is_finite() {
                    return Err(Error::InvalidRegularization(eps));
                }
                eps
            }
            None => (DEFAULT_RELATIVE_EPSILON * cost.mean().unwrap_or(0.0)).max(MIN_EPSILON),
        };
        Ok(Self { cost, epsilon })
    }

    /// Cross geometry between two point clouds, `C[i, j] = cost(x_i, y_j)`.
    pub fn pair(
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        cost_fn: CostFn,
        epsilon: Option<f64>,
        scale_cost: ScaleCost,
    ) -> Result<Self> {
        Self::from_cost(cost_fn.cost_matrix(x, y)?, epsilon, scale_cost)
    }

    pub fn cost_matrix(&self) -> &Array2<f64> {
        &self.cost
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn shape(&self) -> (usize, usize) {
        self.cost.dim()
    }

    /// Apply the (optionally transformed) cost to `arr`.
    ///
    /// `axis = Axis(0)` computes `f(C)ᵀ · arr`, `Axis(1)` computes `f(C) · arr`.
    /// Zero entries of `arr` are skipped so that padded slots, whose
    /// transformed cost may be infinite, contribute nothing.
    pub fn apply_cost(
        &self,
        arr: ArrayView2<f64>,
        axis: Axis,
        transform: Option<fn(f64) -> f64>,
    ) -> Result<Array2<f64>> {
        let cost = match transform {
            Some(f) => self.cost.mapv(f),
            None => self.cost.clone(),
        };
        let lhs = if axis == Axis(0) { cost.t() } else { cost.view() };
        if lhs.ncols() != arr.nrows() {
            return Err(Error::CostShapeMismatch(
                lhs.nrows(),
                arr.nrows(),
                lhs.nrows(),
                lhs.ncols(),
            ));
        }
        Ok(masked_dot(lhs, arr))
    }
}

/// Matrix product `lhs · rhs` that ignores terms whose `rhs` factor is zero.
pub(crate) fn masked_dot(lhs: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Array2<f64> {
    let (m, inner) = lhs.dim();
    let n = rhs.ncols();
    let mut out = Array2::zeros((m, n));
    for k in 0..inner {
        for j in 0..n {
            let r = rhs[[k, j]];
            if r == 0.0 {
                continue;
            }
            for i in 0..m {
                out[[i, j]] += lhs[[i, k]] * r;
            }
        }
    }
    out
}

/// Same as [`masked_dot`] but skips zero factors on the left.
pub(crate) fn masked_dot_left(lhs: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Array2<f64> {
    masked_dot(rhs.t(), lhs.t()).reversed_axes()
}

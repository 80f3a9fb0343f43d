//! Entropic (fused) Gromov-Wasserstein optimal transport.
//!
//! Matches two metric-measure spaces `(X, Cx, a)` and `(Y, Cy, b)` by a plan
//! `P` minimising the distortion between their structures, optionally fused
//! with a linear feature term:
//!
//! ```text
//! min_P  Σ_{ijkl} L(Cx[i,k], Cy[j,l]) P[i,j] P[k,l]  +  λ <Cxy, P>  +  ε KL(P | a ⊗ b)
//! ```
//!
//! The objective is minimised by repeated linearisation: at the current plan
//! the quadratic term has gradient
//! `f1(Cx) a 1ᵀ + 1 (f2(Cy) b)ᵀ − h1(Cx) P h2(Cy)ᵀ` (see [`GwLoss`]), and each
//! linearised problem is solved with [`Sinkhorn`].
//!
//! Entries with zero marginal mass are removed before solving and come back
//! as exact zeros in the plan, so padded measures can be passed directly.

use crate::geometry::{masked_dot_left, Geometry, ScaleCost};
use crate::loss::GwLoss;
use crate::sinkhorn::{LinearProblem, Sinkhorn, SinkhornConfig};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Configuration for [`GromovWasserstein`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GromovConfig {
    /// Linearisations always performed before the cost delta is checked.
    pub min_iterations: usize,
    /// Hard cap on linearisations.
    pub max_iterations: usize,
    /// Stop once consecutive regularised costs differ by less than this.
    pub threshold: f64,
    /// Solver for each linearised problem.
    pub sinkhorn: SinkhornConfig,
    /// Low-rank factorisation of the plan. Not supported.
    pub rank: Option<usize>,
}

impl Default for GromovConfig {
    fn default() -> Self {
        Self {
            min_iterations: 5,
            max_iterations: 50,
            threshold: 1e-3,
            sinkhorn: SinkhornConfig::default(),
            rank: None,
        }
    }
}

impl GromovConfig {
    pub fn with_min_iterations(mut self, n: usize) -> Self {
        self.min_iterations = n;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_sinkhorn(mut self, sinkhorn: SinkhornConfig) -> Self {
        self.sinkhorn = sinkhorn;
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn is_low_rank(&self) -> bool {
        self.rank.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_low_rank() {
            return Err(Error::NotImplemented("low-rank Gromov-Wasserstein"));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("gromov max_iterations must be >= 1"));
        }
        if !(self.threshold > 0.0) || !self.threshold.is_finite() {
            return Err(Error::Config("gromov threshold must be positive and finite"));
        }
        self.sinkhorn.validate()
    }
}

/// A quadratic OT problem between two geometries, optionally fused.
#[derive(Debug, Clone, Copy)]
pub struct QuadraticProblem<'a> {
    /// Structure of the source space, `(m, m)`.
    pub geom_xx: &'a Geometry,
    /// Structure of the target space, `(n, n)`.
    pub geom_yy: &'a Geometry,
    /// Feature cost between the two spaces, `(m, n)`. Present iff fused.
    pub geom_xy: Option<&'a Geometry>,
    pub a: ArrayView1<'a, f64>,
    pub b: ArrayView1<'a, f64>,
    /// Multiplier `λ` of the linear term.
    pub fused_penalty: f64,
    pub loss: GwLoss,
}

impl<'a> QuadraticProblem<'a> {
    pub fn new(
        geom_xx: &'a Geometry,
        geom_yy: &'a Geometry,
        a: ArrayView1<'a, f64>,
        b: ArrayView1<'a, f64>,
    ) -> Self {
        Self {
            geom_xx,
            geom_yy,
            geom_xy: None,
            a,
            b,
            fused_penalty: 1.0,
            loss: GwLoss::SqEuclidean,
        }
    }

    pub fn with_fused(mut self, geom_xy: &'a Geometry, fused_penalty: f64) -> Self {
        self.geom_xy = Some(geom_xy);
        self.fused_penalty = fused_penalty;
        self
    }

    pub fn with_loss(mut self, loss: GwLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn is_fused(&self) -> bool {
        self.geom_xy.is_some()
    }
}

/// Result of a GW solve.
#[derive(Debug, Clone)]
pub struct GwOutput {
    /// Transport plan `(m, n)`.
    pub plan: Array2<f64>,
    /// Regularised cost of the last linearised problem.
    pub reg_gw_cost: f64,
    /// Cost delta fell below threshold and the last Sinkhorn solve converged.
    pub converged: bool,
    /// Sinkhorn marginal errors, `[max_iterations, sinkhorn outer iterations]`,
    /// `-1` where nothing ran.
    pub errors: Array2<f64>,
    /// Linearisations performed.
    pub iterations: usize,
}

/// Entropic Gromov-Wasserstein solver.
#[derive(Debug, Clone)]
pub struct GromovWasserstein {
    config: GromovConfig,
    linear: Sinkhorn,
}

impl GromovWasserstein {
    pub fn new(config: GromovConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            linear: Sinkhorn::new(config.sinkhorn),
        })
    }

    pub fn config(&self) -> &GromovConfig {
        &self.config
    }

    /// The inner linear solver, also used for warm starts.
    pub fn linear_solver(&self) -> &Sinkhorn {
        &self.linear
    }

    pub fn solve(&self, problem: &QuadraticProblem<'_>) -> Result<GwOutput> {
        let cx = problem.geom_xx.cost_matrix();
        let cy = problem.geom_yy.cost_matrix();
        let m = problem.a.len();
        let n = problem.b.len();

        if cx.nrows() != cx.ncols() || cx.nrows() != m {
            return Err(Error::CostShapeMismatch(m, m, cx.nrows(), cx.ncols()));
        }
        if cy.nrows() != cy.ncols() || cy.nrows() != n {
            return Err(Error::CostShapeMismatch(n, n, cy.nrows(), cy.ncols()));
        }
        if let Some(gxy) = problem.geom_xy {
            let (r, c) = gxy.shape();
            if r != m || c != n {
                return Err(Error::CostShapeMismatch(m, n, r, c));
            }
        }
        if problem.a.iter().any(|&x| x < 0.0) || problem.b.iter().any(|&x| x < 0.0) {
            return Err(Error::Domain("gromov-wasserstein requires nonnegative masses"));
        }
        let a_sum = problem.a.sum();
        let b_sum = problem.b.sum();
        if a_sum <= 0.0 || b_sum <= 0.0 {
            return Err(Error::Domain("gromov-wasserstein requires positive total mass"));
        }

        // Restrict everything to the supports of a and b.
        let rows: Vec<usize> = (0..m).filter(|&i| problem.a[i] > 0.0).collect();
        let cols: Vec<usize> = (0..n).filter(|&j| problem.b[j] > 0.0).collect();
        let a = problem.a.select(Axis(0), &rows).mapv(|x| x / a_sum);
        let b = problem.b.select(Axis(0), &cols).mapv(|x| x / b_sum);
        let cx = cx.select(Axis(0), &rows).select(Axis(1), &rows);
        let cy = cy.select(Axis(0), &cols).select(Axis(1), &cols);
        let fused = problem
            .geom_xy
            .map(|g| g.cost_matrix().select(Axis(0), &rows).select(Axis(1), &cols) * problem.fused_penalty);

        let loss = problem.loss;
        let marginal_x: Array1<f64> = cx.mapv(|v| loss.f1(v)).dot(&a);
        let marginal_y: Array1<f64> = cy.mapv(|v| loss.f2(v)).dot(&b);
        let h1x = cx.mapv(|v| loss.h1(v));
        let h2y_t = cy.mapv(|v| loss.h2(v)).reversed_axes();

        let epsilon = problem.geom_xx.epsilon();
        let mut plan = outer(&a, &b);
        let mut errors = Array2::from_elem(
            (self.config.max_iterations, self.config.sinkhorn.outer_iterations()),
            -1.0,
        );
        let mut prev_cost: Option<f64> = None;
        let mut reg_gw_cost = f64::NAN;
        let mut cost_converged = false;
        let mut linear_converged = false;
        let mut iterations = 0;

        for it in 0..self.config.max_iterations {
            // Gradient of the quadratic term at the current plan.
            let cross = h1x.dot(&masked_dot_left(plan.view(), h2y_t.view()));
            let mut linearized = Array2::zeros(cross.dim());
            for ((i, j), v) in linearized.indexed_iter_mut() {
                *v = marginal_x[i] + marginal_y[j] - cross[[i, j]];
            }
            if let Some(f) = &fused {
                linearized += f;
            }

            let geom = Geometry::from_cost(linearized, Some(epsilon), ScaleCost::Unit)?;
            let out = self.linear.solve(&LinearProblem::new(&geom, a.view(), b.view()))?;
            errors.row_mut(it).assign(&out.errors);

            plan = out.plan;
            reg_gw_cost = out.reg_ot_cost;
            linear_converged = out.converged;
            iterations = it + 1;

            if let Some(prev) = prev_cost {
                if iterations >= self.config.min_iterations
                    && (reg_gw_cost - prev).abs() < self.config.threshold
                {
                    cost_converged = true;
                    break;
                }
            }
            prev_cost = Some(reg_gw_cost);
        }

        let mut full = Array2::zeros((m, n));
        for (si, &i) in rows.iter().enumerate() {
            for (sj, &j) in cols.iter().enumerate() {
                full[[i, j]] = plan[[si, sj]];
            }
        }

        let converged = cost_converged && linear_converged;
        trace!(m, n, iterations, reg_gw_cost, converged, "gromov-wasserstein solve finished");

        Ok(GwOutput {
            plan: full,
            reg_gw_cost,
            converged,
            errors,
            iterations,
        })
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn geom(c: Array2<f64>) -> Geometry {
        Geometry::from_cost(c, Some(0.05), ScaleCost::Unit).unwrap()
    }

    fn solver() -> GromovWasserstein {
        GromovWasserstein::new(GromovConfig::default()).unwrap()
    }

    #[test]
    fn gw_identical_spaces_low_cost() {
        let c = geom(array![[0.0, 1.0], [1.0, 0.0]]);
        let p = array![0.5, 0.5];
        let out = solver().solve(&QuadraticProblem::new(&c, &c, p.view(), p.view())).unwrap();
        assert!(out.reg_gw_cost < 1.0, "cost={}", out.reg_gw_cost);
        let sum: f64 = out.plan.iter().sum();
        assert!((sum - 1.0).abs() < 0.05, "plan should sum to ~1: sum={}", sum);
    }

    #[test]
    fn gw_prefers_isometric_space() {
        let c1 = array![[0.0, 1.0, 3.0], [1.0, 0.0, 2.0], [3.0, 2.0, 0.0]];
        let g1 = geom(c1.clone());
        let g3 = geom(c1 * 3.0);
        let p = Array1::from_elem(3, 1.0 / 3.0);
        let same = solver().solve(&QuadraticProblem::new(&g1, &g1, p.view(), p.view())).unwrap();
        let scaled = solver().solve(&QuadraticProblem::new(&g1, &g3, p.view(), p.view())).unwrap();
        assert!(same.reg_gw_cost < scaled.reg_gw_cost);
    }

    #[test]
    fn gw_plan_has_correct_shape_and_error_trace() {
        let c1 = geom(array![[0.0, 1.0, 2.0], [1.0, 0.0, 1.0], [2.0, 1.0, 0.0]]);
        let c2 = geom(array![[0.0, 3.0], [3.0, 0.0]]);
        let p = array![0.33, 0.34, 0.33];
        let q = array![0.5, 0.5];
        let out = solver().solve(&QuadraticProblem::new(&c1, &c2, p.view(), q.view())).unwrap();
        assert_eq!(out.plan.shape(), &[3, 2]);
        assert_eq!(out.errors.shape(), &[50, SinkhornConfig::default().outer_iterations()]);
        assert!(out.errors[[0, 0]] >= 0.0);
        if out.iterations < 50 {
            assert_eq!(out.errors[[out.iterations, 0]], -1.0);
        }
    }

    #[test]
    fn fused_term_breaks_structural_symmetry() {
        let c = geom(array![[0.0, 1.0], [1.0, 0.0]]);
        let fx = array![[0.0], [1.0]];
        let fy = array![[1.0], [0.0]];
        let gxy = Geometry::pair(
            fx.view(),
            fy.view(),
            crate::geometry::CostFn::SqEuclidean,
            Some(0.05),
            ScaleCost::Unit,
        )
        .unwrap();
        let p = array![0.5, 0.5];
        let problem = QuadraticProblem::new(&c, &c, p.view(), p.view()).with_fused(&gxy, 1.0);
        let out = solver().solve(&problem).unwrap();
        assert!(out.plan[[0, 1]] > out.plan[[0, 0]]);
        assert!(out.plan[[1, 0]] > out.plan[[1, 1]]);
    }

    #[test]
    fn zero_mass_slots_get_zero_plan_entries() {
        let cx = geom(array![[0.0, 1.0], [1.0, 0.0]]);
        let cy = geom(array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        let a = array![0.5, 0.5];
        let b = array![0.5, 0.5, 0.0];
        let out = solver().solve(&QuadraticProblem::new(&cx, &cy, a.view(), b.view())).unwrap();
        assert_eq!(out.plan.column(2).sum(), 0.0);
        assert!((out.plan.sum() - 1.0).abs() < 1e-2);
    }

    #[test]
    fn kl_loss_runs_on_positive_structures() {
        let cx = geom(array![[1.0, 2.0], [2.0, 1.0]]);
        let cy = geom(array![[1.0, 2.5], [2.5, 1.0]]);
        let p = array![0.5, 0.5];
        let problem = QuadraticProblem::new(&cx, &cy, p.view(), p.view()).with_loss(GwLoss::Kl);
        let out = solver().solve(&problem).unwrap();
        assert!(out.reg_gw_cost.is_finite());
        assert!(out.plan.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn kl_loss_tolerates_zero_diagonals() {
        let cx = geom(array![[0.0, 1.0, 2.0], [1.0, 0.0, 1.0], [2.0, 1.0, 0.0]]);
        let cy = geom(array![[0.0, 0.5, 1.0], [0.5, 0.0, 0.5], [1.0, 0.5, 0.0]]);
        let p = Array1::from_elem(3, 1.0 / 3.0);
        let problem = QuadraticProblem::new(&cx, &cy, p.view(), p.view()).with_loss(GwLoss::Kl);
        let out = solver().solve(&problem).unwrap();
        assert!(out.reg_gw_cost.is_finite());
        assert!(out.plan.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn gw_rejects_non_square_cost() {
        let c1 = geom(array![[0.0, 1.0, 2.0], [1.0, 0.0, 1.0]]);
        let c2 = geom(array![[0.0, 1.0], [1.0, 0.0]]);
        let p = array![0.5, 0.5];
        assert!(solver().solve(&QuadraticProblem::new(&c1, &c2, p.view(), p.view())).is_err());
    }

    #[test]
    fn gw_rejects_length_mismatch() {
        let c = geom(array![[0.0, 1.0], [1.0, 0.0]]);
        let p = array![0.5, 0.5];
        let q_bad = array![0.33, 0.34, 0.33];
        assert!(solver().solve(&QuadraticProblem::new(&c, &c, p.view(), q_bad.view())).is_err());
    }

    #[test]
    fn low_rank_is_rejected_at_construction() {
        let err = GromovWasserstein::new(GromovConfig::default().with_rank(2)).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }
}

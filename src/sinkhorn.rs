//! Log-domain Sinkhorn for entropic linear optimal transport.
//!
//! Solves
//!
//! ```text
//! min_P <C, P> + ε KL(P | a ⊗ b)   s.t.  P 1 = a,  Pᵀ 1 = b,  P ≥ 0
//! ```
//!
//! with dual potentials updated in log-space. Zero-mass entries of `a` or
//! `b` are hard support exclusions: their rows/columns of the plan are
//! exactly zero. This is what makes padded batches safe to solve.
//!
//! Running out of iterations is not an error here. The output carries a
//! `converged` flag and the marginal error recorded at every check, and
//! the caller decides what to do with an unconverged plan.

use crate::geometry::Geometry;
use crate::{logsumexp_by, Error, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Configuration for [`Sinkhorn`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SinkhornConfig {
    /// Hard cap on potential updates.
    pub max_iterations: usize,
    /// Updates between two marginal-error checks.
    pub inner_iterations: usize,
    /// Stop once the max marginal error drops below this.
    pub threshold: f64,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2_000,
            inner_iterations: 10,
            threshold: 1e-3,
        }
    }
}

impl SinkhornConfig {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_inner_iterations(mut self, n: usize) -> Self {
        self.inner_iterations = n;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Number of marginal-error checks, i.e. the length of
    /// [`SinkhornOutput::errors`].
    pub fn outer_iterations(&self) -> usize {
        self.max_iterations.div_ceil(self.inner_iterations.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 || self.inner_iterations == 0 {
            return Err(Error::Config("sinkhorn iteration counts must be >= 1"));
        }
        if !(self.threshold > 0.0) || !self.threshold.is_finite() {
            return Err(Error::Config("sinkhorn threshold must be positive and finite"));
        }
        Ok(())
    }
}

/// A linear OT problem: one geometry and its two marginals.
#[derive(Debug, Clone, Copy)]
pub struct LinearProblem<'a> {
    pub geom: &'a Geometry,
    pub a: ArrayView1<'a, f64>,
    pub b: ArrayView1<'a, f64>,
}

impl<'a> LinearProblem<'a> {
    pub fn new(geom: &'a Geometry, a: ArrayView1<'a, f64>, b: ArrayView1<'a, f64>) -> Self {
        Self { geom, a, b }
    }
}

/// Result of a Sinkhorn solve.
#[derive(Debug, Clone)]
pub struct SinkhornOutput {
    /// Transport plan `(m, n)`.
    pub plan: Array2<f64>,
    /// `<C, P> + ε KL(P | a ⊗ b)` at the returned plan.
    pub reg_ot_cost: f64,
    pub converged: bool,
    /// Max marginal error at each check, `-1` where no check ran.
    pub errors: Array1<f64>,
    /// Potential updates actually performed.
    pub iterations: usize,
}

/// Entropic linear OT solver.
#[derive(Debug, Clone, Default)]
pub struct Sinkhorn {
    config: SinkhornConfig,
}

impl Sinkhorn {
    pub fn new(config: SinkhornConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SinkhornConfig {
        &self.config
    }

    pub fn solve(&self, problem: &LinearProblem<'_>) -> Result<SinkhornOutput> {
        self.config.validate()?;
        let cost = problem.geom.cost_matrix();
        let reg = problem.geom.epsilon();
        let (a, b) = (problem.a, problem.b);
        let m = a.len();
        let n = b.len();
        if cost.nrows() != m || cost.ncols() != n {
            return Err(Error::CostShapeMismatch(m, n, cost.nrows(), cost.ncols()));
        }
        if a.iter().any(|&x| x < 0.0) || b.iter().any(|&x| x < 0.0) {
            return Err(Error::Domain("sinkhorn requires nonnegative masses"));
        }
        let a_sum = a.sum();
        let b_sum = b.sum();
        if a_sum <= 0.0 || b_sum <= 0.0 {
            return Err(Error::Domain("sinkhorn requires positive total mass"));
        }
        let a = a.mapv(|x| x / a_sum);
        let b = b.mapv(|x| x / b_sum);

        let log_a = a.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() });
        let log_b = b.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() });

        let mut f: Array1<f64> = Array1::zeros(m);
        let mut g: Array1<f64> = Array1::zeros(n);

        let inner = self.config.inner_iterations;
        let max_iter = self.config.max_iterations;
        let mut errors = Array1::from_elem(self.config.outer_iterations(), -1.0);
        let mut check = 0usize;
        let mut converged = false;
        let mut iterations = max_iter;

        for iter in 0..max_iter {
            for i in 0..m {
                let lse = logsumexp_by(n, |j| (g[j] - cost[[i, j]]) / reg);
                f[i] = reg * (log_a[i] - lse);
            }
            for j in 0..n {
                let lse = logsumexp_by(m, |i| (f[i] - cost[[i, j]]) / reg);
                g[j] = reg * (log_b[j] - lse);
            }

            if (iter + 1) % inner == 0 || iter + 1 == max_iter {
                // Columns match b exactly after the g-update; rows carry the error.
                let mut max_err = 0.0f64;
                for i in 0..m {
                    if log_a[i] == f64::NEG_INFINITY {
                        continue;
                    }
                    let lse = logsumexp_by(n, |j| (f[i] + g[j] - cost[[i, j]]) / reg);
                    max_err = max_err.max((lse.exp() - a[i]).abs());
                }
                errors[check] = max_err;
                check += 1;
                if max_err < self.config.threshold {
                    converged = true;
                    iterations = iter + 1;
                    break;
                }
            }
        }

        let mut plan = Array2::zeros((m, n));
        let mut transport = 0.0;
        let mut entropy = 0.0;
        for i in 0..m {
            for j in 0..n {
                let log_p = (f[i] + g[j] - cost[[i, j]]) / reg;
                let pij = log_p.exp();
                if pij <= 0.0 {
                    continue;
                }
                plan[[i, j]] = pij;
                transport += pij * cost[[i, j]];
                entropy += pij * (log_p - log_a[i] - log_b[j]);
            }
        }

        trace!(m, n, iterations, converged, "sinkhorn solve finished");

        Ok(SinkhornOutput {
            plan,
            reg_ot_cost: transport + reg * entropy,
            converged,
            errors,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScaleCost;
    use ndarray::array;

    fn line_geom(m: usize, n: usize, eps: f64) -> Geometry {
        let mut c = Array2::zeros((m, n));
        for i in 0..m {
            for j in 0..n {
                c[[i, j]] = (i as f64 - j as f64).abs();
            }
        }
        Geometry::from_cost(c, Some(eps), ScaleCost::Unit).unwrap()
    }

    #[test]
    fn plan_matches_marginals() {
        let geom = line_geom(3, 3, 0.1);
        let a = array![0.2, 0.3, 0.5];
        let b = array![0.5, 0.4, 0.1];
        let out = Sinkhorn::default()
            .solve(&LinearProblem::new(&geom, a.view(), b.view()))
            .unwrap();
        assert!(out.converged);
        for i in 0..3 {
            assert!((out.plan.row(i).sum() - a[i]).abs() < 2e-3);
            assert!((out.plan.column(i).sum() - b[i]).abs() < 1e-6);
        }
        assert!(out.errors[0] >= 0.0);
    }

    #[test]
    fn identity_transport_is_cheap() {
        let geom = line_geom(2, 2, 0.05);
        let a = array![0.5, 0.5];
        let out = Sinkhorn::default()
            .solve(&LinearProblem::new(&geom, a.view(), a.view()))
            .unwrap();
        assert!(out.plan[[0, 0]] > 0.49);
        assert!(out.reg_ot_cost < 0.1);
    }

    #[test]
    fn exhausted_budget_is_reported_not_raised() {
        let geom = line_geom(4, 4, 0.01);
        let a = array![0.7, 0.1, 0.1, 0.1];
        let b = array![0.1, 0.1, 0.1, 0.7];
        let cfg = SinkhornConfig::default()
            .with_max_iterations(3)
            .with_inner_iterations(1)
            .with_threshold(1e-12);
        let out = Sinkhorn::new(cfg)
            .solve(&LinearProblem::new(&geom, a.view(), b.view()))
            .unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 3);
        assert_eq!(out.errors.len(), 3);
        assert!(out.errors.iter().all(|&e| e >= 0.0));
    }

    #[test]
    fn unfilled_error_slots_keep_sentinel() {
        let geom = line_geom(2, 2, 0.5);
        let a = array![0.5, 0.5];
        let cfg = SinkhornConfig::default().with_max_iterations(100).with_inner_iterations(10);
        let out = Sinkhorn::new(cfg)
            .solve(&LinearProblem::new(&geom, a.view(), a.view()))
            .unwrap();
        assert!(out.converged);
        assert_eq!(out.errors.len(), 10);
        assert_eq!(out.errors[9], -1.0);
    }

    #[test]
    fn rejects_shape_mismatch_and_empty_mass() {
        let geom = line_geom(2, 3, 0.1);
        let a = array![0.5, 0.5];
        let b = array![0.5, 0.5];
        assert!(matches!(
            Sinkhorn::default().solve(&LinearProblem::new(&geom, a.view(), b.view())),
            Err(Error::CostShapeMismatch(..))
        ));
        let geom = line_geom(2, 2, 0.1);
        let z = array![0.0, 0.0];
        assert!(Sinkhorn::default()
            .solve(&LinearProblem::new(&geom, a.view(), z.view()))
            .is_err());
    }

    #[test]
    fn outer_iterations_rounds_up() {
        let cfg = SinkhornConfig::default().with_max_iterations(25).with_inner_iterations(10);
        assert_eq!(cfg.outer_iterations(), 3);
    }
}

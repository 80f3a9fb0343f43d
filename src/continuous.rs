//! Free-support Wasserstein barycenters of point clouds.
//!
//! The barycenter is `k` points `X` with fixed weights `a`. Each outer
//! iteration solves one entropic OT problem per measure between `(X, a)`
//! and `(Y_i, b_i)`, then moves every barycenter point to the mixing-weighted
//! average of its barycentric projections.

use crate::fixed_point::{self, fixpoint_iter, Status};
use crate::geometry::{Geometry, ScaleCost};
use crate::gw_problem::barycentric_projection;
use crate::gw_solver::barycenter_weights;
use crate::parts::Parts;
use crate::problem::BarycenterProblem;
use crate::sinkhorn::{LinearProblem, Sinkhorn, SinkhornConfig, SinkhornOutput};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for [`WassersteinBarycenter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WassersteinBarycenterConfig {
    pub min_iterations: usize,
    pub max_iterations: usize,
    pub threshold: f64,
    pub store_inner_errors: bool,
    pub sinkhorn: SinkhornConfig,
}

impl Default for WassersteinBarycenterConfig {
    fn default() -> Self {
        Self {
            min_iterations: 5,
            max_iterations: 50,
            threshold: 1e-3,
            store_inner_errors: false,
            sinkhorn: SinkhornConfig::default(),
        }
    }
}

impl WassersteinBarycenterConfig {
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

    pub fn with_store_inner_errors(mut self, store: bool) -> Self {
        self.store_inner_errors = store;
        self
    }

    pub fn with_sinkhorn(mut self, sinkhorn: SinkhornConfig) -> Self {
        self.sinkhorn = sinkhorn;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("barycenter max_iterations must be >= 1"));
        }
        if self.min_iterations > self.max_iterations {
            return Err(Error::Config("barycenter min_iterations exceeds max_iterations"));
        }
        if !(self.threshold > 0.0) || !self.threshold.is_finite() {
            return Err(Error::Config("barycenter threshold must be positive and finite"));
        }
        self.sinkhorn.validate()
    }
}

/// Starting support of a free-support barycenter.
#[derive(Debug, Clone, PartialEq)]
pub enum FreeInit {
    /// `k` distinct input points drawn proportionally to their mass.
    Size(usize),
    /// Explicit `[k, D]` points.
    Points(Array2<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WassersteinBarycenterState {
    /// Support `[k, D]`.
    pub x: Array2<f64>,
    pub a: Array1<f64>,
    /// Weighted regularised OT cost per outer iteration, `-1` unfilled.
    pub costs: Array1<f64>,
    /// `-1` unfilled, `0` some Sinkhorn solve did not converge, `1` all did.
    pub linear_convergence: Array1<i8>,
    /// `[max_iterations, M, sinkhorn outer iterations]`.
    pub errors: Option<Array3<f64>>,
}

impl WassersteinBarycenterState {
    pub fn num_iterations(&self) -> usize {
        fixed_point::filled(self.linear_convergence.view())
    }

    pub fn last_cost(&self) -> Option<f64> {
        self.num_iterations().checked_sub(1).map(|i| self.costs[i])
    }

    pub fn status(&self) -> Status {
        fixed_point::status(self.linear_convergence.view(), self.costs.view())
    }

    pub fn with_support(&self, x: Array2<f64>) -> Self {
        Self {
            x,
            ..self.clone()
        }
    }
}

impl Parts for WassersteinBarycenterState {
    #[allow(clippy::type_complexity)]
    type Data = (
        Array2<f64>,
        Array1<f64>,
        Array1<f64>,
        Array1<i8>,
        Option<Array3<f64>>,
    );
    type Config = ();

    fn to_parts(&self) -> (Self::Data, ()) {
        (
            (
                self.x.clone(),
                self.a.clone(),
                self.costs.clone(),
                self.linear_convergence.clone(),
                self.errors.clone(),
            ),
            (),
        )
    }

    fn from_parts(data: Self::Data, _config: ()) -> Self {
        let (x, a, costs, linear_convergence, errors) = data;
        Self {
            x,
            a,
            costs,
            linear_convergence,
            errors,
        }
    }
}

/// Entropic free-support Wasserstein barycenter solver.
#[derive(Debug, Clone)]
pub struct WassersteinBarycenter {
    config: WassersteinBarycenterConfig,
    sinkhorn: Sinkhorn,
}

impl WassersteinBarycenter {
    pub fn new(config: WassersteinBarycenterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sinkhorn: Sinkhorn::new(config.sinkhorn),
        })
    }

    pub fn config(&self) -> &WassersteinBarycenterConfig {
        &self.config
    }

    pub fn solve(
        &self,
        problem: &BarycenterProblem,
        init: FreeInit,
        a: Option<Array1<f64>>,
        seed: Option<u64>,
    ) -> Result<WassersteinBarycenterState> {
        let state = self.init_state(problem, init, a, seed)?;
        let state = self.run(problem, state)?;
        Ok(self.output_from_state(state))
    }

    pub fn init_state(
        &self,
        problem: &BarycenterProblem,
        init: FreeInit,
        a: Option<Array1<f64>>,
        seed: Option<u64>,
    ) -> Result<WassersteinBarycenterState> {
        check_problem(problem)?;
        let (y, b) = measures(problem)?;
        let dim = y.dim().2;
        let x = match init {
            FreeInit::Points(x) => {
                if x.nrows() == 0 || x.ncols() != dim {
                    return Err(Error::ShapeMismatch {
                        what: "initial barycenter points",
                        expected: vec![x.nrows().max(1), dim],
                        got: x.shape().to_vec(),
                    });
                }
                x
            }
            FreeInit::Size(k) => {
                let seed = seed.unwrap_or_else(rand::random);
                sample_support(problem, &y, &b, k, seed)?
            }
        };
        let a = barycenter_weights(a, x.nrows())?;

        let max_iter = self.config.max_iterations;
        let errors = self.config.store_inner_errors.then(|| {
            Array3::from_elem(
                (max_iter, b.nrows(), self.config.sinkhorn.outer_iterations()),
                -1.0,
            )
        });
        debug!(size = a.len(), dim, "initialised wasserstein barycenter");
        Ok(WassersteinBarycenterState {
            x,
            a,
            costs: Array1::from_elem(max_iter, -1.0),
            linear_convergence: Array1::from_elem(max_iter, -1),
            errors,
        })
    }

    pub fn update_state(
        &self,
        state: &WassersteinBarycenterState,
        iteration: usize,
        problem: &BarycenterProblem,
    ) -> Result<WassersteinBarycenterState> {
        if iteration >= state.costs.len() {
            return Err(Error::Domain("iteration index beyond the trace length"));
        }
        let (y, b) = measures(problem)?;
        let weights = problem.mixing_weights()?;
        let cost_fn = problem.cost_fn();
        let epsilon = problem.epsilon();
        let inv_a = state.a.mapv(|x| if x == 0.0 { 1.0 } else { 1.0 / x });

        let solved = (0..weights.len())
            .into_par_iter()
            .map(|i| -> Result<(SinkhornOutput, Array2<f64>)> {
                let points = y.index_axis(Axis(0), i);
                let geom = Geometry::pair(state.x.view(), points, cost_fn, epsilon, ScaleCost::Unit)?;
                let out = self
                    .sinkhorn
                    .solve(&LinearProblem::new(&geom, state.a.view(), b.row(i)))?;
                let rescaled = &out.plan * &inv_a.view().insert_axis(Axis(1));
                let proj = barycentric_projection(rescaled.view(), points, cost_fn)?;
                Ok((out, proj * weights[i]))
            })
            .collect::<Result<Vec<_>>>()?;

        let cost: f64 = solved
            .iter()
            .zip(weights.iter())
            .map(|((o, _), w)| w * o.reg_ot_cost)
            .sum();
        let converged = solved.iter().all(|(o, _)| o.converged);
        let mut x = Array2::zeros(state.x.dim());
        for (_, proj) in &solved {
            x += proj;
        }

        let mut costs = state.costs.clone();
        costs[iteration] = cost;
        let mut linear_convergence = state.linear_convergence.clone();
        linear_convergence[iteration] = i8::from(converged);
        let errors = state.errors.as_ref().map(|e| {
            let mut e = e.clone();
            for (i, (o, _)) in solved.iter().enumerate() {
                e.slice_mut(s![iteration, i, ..]).assign(&o.errors);
            }
            e
        });

        debug!(iteration, cost, converged, "wasserstein barycenter iteration");
        Ok(WassersteinBarycenterState {
            x,
            a: state.a.clone(),
            costs,
            linear_convergence,
            errors,
        })
    }

    pub fn output_from_state(&self, state: WassersteinBarycenterState) -> WassersteinBarycenterState {
        state
    }

    pub fn run(
        &self,
        problem: &BarycenterProblem,
        state: WassersteinBarycenterState,
    ) -> Result<WassersteinBarycenterState> {
        check_problem(problem)?;
        let threshold = self.config.threshold;
        let out = fixpoint_iter(
            |iteration, _: &BarycenterProblem, state: &WassersteinBarycenterState| {
                fixed_point::keep_iterating(
                    iteration,
                    state.costs.view(),
                    state.linear_convergence.view(),
                    threshold,
                )
            },
            |iteration, problem, state, _| self.update_state(&state, iteration, problem),
            self.config.min_iterations,
            self.config.max_iterations,
            1,
            problem,
            state,
        )?;
        debug!(
            iterations = out.num_iterations(),
            cost = ?out.last_cost(),
            status = ?out.status(),
            "wasserstein barycenter finished"
        );
        if out.status() == Status::Diverged {
            warn!(iterations = out.num_iterations(), "wasserstein barycenter cost is not finite");
        }
        Ok(out)
    }
}

fn check_problem(problem: &BarycenterProblem) -> Result<()> {
    if problem.is_debiased() {
        return Err(Error::NotImplemented("debiased free-support barycenter"));
    }
    if problem.num_measures() == 0 {
        return Err(Error::MissingMeasures);
    }
    Ok(())
}

fn measures(problem: &BarycenterProblem) -> Result<(Array3<f64>, Array2<f64>)> {
    match problem.segmented_measures()? {
        (Some(y), Some(b)) => Ok((y, b)),
        _ => Err(Error::MissingMeasures),
    }
}

/// `k` distinct points of the pooled support, drawn by mixed mass.
fn sample_support(
    problem: &BarycenterProblem,
    y: &Array3<f64>,
    b: &Array2<f64>,
    k: usize,
    seed: u64,
) -> Result<Array2<f64>> {
    let weights = problem.mixing_weights()?;
    let pool: Vec<((usize, usize), f64)> = b
        .indexed_iter()
        .filter(|(_, m)| **m > 0.0)
        .map(|((i, j), &m)| ((i, j), weights[i] * m))
        .collect();
    if k == 0 || k > pool.len() {
        return Err(Error::Domain("barycenter size must be in 1..=number of support points"));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let chosen: Vec<(usize, usize)> = pool
        .choose_multiple_weighted(&mut rng, k, |item| item.1)
        .map_err(|_| Error::Domain("invalid support weights for sampling"))?
        .map(|item| item.0)
        .collect();

    let mut x = Array2::zeros((k, y.dim().2));
    for (mut row, (i, j)) in x.outer_iter_mut().zip(chosen) {
        row.assign(&y.slice(s![i, j, ..]));
    }
    Ok(x)
}

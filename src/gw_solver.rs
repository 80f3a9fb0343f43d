//! Fixed-point solver for (fused) Gromov-Wasserstein barycenters.
//!
//! Each outer iteration solves one entropic GW problem per measure between
//! the current barycenter structure `C` (`[k, k]`, weights `a`) and that
//! measure, then rebuilds `C` (and the fused features) from the plans with
//! [`GwBarycenterProblem::update_structure`] /
//! [`GwBarycenterProblem::update_features`]. The weights `a` stay fixed.
//!
//! # Example
//!
//! ```rust
//! use ndarray::array;
//! use wass_barycenter::{
//!     BarycenterInit, BarycenterProblem, GwBarycenterConfig, GwBarycenterProblem,
//!     GwBarycenterSolver, Segments,
//! };
//!
//! let y = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0], [2.0, 0.0], [0.0, 2.0]];
//! let problem = GwBarycenterProblem::from_point_clouds(
//!     BarycenterProblem::segmented(y, None, Segments::from_counts(vec![3, 3])).with_epsilon(0.1),
//! );
//! let solver = GwBarycenterSolver::new(GwBarycenterConfig::default()).unwrap();
//! let state = solver.solve(&problem, BarycenterInit::Size(3), None, Some(0)).unwrap();
//! assert_eq!(state.c.dim(), (3, 3));
//! ```

use crate::fixed_point::{self, fixpoint_iter, Status};
use crate::geometry::{Geometry, ScaleCost};
use crate::gromov::{GromovConfig, GromovWasserstein, GwOutput, QuadraticProblem};
use crate::gw_problem::GwBarycenterProblem;
use crate::parts::Parts;
use crate::sinkhorn::LinearProblem;
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Uniform;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for [`GwBarycenterSolver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GwBarycenterConfig {
    pub min_iterations: usize,
    pub max_iterations: usize,
    /// Outer stop when consecutive barycenter costs differ by less.
    pub threshold: f64,
    /// Keep every inner Sinkhorn error trace in the state.
    pub store_inner_errors: bool,
    /// Solver for the per-measure GW problems.
    pub gw: GromovConfig,
}

impl Default for GwBarycenterConfig {
    fn default() -> Self {
        Self {
            min_iterations: 5,
            max_iterations: 50,
            threshold: 1e-3,
            store_inner_errors: false,
            gw: GromovConfig::default(),
        }
    }
}

impl GwBarycenterConfig {
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

    pub fn with_gw(mut self, gw: GromovConfig) -> Self {
        self.gw = gw;
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
        self.gw.validate()
    }
}

/// How to start a GW barycenter.
#[derive(Debug, Clone, PartialEq)]
pub enum BarycenterInit {
    /// Random warm start with `k` barycenter points.
    Size(usize),
    /// Given `[k, k]` structure; the problem must not be fused.
    Structure(Array2<f64>),
    /// Given `[k, k]` structure and `[k, D_f]` features for a fused problem.
    StructureWithFeatures(Array2<f64>, Array2<f64>),
}

/// Barycenter carried through the outer iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct GwBarycenterState {
    /// Structure `[k, k]`.
    pub c: Array2<f64>,
    /// Features `[k, D_f]`, fused problems only.
    pub x: Option<Array2<f64>>,
    /// Barycenter weights, fixed for the run.
    pub a: Array1<f64>,
    /// Weighted GW cost per outer iteration, `-1` where nothing ran.
    pub costs: Array1<f64>,
    /// All-inner-solves-converged flag per outer iteration: `-1` unfilled,
    /// `0` false, `1` true.
    pub gw_convergence: Array1<i8>,
    /// `[max_iterations, M, gw max_iterations, sinkhorn outer iterations]`.
    pub errors: Option<Array4<f64>>,
}

impl GwBarycenterState {
    pub fn size(&self) -> usize {
        self.a.len()
    }

    pub fn num_iterations(&self) -> usize {
        fixed_point::filled(self.gw_convergence.view())
    }

    pub fn last_cost(&self) -> Option<f64> {
        self.num_iterations().checked_sub(1).map(|i| self.costs[i])
    }

    /// Whether the last outer iteration reported convergence.
    pub fn converged(&self) -> bool {
        self.status() == Status::Converged
    }

    pub fn status(&self) -> Status {
        fixed_point::status(self.gw_convergence.view(), self.costs.view())
    }

    /// Same traces with a new support.
    pub fn with_support(&self, c: Array2<f64>, x: Option<Array2<f64>>) -> Self {
        Self {
            c,
            x,
            ..self.clone()
        }
    }
}

impl Parts for GwBarycenterState {
    #[allow(clippy::type_complexity)]
    type Data = (
        Array2<f64>,
        Option<Array2<f64>>,
        Array1<f64>,
        Array1<f64>,
        Array1<i8>,
        Option<Array4<f64>>,
    );
    type Config = ();

    fn to_parts(&self) -> (Self::Data, ()) {
        (
            (
                self.c.clone(),
                self.x.clone(),
                self.a.clone(),
                self.costs.clone(),
                self.gw_convergence.clone(),
                self.errors.clone(),
            ),
            (),
        )
    }

    fn from_parts(data: Self::Data, _config: ()) -> Self {
        let (c, x, a, costs, gw_convergence, errors) = data;
        Self {
            c,
            x,
            a,
            costs,
            gw_convergence,
            errors,
        }
    }
}

/// Entropic (fused) GW barycenter solver.
#[derive(Debug, Clone)]
pub struct GwBarycenterSolver {
    config: GwBarycenterConfig,
    gw: GromovWasserstein,
}

impl GwBarycenterSolver {
    /// Fails on invalid budgets and on a low-rank inner solver.
    pub fn new(config: GwBarycenterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            gw: GromovWasserstein::new(config.gw)?,
        })
    }

    pub fn config(&self) -> &GwBarycenterConfig {
        &self.config
    }

    /// Initialise, iterate to a fixed point, and return the final state.
    pub fn solve(
        &self,
        problem: &GwBarycenterProblem,
        init: BarycenterInit,
        a: Option<Array1<f64>>,
        seed: Option<u64>,
    ) -> Result<GwBarycenterState> {
        let state = self.init_state(problem, init, a, seed)?;
        let state = self.run(problem, state)?;
        Ok(self.output_from_state(state))
    }

    /// Build the starting barycenter.
    ///
    /// With [`BarycenterInit::Size`] every measure is first matched to the
    /// uniform barycenter weights under a random `[0, 1)` cost, and one
    /// structure/feature update turns those plans into the initial support.
    pub fn init_state(
        &self,
        problem: &GwBarycenterProblem,
        init: BarycenterInit,
        a: Option<Array1<f64>>,
        seed: Option<u64>,
    ) -> Result<GwBarycenterState> {
        check_problem(problem)?;
        let (c, x, a) = match init {
            BarycenterInit::Size(k) => {
                if k == 0 {
                    return Err(Error::Config("barycenter size must be >= 1"));
                }
                let a = barycenter_weights(a, k)?;
                let seed = seed.unwrap_or_else(rand::random);
                let plans = self.random_warm_start(problem, a.view(), seed)?;
                let c = problem.update_structure(plans.view(), a.view())?;
                let x = problem.update_features(plans.view(), a.view())?;
                (c, x, a)
            }
            BarycenterInit::Structure(c) => {
                let k = check_square(&c)?;
                if problem.is_fused() {
                    return Err(Error::MissingFeatures);
                }
                (c, None, barycenter_weights(a, k)?)
            }
            BarycenterInit::StructureWithFeatures(c, x) => {
                let k = check_square(&c)?;
                let features = problem
                    .segmented_features()?
                    .ok_or(Error::Config("features given for a problem that is not fused"))?;
                let expected = vec![k, features.dim().2];
                if x.shape() != expected.as_slice() {
                    return Err(Error::ShapeMismatch {
                        what: "initial features",
                        expected,
                        got: x.shape().to_vec(),
                    });
                }
                (c, Some(x), barycenter_weights(a, k)?)
            }
        };

        let max_iter = self.config.max_iterations;
        let errors = if self.config.store_inner_errors {
            let slots = problem.base().mixing_weights()?.len();
            Some(Array4::from_elem(
                (
                    max_iter,
                    slots,
                    self.config.gw.max_iterations,
                    self.config.gw.sinkhorn.outer_iterations(),
                ),
                -1.0,
            ))
        } else {
            None
        };
        debug!(
            size = a.len(),
            num_measures = problem.base().num_measures(),
            fused = problem.is_fused(),
            "initialised gw barycenter"
        );

        Ok(GwBarycenterState {
            c,
            x,
            a,
            costs: Array1::from_elem(max_iter, -1.0),
            gw_convergence: Array1::from_elem(max_iter, -1),
            errors,
        })
    }

    /// Entropic plans between uniform-cost barycenters and every measure.
    fn random_warm_start(
        &self,
        problem: &GwBarycenterProblem,
        a: ArrayView1<f64>,
        seed: u64,
    ) -> Result<Array3<f64>> {
        let (_, b) = problem.measures()?;
        let slots = problem.base().mixing_weights()?.len();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let keys: Vec<u64> = (0..slots).map(|_| rng.gen()).collect();
        let epsilon = problem.base().epsilon();
        let sinkhorn = self.gw.linear_solver();

        let plans = keys
            .par_iter()
            .enumerate()
            .map(|(i, &key)| -> Result<Array2<f64>> {
                let mut rng = ChaCha8Rng::seed_from_u64(key);
                let unit = Uniform::new(0.0, 1.0);
                let cost = Array2::from_shape_fn((a.len(), b.ncols()), |_| rng.sample(unit));
                let geom = Geometry::from_cost(cost, epsilon, ScaleCost::Unit)?;
                Ok(sinkhorn.solve(&LinearProblem::new(&geom, a.view(), b.row(i)))?.plan)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(stack_plans(&plans, a.len(), b.ncols()))
    }

    /// One outer iteration: a GW solve per measure, then a support update.
    pub fn update_state(
        &self,
        state: &GwBarycenterState,
        iteration: usize,
        problem: &GwBarycenterProblem,
    ) -> Result<GwBarycenterState> {
        if iteration >= state.costs.len() {
            return Err(Error::Domain("iteration index beyond the trace length"));
        }
        let (y, b) = problem.measures()?;
        let weights = problem.base().mixing_weights()?;
        let features = problem.segmented_features()?;
        let fused = match (&state.x, &features) {
            (Some(x), Some(f)) => Some((x, f)),
            (None, None) => None,
            _ => return Err(Error::MissingFeatures),
        };
        let epsilon = problem.base().epsilon();
        let scale_cost = problem.scale_cost();
        let cost_fn = problem.base().cost_fn();
        let geom_xx = Geometry::from_cost(state.c.clone(), epsilon, scale_cost)?;

        let outputs = (0..weights.len())
            .into_par_iter()
            .map(|i| -> Result<GwOutput> {
                let geom_yy = problem.measure_geometry(&y, i)?;
                let geom_xy = match fused {
                    Some((x, f)) => Some(Geometry::pair(
                        x.view(),
                        f.index_axis(Axis(0), i),
                        cost_fn,
                        epsilon,
                        scale_cost,
                    )?),
                    None => None,
                };
                let mut quad = QuadraticProblem::new(&geom_xx, &geom_yy, state.a.view(), b.row(i))
                    .with_loss(problem.loss());
                if let Some(g) = &geom_xy {
                    quad = quad.with_fused(g, problem.fused_penalty());
                }
                self.gw.solve(&quad)
            })
            .collect::<Result<Vec<_>>>()?;

        let cost: f64 = outputs
            .iter()
            .zip(weights.iter())
            .map(|(o, w)| w * o.reg_gw_cost)
            .sum();
        let converged = outputs.iter().all(|o| o.converged);

        let mut costs = state.costs.clone();
        costs[iteration] = cost;
        let mut gw_convergence = state.gw_convergence.clone();
        gw_convergence[iteration] = i8::from(converged);
        let errors = state.errors.as_ref().map(|e| {
            let mut e = e.clone();
            for (i, o) in outputs.iter().enumerate() {
                e.slice_mut(s![iteration, i, .., ..]).assign(&o.errors);
            }
            e
        });

        let plans: Vec<Array2<f64>> = outputs.into_iter().map(|o| o.plan).collect();
        let transports = stack_plans(&plans, state.size(), b.ncols());
        let c = problem.update_structure(transports.view(), state.a.view())?;
        let x = problem.update_features(transports.view(), state.a.view())?;

        debug!(iteration, cost, converged, "gw barycenter iteration");
        Ok(GwBarycenterState {
            c,
            x,
            a: state.a.clone(),
            costs,
            gw_convergence,
            errors,
        })
    }

    /// Final result of a run. The state already carries everything.
    pub fn output_from_state(&self, state: GwBarycenterState) -> GwBarycenterState {
        state
    }

    /// Iterate [`Self::update_state`] from `state` until the stopping rule
    /// fires or the iteration budget runs out.
    pub fn run(
        &self,
        problem: &GwBarycenterProblem,
        state: GwBarycenterState,
    ) -> Result<GwBarycenterState> {
        check_problem(problem)?;
        let threshold = self.config.threshold;
        let out = fixpoint_iter(
            |iteration, _: &GwBarycenterProblem, state: &GwBarycenterState| {
                fixed_point::keep_iterating(
                    iteration,
                    state.costs.view(),
                    state.gw_convergence.view(),
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
            "gw barycenter finished"
        );
        if out.status() == Status::Diverged {
            warn!(iterations = out.num_iterations(), "gw barycenter cost is not finite");
        }
        Ok(out)
    }
}

fn check_problem(problem: &GwBarycenterProblem) -> Result<()> {
    if problem.base().is_debiased() {
        return Err(Error::NotImplemented("debiased gromov-wasserstein barycenter"));
    }
    if problem.base().num_measures() == 0 {
        return Err(Error::MissingMeasures);
    }
    Ok(())
}

fn check_square(c: &Array2<f64>) -> Result<usize> {
    let (k, l) = c.dim();
    if k != l || k == 0 {
        return Err(Error::ShapeMismatch {
            what: "initial structure",
            expected: vec![k, k],
            got: vec![k, l],
        });
    }
    Ok(k)
}

/// Uniform when absent; otherwise checked and normalised.
pub(crate) fn barycenter_weights(a: Option<Array1<f64>>, k: usize) -> Result<Array1<f64>> {
    let a = match a {
        None => return Ok(Array1::from_elem(k, 1.0 / k as f64)),
        Some(a) => a,
    };
    if a.len() != k {
        return Err(Error::LengthMismatch(k, a.len()));
    }
    if a.iter().any(|&x| x < 0.0 || !x.is_finite()) {
        return Err(Error::Domain("barycenter weights must be nonnegative and finite"));
    }
    let total = a.sum();
    if total <= 0.0 {
        return Err(Error::Domain("barycenter weights must have positive sum"));
    }
    Ok(a / total)
}

/// `[M, k, N]` batch from per-measure `[k, N]` plans.
pub(crate) fn stack_plans(plans: &[Array2<f64>], k: usize, n: usize) -> Array3<f64> {
    let mut out = Array3::zeros((plans.len(), k, n));
    for (mut slot, plan) in out.outer_iter_mut().zip(plans) {
        slot.assign(plan);
    }
    out
}

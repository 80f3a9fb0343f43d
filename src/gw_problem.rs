//! (Fused) Gromov-Wasserstein barycenter problems.
//!
//! A [`GwBarycenterProblem`] reads the measures of a [`BarycenterProblem`]
//! either as point clouds (compared with the problem's [`CostFn`]) or as
//! precomputed `[N, N]` structure matrices, and optionally carries one
//! feature array per measure for the fused objective.
//!
//! Given the transport plans `T_i` (`[k, N]`) between the current barycenter
//! and every measure, the barycenter structure is
//!
//! ```text
//! C = (Σ_i w_i · T_i fn(C_i) T_iᵀ) / (a aᵀ)
//! ```
//!
//! with `fn = ln` (floored, and an `exp` afterwards) for the KL loss, and the fused
//! features are `Σ_i w_i · proj(T_i / a, F_i)`.

use crate::geometry::{build_geometry, masked_dot_left, CostFn, Geometry, ScaleCost, Support};
use crate::loss::GwLoss;
use crate::parts::Parts;
use crate::problem::{BarycenterProblem, PointArray, ProblemConfig, ProblemData};
use crate::segment::segment_point_cloud;
use crate::{Error, Result};
use ndarray::{concatenate, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How the measures of a GW problem are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StructureKind {
    /// Coordinates, turned into structures with the problem's cost function.
    #[default]
    PointCloud,
    /// Padded `[num_measures, N, N]` structure matrices.
    CostMatrix,
}

/// A barycenter problem in the Gromov-Wasserstein sense.
#[derive(Debug, Clone, PartialEq)]
pub struct GwBarycenterProblem {
    base: BarycenterProblem,
    kind: StructureKind,
    y_fused: Option<PointArray>,
    fused_penalty: f64,
    loss: GwLoss,
    scale_cost: ScaleCost,
}

impl GwBarycenterProblem {
    /// Build from point clouds or from structure matrices, never both.
    ///
    /// Structure matrices must come padded, `[num_measures, N, N]`. With
    /// neither, the problem is empty.
    pub fn new(
        point_clouds: Option<BarycenterProblem>,
        costs: Option<BarycenterProblem>,
    ) -> Result<Self> {
        match (point_clouds, costs) {
            (Some(_), Some(_)) => Err(Error::Config(
                "give either point clouds or cost matrices, not both",
            )),
            (Some(y), None) => Ok(Self::from_parts_unchecked(y, StructureKind::PointCloud)),
            (None, Some(costs)) => {
                match costs.points() {
                    Some(PointArray::Padded(c)) => {
                        let (_, n, d) = c.dim();
                        if n != d {
                            return Err(Error::ShapeMismatch {
                                what: "cost matrices",
                                expected: vec![n, n],
                                got: vec![n, d],
                            });
                        }
                    }
                    Some(PointArray::Flat(_)) => {
                        return Err(Error::Config("cost matrices must be given padded"))
                    }
                    None => {}
                }
                Ok(Self::from_parts_unchecked(costs, StructureKind::CostMatrix))
            }
            (None, None) => Ok(Self::from_parts_unchecked(
                BarycenterProblem::empty(),
                StructureKind::PointCloud,
            )),
        }
    }

    /// Measures given as point clouds.
    pub fn from_point_clouds(base: BarycenterProblem) -> Self {
        Self::from_parts_unchecked(base, StructureKind::PointCloud)
    }

    /// Measures given as padded structure matrices `[num_measures, N, N]`
    /// with weights `[num_measures, N]`.
    pub fn from_costs(costs: Array3<f64>, b: Array2<f64>) -> Result<Self> {
        Self::new(None, Some(BarycenterProblem::padded(costs, b)))
    }

    fn from_parts_unchecked(base: BarycenterProblem, kind: StructureKind) -> Self {
        Self {
            base,
            kind,
            y_fused: None,
            fused_penalty: 1.0,
            loss: GwLoss::default(),
            scale_cost: ScaleCost::default(),
        }
    }

    /// Feature array for the fused objective, in the same layout as the
    /// measures (padded or flat with the same segments).
    pub fn with_features(mut self, y_fused: PointArray) -> Self {
        self.y_fused = Some(y_fused);
        self
    }

    pub fn with_fused_penalty(mut self, penalty: f64) -> Self {
        self.fused_penalty = penalty;
        self
    }

    pub fn with_loss(mut self, loss: GwLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_scale_cost(mut self, scale_cost: ScaleCost) -> Self {
        self.scale_cost = scale_cost;
        self
    }

    pub fn base(&self) -> &BarycenterProblem {
        &self.base
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn is_cost(&self) -> bool {
        self.kind == StructureKind::CostMatrix
    }

    pub fn loss(&self) -> GwLoss {
        self.loss
    }

    pub fn fused_penalty(&self) -> f64 {
        self.fused_penalty
    }

    pub fn scale_cost(&self) -> ScaleCost {
        self.scale_cost
    }

    pub fn is_fused(&self) -> bool {
        self.y_fused.is_some()
    }

    /// Features in padded form `[M, N, D_f]`, or `None` if not fused.
    pub fn segmented_features(&self) -> Result<Option<Array3<f64>>> {
        let features = match &self.y_fused {
            None => return Ok(None),
            Some(PointArray::Padded(f)) => f.clone(),
            Some(PointArray::Flat(f)) => {
                let size = self.base.max_measure_size()?;
                let (f, _, _) =
                    segment_point_cloud(f.view(), None, self.base.segments(), Some(size))?;
                f
            }
        };
        if self.base.is_debiased() {
            let (_, n, d) = features.dim();
            return Ok(Some(concatenate![Axis(0), features, Array3::zeros((1, n, d))]));
        }
        Ok(Some(features))
    }

    /// Geometry of measure `i` of the padded batch `measures`.
    pub(crate) fn measure_geometry(&self, measures: &Array3<f64>, i: usize) -> Result<Geometry> {
        let slice = measures.index_axis(Axis(0), i);
        let support = match self.kind {
            StructureKind::CostMatrix => Support::CostMatrix(slice),
            StructureKind::PointCloud => Support::PointCloud {
                points: slice,
                cost_fn: self.base.cost_fn(),
            },
        };
        build_geometry(support, self.base.epsilon(), self.scale_cost)
    }

    /// Padded measures, with `MissingMeasures` instead of `None`.
    pub(crate) fn measures(&self) -> Result<(Array3<f64>, Array2<f64>)> {
        match self.base.segmented_measures()? {
            (Some(y), Some(b)) => Ok((y, b)),
            _ => Err(Error::MissingMeasures),
        }
    }

    /// Weighted structure aggregate before the inverse loss transform.
    ///
    /// `transports` is `[M, k, N]` (one slot per mixing weight), `a` has
    /// length `k`. Entries where `a_p a_q = 0` are left unnormalised.
    pub fn aggregate_structure(
        &self,
        transports: ArrayView3<f64>,
        a: ArrayView1<f64>,
    ) -> Result<Array2<f64>> {
        let (y, _) = self.measures()?;
        let weights = self.base.mixing_weights()?;
        check_transports(transports, weights.len(), a.len(), y.dim().1)?;

        let transform = self.loss.structure_transform().map(|(forward, _)| forward);
        let contributions = (0..weights.len())
            .into_par_iter()
            .map(|i| -> Result<Array2<f64>> {
                let geom = self.measure_geometry(&y, i)?;
                let plan = transports.index_axis(Axis(0), i);
                // fn(C_i)ᵀ T_iᵀ is [N, k]; projecting back with T_i gives [k, k].
                let pulled = geom.apply_cost(plan.t(), Axis(0), transform)?;
                Ok(masked_dot_left(plan, pulled.view()) * weights[i])
            })
            .collect::<Result<Vec<_>>>()?;

        let k = a.len();
        let mut cost = Array2::zeros((k, k));
        for c in &contributions {
            cost += c;
        }
        for ((p, q), v) in cost.indexed_iter_mut() {
            let norm = a[p] * a[q];
            if norm != 0.0 {
                *v /= norm;
            }
        }
        Ok(cost)
    }

    /// New barycenter structure `[k, k]` from the current transport plans.
    pub fn update_structure(
        &self,
        transports: ArrayView3<f64>,
        a: ArrayView1<f64>,
    ) -> Result<Array2<f64>> {
        let cost = self.aggregate_structure(transports, a)?;
        Ok(match self.loss.structure_transform() {
            Some((_, inverse)) => cost.mapv(inverse),
            None => cost,
        })
    }

    /// New barycenter features `[k, D_f]`, or `None` if not fused.
    ///
    /// Plans are rescaled by `1 / a` row-wise; rows where `a` is zero keep
    /// a multiplier of one. Features always average under the squared
    /// Euclidean rule, whatever cost the structures use.
    pub fn update_features(
        &self,
        transports: ArrayView3<f64>,
        a: ArrayView1<f64>,
    ) -> Result<Option<Array2<f64>>> {
        let features = match self.segmented_features()? {
            None => return Ok(None),
            Some(f) => f,
        };
        let inv_a = a.mapv(|x| if x == 0.0 { 1.0 } else { 1.0 / x });
        if self.loss != GwLoss::SqEuclidean {
            return Err(Error::NotImplemented("feature update for a non squared-Euclidean loss"));
        }

        let weights = self.base.mixing_weights()?;
        check_transports(transports, weights.len(), a.len(), features.dim().1)?;
        let contributions = (0..weights.len())
            .into_par_iter()
            .map(|i| -> Result<Array2<f64>> {
                let plan = &transports.index_axis(Axis(0), i) * &inv_a.view().insert_axis(Axis(1));
                let proj = barycentric_projection(
                    plan.view(),
                    features.index_axis(Axis(0), i),
                    CostFn::SqEuclidean,
                )?;
                Ok(proj * weights[i])
            })
            .collect::<Result<Vec<_>>>()?;

        let mut out = Array2::zeros((a.len(), features.dim().2));
        for c in &contributions {
            out += c;
        }
        Ok(Some(out))
    }
}

/// Map every row of `plan` (`[k, N]`) to the `cost_fn` barycenter of the
/// points `y` (`[N, D]`) it weights, giving `[k, D]`.
pub fn barycentric_projection(
    plan: ArrayView2<f64>,
    y: ArrayView2<f64>,
    cost_fn: CostFn,
) -> Result<Array2<f64>> {
    let mut out = Array2::zeros((plan.nrows(), y.ncols()));
    for (row, mut target) in plan.outer_iter().zip(out.outer_iter_mut()) {
        target.assign(&cost_fn.barycenter(row, y)?);
    }
    Ok(out)
}

fn check_transports(
    transports: ArrayView3<f64>,
    num_slots: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    let expected = [num_slots, k, n];
    if transports.shape() != expected {
        return Err(Error::ShapeMismatch {
            what: "transport plans",
            expected: expected.to_vec(),
            got: transports.shape().to_vec(),
        });
    }
    Ok(())
}

/// Array half of a [`GwBarycenterProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GwProblemData {
    pub base: ProblemData,
    pub y_fused: Option<PointArray>,
}

/// Static half of a [`GwBarycenterProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GwProblemConfig {
    pub base: ProblemConfig,
    pub kind: StructureKind,
    pub fused_penalty: f64,
    pub loss: GwLoss,
    pub scale_cost: ScaleCost,
}

impl Parts for GwBarycenterProblem {
    type Data = GwProblemData;
    type Config = GwProblemConfig;

    fn to_parts(&self) -> (GwProblemData, GwProblemConfig) {
        let (base_data, base_config) = self.base.to_parts();
        (
            GwProblemData {
                base: base_data,
                y_fused: self.y_fused.clone(),
            },
            GwProblemConfig {
                base: base_config,
                kind: self.kind,
                fused_penalty: self.fused_penalty,
                loss: self.loss,
                scale_cost: self.scale_cost,
            },
        )
    }

    fn from_parts(data: GwProblemData, config: GwProblemConfig) -> Self {
        Self {
            base: BarycenterProblem::from_parts(data.base, config.base),
            kind: config.kind,
            y_fused: data.y_fused,
            fused_penalty: config.fused_penalty,
            loss: config.loss,
            scale_cost: config.scale_cost,
        }
    }
}

//! Barycenter problems: a batch of weighted measures and how to mix them.
//!
//! Measures arrive either already padded (`[num_measures, N, D]` support
//! plus `[num_measures, N]` weights) or flat (`[total, D]` plus
//! [`Segments`]). Everything downstream works on the padded layout, which
//! [`BarycenterProblem::segmented_measures`] produces from either form.

use crate::geometry::CostFn;
use crate::parts::Parts;
use crate::segment::{max_segment_size, segment_point_cloud, Segments};
use crate::{Error, Result};
use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

/// Weight appended to the mixing weights of a debiased problem.
pub const DEBIAS_WEIGHT: f64 = -0.5;

/// Support of all measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointArray {
    /// `[num_measures, N, D]`.
    Padded(Array3<f64>),
    /// `[total, D]`, split by the problem's [`Segments`].
    Flat(Array2<f64>),
}

/// Per-point weights of all measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WeightArray {
    /// `[num_measures, N]`, zero on padding slots.
    Padded(Array2<f64>),
    /// `[total]`.
    Flat(Array1<f64>),
}

/// Weighted measures whose (regularised) barycenter is sought.
#[derive(Debug, Clone, PartialEq)]
pub struct BarycenterProblem {
    y: Option<PointArray>,
    b: Option<WeightArray>,
    weights: Option<Array1<f64>>,
    cost_fn: CostFn,
    epsilon: Option<f64>,
    debiased: bool,
    segments: Segments,
    max_measure_size: Option<usize>,
}

impl Default for BarycenterProblem {
    fn default() -> Self {
        Self::empty()
    }
}

impl BarycenterProblem {
    /// A problem with no measures yet, used for shape inference.
    pub fn empty() -> Self {
        Self {
            y: None,
            b: None,
            weights: None,
            cost_fn: CostFn::default(),
            epsilon: None,
            debiased: false,
            segments: Segments::default(),
            max_measure_size: None,
        }
    }

    /// Measures given as padded arrays.
    pub fn padded(y: Array3<f64>, b: Array2<f64>) -> Self {
        Self {
            y: Some(PointArray::Padded(y)),
            b: Some(WeightArray::Padded(b)),
            ..Self::empty()
        }
    }

    /// Measures given as one flat array split by `segments`.
    ///
    /// Missing weights are uniform within each measure.
    pub fn segmented(y: Array2<f64>, b: Option<Array1<f64>>, segments: Segments) -> Self {
        Self {
            y: Some(PointArray::Flat(y)),
            b: b.map(WeightArray::Flat),
            segments,
            ..Self::empty()
        }
    }

    /// Mixing weights over measures; normalised on read.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_cost_fn(mut self, cost_fn: CostFn) -> Self {
        self.cost_fn = cost_fn;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Subtract the barycenter's self-transport cost from the objective.
    ///
    /// Experimental: the data layout supports it, the solvers refuse it.
    pub fn with_debiased(mut self, debiased: bool) -> Self {
        self.debiased = debiased;
        self
    }

    pub fn with_max_measure_size(mut self, n: usize) -> Self {
        self.max_measure_size = Some(n);
        self
    }

    pub fn cost_fn(&self) -> CostFn {
        self.cost_fn
    }

    pub fn epsilon(&self) -> Option<f64> {
        self.epsilon
    }

    pub fn is_debiased(&self) -> bool {
        self.debiased
    }

    pub fn segments(&self) -> &Segments {
        &self.segments
    }

    pub(crate) fn points(&self) -> Option<&PointArray> {
        self.y.as_ref()
    }

    /// Support and weights in padded form, `[M, N, D]` and `[M, N]`.
    ///
    /// A debiased problem gets one extra all-zero measure at the end.
    /// Absent arrays stay absent.
    pub fn segmented_measures(&self) -> Result<(Option<Array3<f64>>, Option<Array2<f64>>)> {
        let (y, b) = match (&self.y, &self.b) {
            (None, Some(WeightArray::Padded(b))) => (None, Some(b.clone())),
            (None, _) => (None, None),
            (Some(PointArray::Padded(y)), None) => (Some(y.clone()), None),
            (Some(PointArray::Padded(y)), Some(WeightArray::Padded(b))) => {
                (Some(y.clone()), Some(b.clone()))
            }
            (Some(PointArray::Padded(_)), Some(WeightArray::Flat(_))) => {
                return Err(Error::Config("padded support requires padded weights"))
            }
            (Some(PointArray::Flat(y)), b) => {
                let b = match b {
                    None => None,
                    Some(WeightArray::Flat(b)) => Some(b.view()),
                    Some(WeightArray::Padded(_)) => {
                        return Err(Error::Config("flat support requires flat weights"))
                    }
                };
                let (y, b, _) =
                    segment_point_cloud(y.view(), b, &self.segments, self.max_measure_size)?;
                (Some(y), Some(b))
            }
        };
        Ok(self.add_slice_for_debiased(y, b))
    }

    fn add_slice_for_debiased(
        &self,
        y: Option<Array3<f64>>,
        b: Option<Array2<f64>>,
    ) -> (Option<Array3<f64>>, Option<Array2<f64>>) {
        match (y, b) {
            (Some(y), Some(b)) if self.debiased => {
                let (_, n, d) = y.dim();
                let y = concatenate![Axis(0), y, Array3::zeros((1, n, d))];
                let b = concatenate![Axis(0), b, Array2::zeros((1, n))];
                (Some(y), Some(b))
            }
            other => other,
        }
    }

    /// Padded support reshaped to `[M * N, D]`, or the flat support as is.
    pub fn flattened_support(&self) -> Option<Array2<f64>> {
        match &self.y {
            None => None,
            Some(PointArray::Flat(y)) => Some(y.clone()),
            Some(PointArray::Padded(y)) => {
                let (m, n, d) = y.dim();
                Array2::from_shape_vec((m * n, d), y.iter().copied().collect()).ok()
            }
        }
    }

    /// Padded weights raveled to `[M * N]`, or the flat weights as is.
    pub fn flattened_weights(&self) -> Option<Array1<f64>> {
        match &self.b {
            None => None,
            Some(WeightArray::Flat(b)) => Some(b.clone()),
            Some(WeightArray::Padded(b)) => Some(b.iter().copied().collect()),
        }
    }

    /// Largest number of points in any measure.
    pub fn max_measure_size(&self) -> Result<usize> {
        if let Some(n) = self.max_measure_size {
            return Ok(n);
        }
        match &self.y {
            None => Ok(0),
            Some(PointArray::Padded(y)) => Ok(y.dim().1),
            Some(PointArray::Flat(_)) => max_segment_size(&self.segments),
        }
    }

    /// Number of measures, not counting the debiasing slot.
    pub fn num_measures(&self) -> usize {
        match &self.y {
            None => 0,
            Some(PointArray::Padded(y)) => {
                if let Some(WeightArray::Padded(b)) = &self.b {
                    assert_eq!(
                        y.dim().0,
                        b.nrows(),
                        "padded support and weights disagree on the number of measures"
                    );
                }
                y.dim().0
            }
            Some(PointArray::Flat(_)) => self.segments.num_segments(),
        }
    }

    /// Normalised weights over measures, `-0.5` appended when debiased.
    pub fn mixing_weights(&self) -> Result<Array1<f64>> {
        let n = self.num_measures();
        let weights = match &self.weights {
            None if n == 0 => Array1::zeros(0),
            None => Array1::from_elem(n, 1.0 / n as f64),
            Some(w) => {
                if w.len() != n {
                    return Err(Error::LengthMismatch(n, w.len()));
                }
                let total = w.sum();
                if !(total > 0.0) {
                    return Err(Error::Domain("mixing weights must have positive sum"));
                }
                w / total
            }
        };
        if self.debiased {
            return Ok(concatenate![Axis(0), weights, Array1::from_elem(1, DEBIAS_WEIGHT)]);
        }
        Ok(weights)
    }
}

/// Array half of a [`BarycenterProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemData {
    pub y: Option<PointArray>,
    pub b: Option<WeightArray>,
    pub weights: Option<Array1<f64>>,
}

/// Static half of a [`BarycenterProblem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig {
    pub cost_fn: CostFn,
    pub epsilon: Option<f64>,
    pub debiased: bool,
    pub segments: Segments,
    pub max_measure_size: Option<usize>,
}

impl Parts for BarycenterProblem {
    type Data = ProblemData;
    type Config = ProblemConfig;

    fn to_parts(&self) -> (ProblemData, ProblemConfig) {
        (
            ProblemData {
                y: self.y.clone(),
                b: self.b.clone(),
                weights: self.weights.clone(),
            },
            ProblemConfig {
                cost_fn: self.cost_fn,
                epsilon: self.epsilon,
                debiased: self.debiased,
                segments: self.segments.clone(),
                max_measure_size: self.max_measure_size,
            },
        )
    }

    fn from_parts(data: ProblemData, config: ProblemConfig) -> Self {
        Self {
            y: data.y,
            b: data.b,
            weights: data.weights,
            cost_fn: config.cost_fn,
            epsilon: config.epsilon,
            debiased: config.debiased,
            segments: config.segments,
            max_measure_size: config.max_measure_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};
    use proptest::prelude::*;

    fn flat_problem() -> BarycenterProblem {
        let y = array![[0.0, 0.0], [1.0, 0.0], [5.0, 5.0], [6.0, 5.0], [5.0, 6.0]];
        BarycenterProblem::segmented(y, None, Segments::from_counts(vec![2, 3]))
    }

    #[test]
    fn padded_and_flat_layouts_agree() {
        let flat = flat_problem();
        let (y, b) = flat.segmented_measures().unwrap();
        let (y, b) = (y.unwrap(), b.unwrap());
        let padded = BarycenterProblem::padded(y.clone(), b.clone());
        let (y2, b2) = padded.segmented_measures().unwrap();
        assert_eq!(y2.unwrap(), y);
        assert_eq!(b2.unwrap(), b);
        assert_eq!(padded.num_measures(), flat.num_measures());
        assert_eq!(padded.max_measure_size().unwrap(), 3);
        assert_eq!(flat.max_measure_size().unwrap(), 3);
        assert_eq!(y.slice(s![0, 2, ..]).to_vec(), vec![0.0, 0.0]);
        assert_eq!(b[[0, 2]], 0.0);
    }

    #[test]
    fn max_measure_size_from_unsorted_ids() {
        let y = Array2::zeros((6, 1));
        let p = BarycenterProblem::segmented(y, None, Segments::from_ids(vec![2, 0, 2, 1, 2, 0]));
        assert_eq!(p.max_measure_size().unwrap(), 3);
        assert_eq!(p.num_measures(), 3);
        assert_eq!(p.clone().with_max_measure_size(7).max_measure_size().unwrap(), 7);
    }

    #[test]
    fn empty_problem_has_no_measures() {
        let p = BarycenterProblem::empty();
        assert_eq!(p.num_measures(), 0);
        assert_eq!(p.mixing_weights().unwrap().len(), 0);
        assert_eq!(p.max_measure_size().unwrap(), 0);
        assert_eq!(p.segmented_measures().unwrap(), (None, None));
        assert!(p.flattened_support().is_none());
    }

    #[test]
    fn explicit_weights_are_normalised() {
        let p = flat_problem().with_weights(array![1.0, 3.0]);
        let w = p.mixing_weights().unwrap();
        assert!((w[0] - 0.25).abs() < 1e-12);
        assert!((w[1] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn mismatched_weights_fail_loudly() {
        let p = flat_problem().with_weights(array![1.0, 1.0, 1.0]);
        assert!(matches!(p.mixing_weights(), Err(Error::LengthMismatch(2, 3))));
    }

    #[test]
    fn debiased_appends_negative_half_and_zero_measure() {
        let p = flat_problem().with_debiased(true);
        let w = p.mixing_weights().unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w[2], DEBIAS_WEIGHT);
        assert!((w.slice(s![..2]).sum() - 1.0).abs() < 1e-12);
        let (y, b) = p.segmented_measures().unwrap();
        let (y, b) = (y.unwrap(), b.unwrap());
        assert_eq!(y.shape(), &[3, 3, 2]);
        assert_eq!(b.row(2).sum(), 0.0);
        assert_eq!(p.num_measures(), 2);
    }

    #[test]
    #[should_panic(expected = "disagree on the number of measures")]
    fn padded_leading_dimension_mismatch_is_an_invariant() {
        let p = BarycenterProblem::padded(Array3::zeros((3, 2, 1)), Array2::zeros((2, 2)));
        p.num_measures();
    }

    #[test]
    fn flattened_views_cover_every_slot() {
        let p = BarycenterProblem::padded(Array3::ones((2, 3, 4)), Array2::ones((2, 3)));
        assert_eq!(p.flattened_support().unwrap().dim(), (6, 4));
        assert_eq!(p.flattened_weights().unwrap().len(), 6);
    }

    #[test]
    fn parts_round_trip() {
        let p = flat_problem()
            .with_weights(array![2.0, 1.0])
            .with_epsilon(0.3)
            .with_cost_fn(CostFn::Euclidean);
        let (data, config) = p.to_parts();
        let json = serde_json::to_string(&config).unwrap();
        let config: ProblemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(BarycenterProblem::from_parts(data, config), p);
    }

    proptest! {
        #[test]
        fn mixing_weights_sum_to_one(raw in prop::collection::vec(0.01f64..10.0, 1..8)) {
            let n = raw.len();
            let p = BarycenterProblem::padded(Array3::zeros((n, 2, 1)), Array2::zeros((n, 2)))
                .with_weights(Array1::from_vec(raw));
            let w = p.mixing_weights().unwrap();
            prop_assert!((w.sum() - 1.0).abs() < 1e-9);

            let uniform = BarycenterProblem::padded(Array3::zeros((n, 2, 1)), Array2::zeros((n, 2)));
            prop_assert!((uniform.mixing_weights().unwrap().sum() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn flat_and_padded_are_equivalent(counts in prop::collection::vec(1usize..5, 1..5)) {
            let total: usize = counts.iter().sum();
            let y = Array2::from_shape_fn((total, 2), |(i, j)| (i as f64) - (j as f64) * 0.5);
            let flat = BarycenterProblem::segmented(y, None, Segments::from_counts(counts.clone()));
            let (py, pb) = flat.segmented_measures().unwrap();
            let (py, pb) = (py.unwrap(), pb.unwrap());
            let padded = BarycenterProblem::padded(py.clone(), pb.clone());
            let (qy, qb) = padded.segmented_measures().unwrap();
            prop_assert_eq!(qy.unwrap(), py);
            prop_assert_eq!(qb.unwrap(), pb);
            prop_assert_eq!(flat.max_measure_size().unwrap(), *counts.iter().max().unwrap());
            prop_assert_eq!(padded.max_measure_size().unwrap(), *counts.iter().max().unwrap());
        }
    }
}

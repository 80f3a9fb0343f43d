//! Ragged measures to padded batches.
//!
//! A flat layout stores every point of every measure in one `[total, d]`
//! array and says which measure each point belongs to, either with one id
//! per point or with per-measure counts for contiguous blocks. Solvers want
//! the padded layout `[num_measures, max_size, d]` with zero weights on the
//! padding slots.

use crate::{Error, Result};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// How a flat array splits into measures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segments {
    /// Measure index of every point.
    pub segment_ids: Option<Vec<usize>>,
    /// Number of measures, if known up front.
    pub num_segments: Option<usize>,
    /// Promise that `segment_ids` is non-decreasing. Checked, not trusted.
    pub indices_are_sorted: Option<bool>,
    /// Points per measure for contiguous blocks.
    pub num_per_segment: Option<Vec<usize>>,
}

impl Segments {
    pub fn from_ids(segment_ids: Vec<usize>) -> Self {
        Self {
            segment_ids: Some(segment_ids),
            ..Self::default()
        }
    }

    pub fn from_counts(num_per_segment: Vec<usize>) -> Self {
        Self {
            num_segments: Some(num_per_segment.len()),
            num_per_segment: Some(num_per_segment),
            indices_are_sorted: Some(true),
            ..Self::default()
        }
    }

    pub fn with_num_segments(mut self, n: usize) -> Self {
        self.num_segments = Some(n);
        self
    }

    pub fn with_sorted(mut self, sorted: bool) -> Self {
        self.indices_are_sorted = Some(sorted);
        self
    }

    /// Number of measures described.
    pub fn num_segments(&self) -> usize {
        if let Some(n) = self.num_segments {
            return n;
        }
        if let Some(counts) = &self.num_per_segment {
            return counts.len();
        }
        self.segment_ids
            .as_ref()
            .and_then(|ids| ids.iter().max())
            .map_or(0, |&m| m + 1)
    }

    /// Points per measure.
    pub fn counts(&self) -> Result<Vec<usize>> {
        if let Some(counts) = &self.num_per_segment {
            return Ok(counts.clone());
        }
        let ids = self
            .segment_ids
            .as_ref()
            .ok_or(Error::Config("either segment_ids or num_per_segment is required"))?;
        let mut counts = vec![0usize; self.num_segments()];
        for &id in ids {
            *counts
                .get_mut(id)
                .ok_or(Error::Domain("segment id out of range"))? += 1;
        }
        Ok(counts)
    }

    /// Segment id of every point, for a flat array of `total` points.
    fn resolve_ids(&self, total: usize) -> Result<Vec<usize>> {
        let ids = match (&self.segment_ids, &self.num_per_segment) {
            (Some(ids), _) => ids.clone(),
            (None, Some(counts)) => counts
                .iter()
                .enumerate()
                .flat_map(|(s, &c)| std::iter::repeat(s).take(c))
                .collect(),
            (None, None) => {
                return Err(Error::Config("either segment_ids or num_per_segment is required"))
            }
        };
        if ids.len() != total {
            return Err(Error::LengthMismatch(total, ids.len()));
        }
        if self.indices_are_sorted == Some(true) && ids.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Domain("segment ids are not sorted"));
        }
        Ok(ids)
    }
}

/// Largest measure size described by `segments`.
pub fn max_segment_size(segments: &Segments) -> Result<usize> {
    Ok(segments.counts()?.into_iter().max().unwrap_or(0))
}

/// Pad a flat point cloud into `[num_segments, max_size, d]`.
///
/// Missing weights become uniform within each measure. Points keep their
/// flat order inside a measure, so sorted and unsorted ids describing the
/// same grouping give identical batches.
pub fn segment_point_cloud(
    x: ArrayView2<f64>,
    weights: Option<ArrayView1<f64>>,
    segments: &Segments,
    max_measure_size: Option<usize>,
) -> Result<(Array3<f64>, Array2<f64>, usize)> {
    let total = x.nrows();
    if let Some(w) = weights {
        if w.len() != total {
            return Err(Error::LengthMismatch(total, w.len()));
        }
    }
    let ids = segments.resolve_ids(total)?;
    let num_segments = segments.num_segments();
    let counts = segments.counts()?;
    if counts.iter().sum::<usize>() != total {
        return Err(Error::LengthMismatch(total, counts.iter().sum()));
    }
    let largest = counts.iter().copied().max().unwrap_or(0);
    let max_size = match max_measure_size {
        Some(n) if n < largest => {
            return Err(Error::Domain("max_measure_size is smaller than the largest measure"))
        }
        Some(n) => n,
        None => largest,
    };

    let dim = x.ncols();
    let mut padded = Array3::zeros((num_segments, max_size, dim));
    let mut padded_w = Array2::zeros((num_segments, max_size));
    let mut cursor = vec![0usize; num_segments];

    for (p, &s) in ids.iter().enumerate() {
        if s >= num_segments {
            return Err(Error::Domain("segment id out of range"));
        }
        let slot = cursor[s];
        cursor[s] += 1;
        padded.slice_mut(ndarray::s![s, slot, ..]).assign(&x.row(p));
        padded_w[[s, slot]] = match weights {
            Some(w) => w[p],
            None => 1.0 / counts[s] as f64,
        };
    }

    Ok((padded, padded_w, num_segments))
}

/// Pad ragged square cost matrices into `[num_measures, N, N]` with uniform
/// weights on the real entries.
pub fn pad_cost_matrices(costs: &[Array2<f64>]) -> Result<(Array3<f64>, Array2<f64>)> {
    for c in costs {
        if c.nrows() != c.ncols() {
            return Err(Error::CostShapeMismatch(c.nrows(), c.nrows(), c.nrows(), c.ncols()));
        }
    }
    let max_size = costs.iter().map(|c| c.nrows()).max().unwrap_or(0);
    let mut padded = Array3::zeros((costs.len(), max_size, max_size));
    let mut weights = Array2::zeros((costs.len(), max_size));
    for (s, c) in costs.iter().enumerate() {
        let n = c.nrows();
        padded.slice_mut(ndarray::s![s, ..n, ..n]).assign(c);
        weights.slice_mut(ndarray::s![s, ..n]).fill(1.0 / n.max(1) as f64);
    }
    Ok((padded, weights))
}

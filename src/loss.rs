//! Gromov-Wasserstein losses.
//!
//! Every supported loss decomposes as
//! `L(x, y) = f1(x) + f2(y) − h1(x)·h2(y)`, which is what lets the quadratic
//! objective be linearised around a plan with two matrix products.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Elementwise map applied to structure entries.
pub type Transform = fn(f64) -> f64;

/// Smallest argument the KL loss takes the logarithm of. Distance matrices
/// have a zero diagonal.
pub const KL_LOG_FLOOR: f64 = 1e-8;

/// Loss comparing two structural costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GwLoss {
    /// `(x − y)²`.
    #[default]
    SqEuclidean,
    /// `x ln(x / y) − x + y`.
    Kl,
}

impl GwLoss {
    pub fn f1(&self, x: f64) -> f64 {
        match self {
            GwLoss::SqEuclidean => x * x,
            GwLoss::Kl => xlogx(x) - x,
        }
    }

    pub fn f2(&self, y: f64) -> f64 {
        match self {
            GwLoss::SqEuclidean => y * y,
            GwLoss::Kl => y,
        }
    }

    pub fn h1(&self, x: f64) -> f64 {
        x
    }

    pub fn h2(&self, y: f64) -> f64 {
        match self {
            GwLoss::SqEuclidean => 2.0 * y,
            GwLoss::Kl => floored_ln(y),
        }
    }

    /// Full loss, `f1(x) + f2(y) − h1(x)·h2(y)`.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.f1(x) + self.f2(y) - self.h1(x) * self.h2(y)
    }

    /// Elementwise transform applied to measure costs before they are
    /// aggregated into a barycenter structure, and its inverse.
    ///
    /// `None` means the aggregation happens on raw costs.
    pub fn structure_transform(&self) -> Option<(Transform, Transform)> {
        match self {
            GwLoss::SqEuclidean => None,
            GwLoss::Kl => Some((floored_ln as Transform, f64::exp as Transform)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GwLoss::SqEuclidean => "sqeucl",
            GwLoss::Kl => "kl",
        }
    }
}

fn floored_ln(y: f64) -> f64 {
    y.max(KL_LOG_FLOOR).ln()
}

fn xlogx(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x * x.ln()
    }
}

impl FromStr for GwLoss {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqeucl" => Ok(GwLoss::SqEuclidean),
            "kl" => Ok(GwLoss::Kl),
            other => Err(Error::UnknownLoss(other.to_string())),
        }
    }
}

impl fmt::Display for GwLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

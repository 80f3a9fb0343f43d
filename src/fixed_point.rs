//! Generic fixed-point iteration.
//!
//! The barycenter solvers only supply a stopping predicate and a step; the
//! loop here owns the iteration counter and the min/max budget.

use crate::Result;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Where a barycenter run stands, read off its traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// No outer iteration has run.
    Initialized,
    /// The last iteration reported every inner solve as converged.
    Converged,
    /// Ended before the budget on a small cost change.
    Stopped,
    /// The last recorded cost is NaN or infinite.
    Diverged,
    /// Every slot of the trace was used.
    Exhausted,
}

/// Run `body_fn` until `cond_fn` says stop or the budget runs out.
///
/// Before each block of `inner_iterations` steps the loop continues iff
/// `iteration < max_iterations && (iteration < min_iterations || cond_fn(..))`.
/// `body_fn` receives the index of the step it performs and whether it is
/// the last step of its block (`compute_error`). Errors from `body_fn`
/// abort the loop.
pub fn fixpoint_iter<C, S, F, B>(
    cond_fn: F,
    mut body_fn: B,
    min_iterations: usize,
    max_iterations: usize,
    inner_iterations: usize,
    constants: &C,
    state: S,
) -> Result<S>
where
    C: ?Sized,
    F: Fn(usize, &C, &S) -> bool,
    B: FnMut(usize, &C, S, bool) -> Result<S>,
{
    let inner = inner_iterations.max(1);
    let mut state = state;
    let mut iteration = 0usize;

    while iteration < max_iterations
        && (iteration < min_iterations || cond_fn(iteration, constants, &state))
    {
        for j in 0..inner {
            if iteration >= max_iterations {
                break;
            }
            let compute_error = j + 1 == inner;
            state = body_fn(iteration, constants, state, compute_error)?;
            iteration += 1;
        }
    }

    Ok(state)
}

/// Outer iterations recorded in a `-1`-initialised convergence trace.
pub(crate) fn filled(flags: ArrayView1<i8>) -> usize {
    flags.iter().take_while(|&&f| f >= 0).count()
}

pub(crate) fn status(flags: ArrayView1<i8>, costs: ArrayView1<f64>) -> Status {
    let n = filled(flags);
    if n == 0 {
        Status::Initialized
    } else if !costs[n - 1].is_finite() {
        Status::Diverged
    } else if flags[n - 1] == 1 {
        Status::Converged
    } else if n == flags.len() {
        Status::Exhausted
    } else {
        Status::Stopped
    }
}

/// Barycenter continuation predicate over the cost and convergence traces.
///
/// Stops once the previous iteration converged, produced a non-finite
/// cost, or changed the cost by less than `threshold`.
pub(crate) fn keep_iterating(
    iteration: usize,
    costs: ArrayView1<f64>,
    flags: ArrayView1<i8>,
    threshold: f64,
) -> bool {
    if iteration == 0 {
        return true;
    }
    let last = iteration - 1;
    let cost = costs[last];
    if !cost.is_finite() || flags[last] == 1 {
        return false;
    }
    if last == 0 {
        return true;
    }
    (cost - costs[last - 1]).abs() >= threshold
}

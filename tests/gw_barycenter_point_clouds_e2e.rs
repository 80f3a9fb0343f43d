use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use wass_barycenter::{
    BarycenterInit, BarycenterProblem, GromovConfig, GwBarycenterConfig, GwBarycenterProblem,
    GwBarycenterSolver, Segments, SinkhornConfig, Status,
};

const SIZES: [usize; 3] = [5, 7, 4];
const MAX_ITERATIONS: usize = 20;

fn random_clouds(seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let total: usize = SIZES.iter().sum();
    Array2::from_shape_fn((total, 2), |_| rng.gen_range(-1.0..1.0))
}

fn solver() -> GwBarycenterSolver {
    let config = GwBarycenterConfig::default()
        .with_max_iterations(MAX_ITERATIONS)
        .with_gw(GromovConfig::default().with_sinkhorn(SinkhornConfig::default().with_threshold(1e-6)));
    GwBarycenterSolver::new(config).unwrap()
}

#[test]
fn gw_barycenter_of_three_clouds() {
    let problem = GwBarycenterProblem::from_point_clouds(BarycenterProblem::segmented(
        random_clouds(42),
        None,
        Segments::from_counts(SIZES.to_vec()),
    ));
    let solver = solver();
    let state = solver
        .solve(&problem, BarycenterInit::Size(5), None, Some(0))
        .unwrap();

    // Support: square, symmetric, nonnegative.
    let c = &state.c;
    assert_eq!(c.dim(), (5, 5));
    for p in 0..5 {
        for q in 0..5 {
            assert!(c[[p, q]].is_finite() && c[[p, q]] >= 0.0);
            assert!((c[[p, q]] - c[[q, p]]).abs() < 1e-9);
        }
    }
    // The diagonal is the spread of the points mapped onto one barycenter
    // point, so on average it cannot exceed the spread between points.
    let a = &state.a;
    let diag: f64 = (0..5).map(|p| a[p] * c[[p, p]]).sum();
    let all: f64 = a.dot(&c.dot(a));
    assert!(diag <= all * 1.01 + 1e-9, "diag={diag} all={all}");

    // Traces have one slot per allowed iteration, sentinels past the stop.
    assert_eq!(state.costs.len(), MAX_ITERATIONS);
    assert_eq!(state.gw_convergence.len(), MAX_ITERATIONS);
    let n = state.num_iterations();
    assert!(n >= solver.config().min_iterations && n <= MAX_ITERATIONS);
    assert!(state.costs.iter().take(n).all(|c| c.is_finite()));
    assert!(state.costs.iter().skip(n).all(|&c| c == -1.0));
    assert!(state.gw_convergence.iter().skip(n).all(|&f| f == -1));

    // Every inner GW solve converged on the last iteration.
    assert_eq!(state.status(), Status::Converged);
    assert_eq!(state.gw_convergence[n - 1], 1);
    assert!(state.converged());
    assert_eq!(state.a, Array1::from_elem(5, 0.2));
}

#[test]
fn same_seed_reproduces_the_run() {
    let problem = GwBarycenterProblem::from_point_clouds(BarycenterProblem::segmented(
        random_clouds(7),
        None,
        Segments::from_counts(SIZES.to_vec()),
    ));
    let s1 = solver().solve(&problem, BarycenterInit::Size(4), None, Some(11)).unwrap();
    let s2 = solver().solve(&problem, BarycenterInit::Size(4), None, Some(11)).unwrap();
    assert_eq!(s1, s2);
}

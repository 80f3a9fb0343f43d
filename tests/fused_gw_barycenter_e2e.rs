use ndarray::{Array1, Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use wass_barycenter::{
    BarycenterInit, BarycenterProblem, GwBarycenterConfig, GwBarycenterProblem, GwBarycenterSolver,
    PointArray, Segments,
};

const SIZES: [usize; 3] = [5, 7, 4];

fn uniform(rng: &mut ChaCha8Rng, rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

fn problems() -> (GwBarycenterProblem, GwBarycenterProblem) {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let total: usize = SIZES.iter().sum();
    let y = uniform(&mut rng, total, 2);
    let features = uniform(&mut rng, total, 3);
    let plain = GwBarycenterProblem::from_point_clouds(BarycenterProblem::segmented(
        y,
        None,
        Segments::from_counts(SIZES.to_vec()),
    ));
    let fused = plain
        .clone()
        .with_features(PointArray::Flat(features))
        .with_fused_penalty(0.5);
    (plain, fused)
}

#[test]
fn fused_barycenter_carries_features() {
    let (_, fused) = problems();
    assert!(fused.is_fused());
    let solver = GwBarycenterSolver::new(GwBarycenterConfig::default().with_max_iterations(10)).unwrap();
    let state = solver.solve(&fused, BarycenterInit::Size(5), None, Some(1)).unwrap();
    assert_eq!(state.c.dim(), (5, 5));
    let x = state.x.expect("fused state keeps features");
    assert_eq!(x.dim(), (5, 3));
    assert!(x.iter().all(|v| v.is_finite()));
    // Features are (nearly) convex combinations of input features.
    assert!(x.iter().all(|v| v.abs() <= 1.05));
}

#[test]
fn update_features_is_absent_without_features() {
    let (plain, fused) = problems();
    let a = Array1::from_elem(5, 0.2);
    let (_, b) = plain.base().segmented_measures().unwrap();
    let b = b.unwrap();
    let plans = Array3::from_shape_fn((3, 5, 7), |(i, p, j)| a[p] * b[[i, j]]);

    assert!(plain.update_features(plans.view(), a.view()).unwrap().is_none());
    let x = fused.update_features(plans.view(), a.view()).unwrap().unwrap();
    assert_eq!(x.dim(), (5, 3));
}

use ndarray::{array, Array2, Array3};
use wass_barycenter::{BarycenterProblem, Error, GwBarycenterProblem, GwLoss, PointArray};

fn fixture() -> (GwBarycenterProblem, Array3<f64>) {
    let y = Array3::from_shape_fn((2, 3, 2), |(i, j, d)| (i + j + d) as f64 + 1.0);
    let b = Array2::from_elem((2, 3), 1.0 / 3.0);
    let features = Array3::from_shape_fn((2, 3, 3), |(i, j, d)| (i * 3 + j) as f64 - d as f64);
    let problem = GwBarycenterProblem::from_point_clouds(BarycenterProblem::padded(y, b))
        .with_features(PointArray::Padded(features));
    // Barycenter point 1 receives no mass.
    let plans = Array3::from_shape_fn((2, 3, 3), |(_, p, j)| {
        if p == 1 {
            0.0
        } else {
            0.5 / 3.0 + 0.01 * j as f64
        }
    });
    (problem, plans)
}

#[test]
fn zero_barycenter_weight_never_divides() {
    let (problem, plans) = fixture();
    let a = array![0.5, 0.0, 0.5];

    let x = problem.update_features(plans.view(), a.view()).unwrap().unwrap();
    assert!(x.iter().all(|v| v.is_finite()));
    assert!(x.row(1).iter().all(|&v| v == 0.0));

    let c = problem.update_structure(plans.view(), a.view()).unwrap();
    assert!(c.iter().all(|v| v.is_finite()));
}

#[test]
fn kl_feature_update_is_not_implemented() {
    let (problem, plans) = fixture();
    let a = array![0.5, 0.0, 0.5];
    let kl = problem.with_loss(GwLoss::Kl);
    match kl.update_features(plans.view(), a.view()) {
        Err(Error::NotImplemented(_)) => {}
        other => panic!("expected NotImplemented, got {other:?}"),
    }
    // Structure updates still run under KL.
    let c = kl.update_structure(plans.view(), a.view()).unwrap();
    assert!(c.iter().all(|v| v.is_finite() && *v >= 0.0));
}

#[test]
fn unknown_loss_name_is_a_configuration_error() {
    assert_eq!("kl".parse::<GwLoss>().unwrap(), GwLoss::Kl);
    assert_eq!("sqeucl".parse::<GwLoss>().unwrap(), GwLoss::SqEuclidean);
    assert!(matches!("l1".parse::<GwLoss>(), Err(Error::UnknownLoss(_))));
}

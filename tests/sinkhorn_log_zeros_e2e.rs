use ndarray::{array, Array1, Array2};
use wass_barycenter::{Geometry, LinearProblem, ScaleCost, Sinkhorn, SinkhornConfig};

#[test]
fn sinkhorn_respects_zero_mass_support() {
    // A has hard zeros at i=0 and i=2. B has hard zero at j=2.
    let a: Array1<f64> = array![0.0, 1.0, 0.0];
    let b: Array1<f64> = array![0.5, 0.5, 0.0];

    // Simple 1D line cost on indices.
    let mut cost: Array2<f64> = Array2::zeros((3, 3));
    for i in 0..3 {
        for j in 0..3 {
            cost[[i, j]] = (i as f64 - j as f64).abs();
        }
    }

    let geom = Geometry::from_cost(cost, Some(0.2), ScaleCost::Unit).unwrap();
    let solver = Sinkhorn::new(SinkhornConfig::default().with_threshold(1e-6));
    let out = solver.solve(&LinearProblem::new(&geom, a.view(), b.view())).unwrap();
    let plan = &out.plan;
    assert!(out.converged);

    let r0 = plan.row(0).sum();
    let r1 = plan.row(1).sum();
    let r2 = plan.row(2).sum();
    assert_eq!(r0, 0.0, "row0 should be exactly 0");
    assert!((r1 - 1.0).abs() < 1e-4, "row1 should be ~1, got {}", r1);
    assert_eq!(r2, 0.0, "row2 should be exactly 0");

    let c0 = plan.column(0).sum();
    let c1 = plan.column(1).sum();
    let c2 = plan.column(2).sum();
    assert!((c0 - 0.5).abs() < 1e-4, "col0 should be ~0.5, got {}", c0);
    assert!((c1 - 0.5).abs() < 1e-4, "col1 should be ~0.5, got {}", c1);
    assert_eq!(c2, 0.0, "col2 should be exactly 0");

    // The regularised cost only sees the allowed block.
    assert!(out.reg_ot_cost.is_finite());
    let filled = out.errors.iter().take_while(|&&e| e >= 0.0).count();
    assert!(filled >= 1);
    assert!(out.errors.iter().skip(filled).all(|&e| e == -1.0));
}

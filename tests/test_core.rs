use std::str::FromStr;

use nalgebra::{Point3, Vector3};
use qn_relax::core::domain::{
    Crystal, DiffusionBias, HessianSeed, Lattice, RelaxParams, UpdateMode,
};
use qn_relax::core::spatial;
use qn_relax::QnError;

#[test]
fn test_lattice_fractional_roundtrip() {
    let lat = Lattice::new(
        Vector3::new(3.0, 0.0, 0.0),
        Vector3::new(0.5, 2.8, 0.0),
        Vector3::new(0.2, 0.4, 4.1),
    )
    .expect("lattice should be invertible");

    let p = Point3::new(1.2, -0.7, 2.5);
    let back = lat.to_cartesian(&lat.to_fractional(&p));
    assert!((back - p).norm() < 1e-12);
}

#[test]
fn test_singular_lattice_rejected() {
    let lat = Lattice::new(
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(2.0, 0.0, 0.0),
        Vector3::new(0.0, 0.0, 1.0),
    );
    assert!(lat.is_none());
}

#[test]
fn test_wrap_respects_pbc_flags() {
    let mut c = Crystal::new("slab", Lattice::cubic(4.0), [true, true, false])
        .with_atom(0, Point3::new(-1.0, 5.0, 6.0));
    c.wrap_into_cell();

    let p = c.atoms[0].position;
    assert!((p.x - 3.0).abs() < 1e-12);
    assert!((p.y - 1.0).abs() < 1e-12);
    // Non-periodic axis untouched
    assert!((p.z - 6.0).abs() < 1e-12);
}

#[test]
fn test_min_image_delta() {
    let lat = Lattice::cubic(10.0);
    let a = Point3::new(0.5, 0.0, 0.0);
    let b = Point3::new(9.5, 0.0, 0.0);

    let d = spatial::min_image_delta(&a, &b, &lat, [true; 3]);
    assert!((d.x + 1.0).abs() < 1e-12);

    let d_open = spatial::min_image_delta(&a, &b, &lat, [false; 3]);
    assert!((d_open.x - 9.0).abs() < 1e-12);
}

#[test]
fn test_max_norm() {
    let field = vec![Vector3::new(3.0, 4.0, 0.0), Vector3::new(0.0, 0.0, -6.0)];
    assert!((spatial::max_norm(&field) - 6.0).abs() < 1e-12);
    assert_eq!(spatial::max_norm(&[]), 0.0);

    // NaN is never hidden behind a finite maximum
    let bad = vec![Vector3::new(f64::NAN, 1.0, 0.0), Vector3::new(0.0, 0.0, 5.0)];
    assert!(spatial::max_norm(&bad).is_nan());
    let bad_last = vec![Vector3::new(0.0, 0.0, 5.0), Vector3::new(f64::NAN, 1.0, 0.0)];
    assert!(spatial::max_norm(&bad_last).is_nan());
}

#[test]
fn test_update_mode_parsing() {
    assert_eq!(UpdateMode::from_str("SR").unwrap(), UpdateMode::Sr);
    assert_eq!(UpdateMode::from_str("psb").unwrap(), UpdateMode::Psb);
    assert_eq!(UpdateMode::from_str("Bfgs").unwrap(), UpdateMode::Bfgs);
    assert_eq!(
        UpdateMode::from_str("LBFGS"),
        Err(QnError::UnknownUpdateMode("LBFGS".to_string()))
    );
    assert_eq!(UpdateMode::Psb.to_string(), "PSB");
}

#[test]
fn test_default_params() {
    let p = RelaxParams::default();
    assert_eq!(p.mode, UpdateMode::Psb);
    assert_eq!(p.ionic_steps, 100);
    assert!((p.ionic_force_tolerance - 1e-2).abs() < 1e-15);
    assert_eq!(p.ionic_energy_tolerance, 0.0);
    assert!((p.min_displacement - 1e-8).abs() < 1e-20);
    assert_eq!(p.engine.starting_h, HessianSeed::Scale(10.0));
    assert!(p.engine.use_eigenvalues);
    assert!(p.engine.symmetrize);
    assert!(p.engine.diffusion.is_none());
}

#[test]
fn test_params_json_roundtrip() {
    let mut p = RelaxParams::default();
    p.mode = UpdateMode::Sr;
    p.engine.diffusion = Some(DiffusionBias {
        atom: 1,
        direction: Vector3::new(0.0, 0.0, 1.0),
    });

    let text = serde_json::to_string(&p).unwrap();
    assert!(text.contains("\"mode\":\"SR\""));

    let back: RelaxParams = serde_json::from_str(&text).unwrap();
    assert_eq!(back.mode, UpdateMode::Sr);
    assert_eq!(back.engine.diffusion, p.engine.diffusion);
}

#[test]
fn test_partial_config_uses_defaults() {
    let p: RelaxParams =
        serde_json::from_str(r#"{ "mode": "BFGS", "starting_h": 5, "symmetrize": false }"#).unwrap();
    assert_eq!(p.mode, UpdateMode::Bfgs);
    assert_eq!(p.engine.starting_h, HessianSeed::Scale(5.0));
    assert!(!p.engine.symmetrize);
    assert_eq!(p.ionic_steps, 100);

    let m: RelaxParams = serde_json::from_str(r#"{ "starting_h": [1.0, 0.0, 0.0, 1.0] }"#).unwrap();
    assert_eq!(m.engine.starting_h, HessianSeed::Matrix(vec![1.0, 0.0, 0.0, 1.0]));

    let bad = serde_json::from_str::<RelaxParams>(r#"{ "mode": "CG" }"#);
    assert!(bad.is_err());
}

#![allow(dead_code)]

use anyhow::{bail, Result};
use nalgebra::{DMatrix, Point3, Vector3};
use qn_relax::core::domain::{Crystal, Lattice};
use qn_relax::core::symmetry::SymOp;
use qn_relax::engine::evaluator::{EvaluationResult, Evaluator};

/// One atom in a simple cubic cell (full Oh symmetry).
pub fn simple_cubic(a: f64) -> Crystal {
    Crystal::new("sc", Lattice::cubic(a), [true; 3]).with_scaled_atom(0, Point3::origin())
}

/// CsCl-type cell: two species, 48 operations, each atom maps onto itself.
pub fn cscl(a: f64) -> Crystal {
    Crystal::new("CsCl", Lattice::cubic(a), [true; 3])
        .with_scaled_atom(0, Point3::new(0.0, 0.0, 0.0))
        .with_scaled_atom(1, Point3::new(0.5, 0.5, 0.5))
}

/// Two atoms with only the identity operation.
pub fn asymmetric_pair() -> Crystal {
    Crystal::new("pair", Lattice::cubic(5.0), [true; 3])
        .with_scaled_atom(0, Point3::new(0.1, 0.2, 0.3))
        .with_scaled_atom(1, Point3::new(0.6, 0.45, 0.7))
        .with_symmetry_ops(vec![SymOp::identity()])
}

/// Rotationally invariant coupling `[[a, -b], [-b, a]]` on every axis.
pub fn coupled_pair_constants(a: f64, b: f64) -> DMatrix<f64> {
    DMatrix::from_fn(6, 6, |i, j| match (i % 3 == j % 3, i / 3 == j / 3) {
        (true, true) => a,
        (true, false) => -b,
        _ => 0.0,
    })
}

/// Evaluator that always fails, standing in for a crashed engine.
pub struct FailingEvaluator;

impl Evaluator for FailingEvaluator {
    fn evaluate(&self, _crystal: &Crystal) -> Result<EvaluationResult> {
        bail!("engine crashed")
    }

    fn name(&self) -> &str {
        "Failing Evaluator"
    }
}

/// Evaluator whose forces carry a NaN component, as a diverged engine would.
pub struct NanEvaluator;

impl Evaluator for NanEvaluator {
    fn evaluate(&self, crystal: &Crystal) -> Result<EvaluationResult> {
        Ok(EvaluationResult {
            energy: 0.0,
            forces: vec![Vector3::new(f64::NAN, 1.0, 0.0); crystal.len()],
        })
    }

    fn name(&self) -> &str {
        "NaN Evaluator"
    }
}

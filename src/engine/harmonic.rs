use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, Point3, Vector3};

use crate::core::domain::{Crystal, Lattice};
use crate::core::spatial;
use crate::engine::evaluator::{EvaluationResult, Evaluator};

/// Analytic quadratic energy surface around a reference geometry.
///
/// `E = ½ uᵀ K u` and `F = -K u`, where `u` is the minimum-image displacement
/// of every atom from its reference position. Useful as an exact oracle: the
/// Hessian of this surface is `K` everywhere.
pub struct HarmonicEvaluator {
    reference: Vec<Point3<f64>>,
    lattice: Lattice,
    pbc: [bool; 3],
    force_constants: DMatrix<f64>,
}

impl HarmonicEvaluator {
    pub fn new(reference: &Crystal, force_constants: DMatrix<f64>) -> Result<Self> {
        let dof = reference.dof();
        if force_constants.nrows() != dof || force_constants.ncols() != dof {
            bail!(
                "Force constant matrix is {}x{}, expected {}x{}",
                force_constants.nrows(),
                force_constants.ncols(),
                dof,
                dof
            );
        }
        Ok(Self {
            reference: reference.positions(),
            lattice: reference.lattice.clone(),
            pbc: reference.pbc,
            force_constants,
        })
    }

    /// Independent springs of stiffness `k` on every coordinate.
    pub fn isotropic(reference: &Crystal, k: f64) -> Self {
        let dof = reference.dof();
        Self {
            reference: reference.positions(),
            lattice: reference.lattice.clone(),
            pbc: reference.pbc,
            force_constants: DMatrix::identity(dof, dof) * k,
        }
    }

    pub fn force_constants(&self) -> &DMatrix<f64> {
        &self.force_constants
    }

    fn displacement(&self, crystal: &Crystal) -> DVector<f64> {
        let mut u = DVector::zeros(3 * self.reference.len());
        for (i, (r, atom)) in self.reference.iter().zip(&crystal.atoms).enumerate() {
            let d = spatial::min_image_delta(r, &atom.position, &self.lattice, self.pbc);
            u.fixed_rows_mut::<3>(3 * i).copy_from(&d);
        }
        u
    }
}

impl Evaluator for HarmonicEvaluator {
    fn name(&self) -> &str {
        "Harmonic"
    }

    fn evaluate(&self, crystal: &Crystal) -> Result<EvaluationResult> {
        if crystal.len() != self.reference.len() {
            bail!(
                "Harmonic model built for {} atoms, got {}",
                self.reference.len(),
                crystal.len()
            );
        }

        let u = self.displacement(crystal);
        let ku = &self.force_constants * &u;
        let energy = 0.5 * u.dot(&ku);
        let forces = ku
            .as_slice()
            .chunks(3)
            .map(|c| Vector3::new(-c[0], -c[1], -c[2]))
            .collect();

        Ok(EvaluationResult { energy, forces })
    }
}

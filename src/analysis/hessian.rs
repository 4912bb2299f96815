use anyhow::Context;
use log::{debug, info};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::core::domain::Crystal;
use crate::core::error::{QnError, Result};
use crate::core::symmetry::Symmetry;
use crate::engine::evaluator::Evaluator;

/// Entries of the coverage tensor below this are still unprobed.
const COVERAGE_TOLERANCE: f64 = 1.0e-8;

/// Finite-difference Hessian estimator that exploits crystal symmetry.
///
/// Typical use:
/// 1. `displacements()` lists the probes to evaluate, one field per probe;
/// 2. `set_forces()` takes the force response of each probe;
/// 3. `hessian()` solves the least-squares problem for the force constants.
///
/// Every probe is expanded by symmetry into all of its distinct images, so a
/// direction already spanned by an image of an earlier probe is never probed
/// again.
#[derive(Debug, Clone)]
pub struct Hessian {
    crystal: Crystal,
    symprec: f64,
    symmetry: Option<Symmetry>,
    dx: f64,

    displacements: Vec<Vec<Vector3<f64>>>,
    inequivalent_displacements: Vec<DVector<f64>>,
    /// Operations selected for each probe, replayed on its forces.
    inequivalent_ids: Vec<Vec<usize>>,
    inequivalent_forces: Vec<DVector<f64>>,
}

impl Hessian {
    /// Takes a private copy of `crystal`; the caller's structure is never touched.
    pub fn new(crystal: &Crystal, dx: f64) -> Self {
        Self {
            crystal: crystal.clone(),
            symprec: 1.0e-5,
            symmetry: None,
            dx,
            displacements: Vec::new(),
            inequivalent_displacements: Vec::new(),
            inequivalent_ids: Vec::new(),
            inequivalent_forces: Vec::new(),
        }
    }

    pub fn with_symprec(mut self, symprec: f64) -> Self {
        self.symprec = symprec;
        self
    }

    pub fn crystal(&self) -> &Crystal {
        &self.crystal
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    /// Symmetry of the private crystal, computed on first use.
    pub fn symmetry(&mut self) -> Result<&Symmetry> {
        let sym = match self.symmetry.take() {
            Some(sym) => sym,
            None => self.crystal.symmetry(self.symprec)?,
        };
        let sym: &Symmetry = self.symmetry.insert(sym);
        Ok(sym)
    }

    /// Raw probes, generated on first access.
    pub fn displacements(&mut self) -> Result<&[Vec<Vector3<f64>>]> {
        if self.displacements.is_empty() {
            self.generate_displacements()?;
        }
        Ok(&self.displacements)
    }

    /// Every symmetry image of every probe, flattened to 3N.
    pub fn inequivalent_displacements(&mut self) -> Result<&[DVector<f64>]> {
        if self.displacements.is_empty() {
            self.generate_displacements()?;
        }
        Ok(&self.inequivalent_displacements)
    }

    fn generate_displacements(&mut self) -> Result<()> {
        let n_atoms = self.crystal.len();
        let sym = match self.symmetry.take() {
            Some(sym) => sym,
            None => self.crystal.symmetry(self.symprec)?,
        };

        let mut coverage = vec![Vector3::<f64>::zeros(); n_atoms];
        for _ in 0..3 * n_atoms {
            let Some((atom, axis)) = first_uncovered(&coverage) else {
                break;
            };

            let mut probe = vec![Vector3::zeros(); n_atoms];
            probe[atom][axis] = self.dx;

            let (images, selected) = sym.equivalent_vectors(&probe, None);
            for image in &images {
                for (c, v) in coverage.iter_mut().zip(image) {
                    *c += v.abs();
                }
                self.inequivalent_displacements.push(flatten(image));
            }
            debug!(
                "Probe atom {} axis {}: {} symmetry images",
                atom,
                axis,
                images.len()
            );

            self.displacements.push(probe);
            self.inequivalent_ids.push(selected);
        }

        info!(
            "{} displacement(s) cover {} degrees of freedom ({} symmetry operations)",
            self.displacements.len(),
            3 * n_atoms,
            sym.len()
        );
        self.symmetry = Some(sym);
        Ok(())
    }

    /// Supplies one force field per raw probe, in probe order.
    ///
    /// Each field is expanded with the operations selected for its probe.
    /// Replaces any previously supplied forces.
    pub fn set_forces(&mut self, forces: &[Vec<Vector3<f64>>]) -> Result<()> {
        let n_atoms = self.crystal.len();
        let n_steps = self.displacements()?.len();

        let bad_atoms = forces.iter().find(|f| f.len() != n_atoms).map(|f| f.len());
        if forces.len() != n_steps || bad_atoms.is_some() {
            return Err(QnError::ForceShapeMismatch {
                expected_steps: n_steps,
                expected_atoms: n_atoms,
                got_steps: forces.len(),
                got_atoms: bad_atoms.unwrap_or(n_atoms),
            });
        }

        let sym = match self.symmetry.take() {
            Some(sym) => sym,
            None => self.crystal.symmetry(self.symprec)?,
        };
        let mut table = Vec::with_capacity(self.inequivalent_displacements.len());
        for (field, ids) in forces.iter().zip(&self.inequivalent_ids) {
            let (images, _) = sym.equivalent_vectors(field, Some(ids.as_slice()));
            table.extend(images.iter().map(|img| flatten(img)));
        }
        self.symmetry = Some(sym);
        self.inequivalent_forces = table;
        Ok(())
    }

    /// Least-squares force constants, shape (response, perturbation).
    ///
    /// `forces`, when given, is passed to `set_forces` first.
    pub fn hessian(&mut self, forces: Option<&[Vec<Vector3<f64>>]>) -> Result<DMatrix<f64>> {
        match forces {
            Some(f) => self.set_forces(f)?,
            None if self.inequivalent_forces.is_empty() => return Err(QnError::ForcesNotSet),
            None => {}
        }

        let dof = self.crystal.dof();
        let x = stack_rows(&self.inequivalent_displacements, dof);
        let f = stack_rows(&self.inequivalent_forces, dof);

        let gram = x.transpose() * &x;
        let cross = f.transpose() * &x;
        let gram_inv = gram
            .try_inverse()
            .ok_or(QnError::SingularMatrix("displacement Gram matrix"))?;

        Ok(-(cross * gram_inv))
    }
}

/// Runs `evaluator` on every probe of a fresh `Hessian` builder and returns
/// the estimated force constants of `crystal`.
///
/// Forces at the undisplaced geometry are subtracted from every response, so
/// the structure does not need to be at a stationary point.
pub fn estimate_hessian(
    evaluator: &dyn Evaluator,
    crystal: &Crystal,
    dx: f64,
    symprec: f64,
) -> anyhow::Result<DMatrix<f64>> {
    let mut builder = Hessian::new(crystal, dx).with_symprec(symprec);
    let probes = builder.displacements()?.to_vec();

    let base = evaluator
        .evaluate(builder.crystal())
        .context("Reference evaluation failed")?;

    let mut forces = Vec::with_capacity(probes.len());
    for (i, probe) in probes.iter().enumerate() {
        let mut trial = builder.crystal().clone();
        trial.displace(probe);
        let res = evaluator
            .evaluate(&trial)
            .with_context(|| format!("Evaluation of displacement {} failed", i))?;
        forces.push(
            res.forces
                .iter()
                .zip(&base.forces)
                .map(|(f, f0)| f - f0)
                .collect::<Vec<_>>(),
        );
    }

    info!(
        "Estimated Hessian of '{}' with {} via {} evaluations",
        crystal.name,
        evaluator.name(),
        probes.len() + 1
    );
    Ok(builder.hessian(Some(forces.as_slice()))?)
}

fn first_uncovered(coverage: &[Vector3<f64>]) -> Option<(usize, usize)> {
    coverage.iter().enumerate().find_map(|(atom, c)| {
        (0..3)
            .find(|&axis| c[axis].abs() < COVERAGE_TOLERANCE)
            .map(|axis| (atom, axis))
    })
}

pub(crate) fn flatten(field: &[Vector3<f64>]) -> DVector<f64> {
    DVector::from_iterator(3 * field.len(), field.iter().flat_map(|v| v.iter().copied()))
}

fn stack_rows(rows: &[DVector<f64>], dof: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), dof, |i, j| rows[i][j])
}

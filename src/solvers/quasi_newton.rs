use log::debug;
use nalgebra::{DMatrix, DVector, Dyn, SymmetricEigen, Vector3};

use crate::analysis::hessian::flatten;
use crate::core::domain::{Crystal, HessianSeed, QuasiNewtonParams, UpdateMode};
use crate::core::error::{QnError, Result};
use crate::core::symmetry::Symmetry;

/// Interactive quasi-Newton engine.
///
/// Holds an approximate Hessian of the structure it was built for and turns
/// gradients into displacement proposals, learning curvature from every pair
/// of consecutive gradients. The first `propose_step` only seeds the gradient
/// history: the Hessian is left as seeded and the returned step comes from
/// the seed.
#[derive(Debug, Clone)]
pub struct QuasiNewton {
    n_atoms: usize,
    use_eigenvalues: bool,
    regularization: f64,
    symmetry: Option<Symmetry>,

    hessian: DMatrix<f64>,
    // Derived from `hessian`; cleared on every write.
    eigen: Option<SymmetricEigen<f64, Dyn>>,

    g_old: Option<DVector<f64>>,
    dx: Option<DVector<f64>>,
}

impl QuasiNewton {
    pub fn new(crystal: &Crystal, params: &QuasiNewtonParams) -> Result<Self> {
        let dof = crystal.dof();
        let mut qn = Self {
            n_atoms: crystal.len(),
            use_eigenvalues: params.use_eigenvalues,
            regularization: 0.0,
            symmetry: None,
            hessian: DMatrix::zeros(dof, dof),
            eigen: None,
            g_old: None,
            dx: None,
        };

        let scale = match &params.starting_h {
            HessianSeed::Scale(h) => {
                qn.set_hessian_matrix(DMatrix::identity(dof, dof) * *h)?;
                *h
            }
            HessianSeed::Matrix(flat) => {
                qn.set_hessian(flat)?;
                if dof > 0 { qn.hessian.trace() / dof as f64 } else { 0.0 }
            }
        };

        if let Some(bias) = &params.diffusion {
            if bias.atom >= qn.n_atoms {
                return Err(QnError::InvalidDiffusion(format!(
                    "atom {} out of range for {} atoms",
                    bias.atom, qn.n_atoms
                )));
            }
            let norm_sq = bias.direction.norm_squared();
            if norm_sq == 0.0 {
                return Err(QnError::InvalidDiffusion("zero direction".to_string()));
            }
            let mut v = DVector::zeros(dof);
            v.fixed_rows_mut::<3>(3 * bias.atom).copy_from(&bias.direction);
            let bias_term = &v * v.transpose() * ((scale + 1.0) / norm_sq);
            let biased = &qn.hessian - bias_term;
            qn.set_hessian_matrix(biased)?;
            qn.use_eigenvalues = true;
        }

        qn.regularization = if qn.use_eigenvalues {
            params.regularization.powi(2)
        } else {
            params.regularization
        };
        if qn.use_eigenvalues && qn.regularization == 0.0 {
            return Err(QnError::ZeroRegularization);
        }

        if params.symmetrize {
            qn.symmetry = Some(crystal.symmetry(params.symprec)?);
        }

        Ok(qn)
    }

    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    /// Replaces the Hessian from a flat row-major slice of (3N)² elements.
    pub fn set_hessian(&mut self, flat: &[f64]) -> Result<()> {
        let dof = 3 * self.n_atoms;
        let side = (flat.len() as f64).sqrt().round() as usize;
        if side * side != flat.len() || side != dof {
            return Err(QnError::InvalidHessianShape {
                len: flat.len(),
                expected: dof,
            });
        }
        self.set_hessian_matrix(DMatrix::from_row_slice(side, side, flat))
    }

    pub fn set_hessian_matrix(&mut self, hessian: DMatrix<f64>) -> Result<()> {
        let dof = 3 * self.n_atoms;
        if hessian.nrows() != dof || hessian.ncols() != dof {
            return Err(QnError::InvalidHessianShape {
                len: hessian.len(),
                expected: dof,
            });
        }
        self.hessian = hessian;
        self.eigen = None;
        Ok(())
    }

    fn eigen(&mut self) -> &SymmetricEigen<f64, Dyn> {
        let hessian = &self.hessian;
        self.eigen
            .get_or_insert_with(|| SymmetricEigen::new(hessian.clone()))
    }

    pub fn eigenvalues(&mut self) -> &DVector<f64> {
        &self.eigen().eigenvalues
    }

    /// Eigenvectors as columns, matching `eigenvalues` order.
    pub fn eigenvectors(&mut self) -> &DMatrix<f64> {
        &self.eigen().eigenvectors
    }

    /// Whether eigen-mode inversion is active.
    pub fn use_eigenvalues(&self) -> bool {
        self.use_eigenvalues
    }

    /// Effective regularization (already squared in eigen mode).
    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    pub fn g_old(&self) -> Option<&DVector<f64>> {
        self.g_old.as_ref()
    }

    pub fn last_step(&self) -> Option<&DVector<f64>> {
        self.dx.as_ref()
    }

    pub fn is_seeded(&self) -> bool {
        self.g_old.is_some()
    }

    /// Regularized inverse of the current Hessian.
    ///
    /// In eigen mode every mode `λ` is inverted as `λ / (λ² + r)`, which
    /// damps near-null and negative curvature. Otherwise `(H + r·I)⁻¹`.
    pub fn inverse_hessian(&mut self) -> Result<DMatrix<f64>> {
        let dof = self.hessian.nrows();
        if self.regularization > 0.0 {
            if self.use_eigenvalues {
                let r = self.regularization;
                let eig = self.eigen();
                let damped = eig.eigenvalues.map(|l| l / (l * l + r));
                let v = &eig.eigenvectors;
                return Ok(v * DMatrix::from_diagonal(&damped) * v.transpose());
            }
            return (&self.hessian + DMatrix::identity(dof, dof) * self.regularization)
                .try_inverse()
                .ok_or(QnError::SingularMatrix("regularized Hessian"));
        }
        self.hessian
            .clone()
            .try_inverse()
            .ok_or(QnError::SingularMatrix("Hessian"))
    }

    /// Learns from `gradient` and proposes the next displacement,
    /// `-H⁻¹·g`, one vector per atom.
    ///
    /// On error the engine is left exactly as before the call.
    pub fn propose_step(
        &mut self,
        gradient: &[Vector3<f64>],
        threshold: f64,
        mode: UpdateMode,
    ) -> Result<Vec<Vector3<f64>>> {
        if gradient.len() != self.n_atoms {
            return Err(QnError::GradientShapeMismatch {
                got: gradient.len(),
                expected: self.n_atoms,
            });
        }

        let g = flatten(gradient);
        let previous = match self.secant_delta(&g, threshold, mode) {
            Some(delta) => {
                let updated = &self.hessian + delta;
                let hessian = std::mem::replace(&mut self.hessian, updated);
                Some((hessian, self.eigen.take()))
            }
            None => None,
        };

        let inverse = match self.inverse_hessian() {
            Ok(inverse) => inverse,
            Err(e) => {
                if let Some((hessian, eigen)) = previous {
                    self.hessian = hessian;
                    self.eigen = eigen;
                }
                return Err(e);
            }
        };

        let step = -(inverse * &g);
        let mut dx: Vec<Vector3<f64>> = step
            .as_slice()
            .chunks(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        if let Some(sym) = &self.symmetry {
            dx = sym.symmetrize_vectors(&dx);
        }

        self.g_old = Some(g);
        self.dx = Some(flatten(&dx));
        Ok(dx)
    }

    /// Applies one secant update from the change between `g` and the stored
    /// gradient, then stores `g`. The first call only stores `g`.
    pub fn update_hessian(&mut self, g: &DVector<f64>, threshold: f64, mode: UpdateMode) {
        if let Some(delta) = self.secant_delta(g, threshold, mode) {
            self.hessian += delta;
            self.eigen = None;
        }
        self.g_old = Some(g.clone());
    }

    /// Correction learned from `g` and the stored gradient and step, or None
    /// before the first step.
    fn secant_delta(&self, g: &DVector<f64>, threshold: f64, mode: UpdateMode) -> Option<DMatrix<f64>> {
        let (g_old, dx) = match (&self.g_old, &self.dx) {
            (Some(g_old), Some(dx)) => (g_old, dx),
            _ => return None,
        };

        let dg = g - g_old;
        let h_tmp = &dg - &self.hessian * dx;
        let delta = match mode {
            UpdateMode::Sr => sr_update(dx, &h_tmp, threshold),
            UpdateMode::Psb => psb_update(dx, &h_tmp),
            UpdateMode::Bfgs => bfgs_update(dx, &dg, &h_tmp),
        };
        debug!("{} update: |dH| = {:.3e}", mode, delta.norm());
        Some(delta)
    }
}

/// Symmetric rank-one correction `r rᵀ / (r·dx)`.
///
/// A denominator smaller than `threshold` in magnitude is shifted by
/// `threshold` before dividing.
pub fn sr_update(dx: &DVector<f64>, h_tmp: &DVector<f64>, threshold: f64) -> DMatrix<f64> {
    let mut denominator = h_tmp.dot(dx);
    if denominator.abs() < threshold {
        denominator += threshold;
    }
    h_tmp * h_tmp.transpose() / denominator
}

/// Powell-symmetric-Broyden correction; symmetric by construction.
pub fn psb_update(dx: &DVector<f64>, h_tmp: &DVector<f64>) -> DMatrix<f64> {
    let dxdx = dx.dot(dx);
    let outer = h_tmp * dx.transpose();
    let sym = (&outer + outer.transpose()) / dxdx;
    sym - dx * dx.transpose() * (dx.dot(h_tmp) / (dxdx * dxdx))
}

/// `dg dgᵀ/(dg·dx) − r rᵀ/(dx·r)` with `r = dg − H·dx`.
pub fn bfgs_update(dx: &DVector<f64>, dg: &DVector<f64>, h_tmp: &DVector<f64>) -> DMatrix<f64> {
    dg * dg.transpose() / dg.dot(dx) - h_tmp * h_tmp.transpose() / dx.dot(h_tmp)
}

use std::fmt;
use std::str::FromStr;

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::error::{QnError, Result};
use crate::core::spatial;
use crate::core::symmetry::{self, SymOp, Symmetry};

// --- Physics Types ---

/// A single atom of a crystal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub element_id: usize, // Species index; symmetry only maps equal ids onto each other
    pub position: Point3<f64>, // Cartesian, Å
}

impl Atom {
    pub fn new(element_id: usize, position: Point3<f64>) -> Self {
        Self { element_id, position }
    }
}

/// The periodic cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: Matrix3<f64>, // Columns are a, b, c
    pub inverse: Matrix3<f64>, // Precomputed for fractional conversion
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Option<Self> {
        let vectors = Matrix3::from_columns(&[a, b, c]);
        let inverse = vectors.try_inverse()?;
        Some(Self { vectors, inverse })
    }

    pub fn cubic(a: f64) -> Self {
        Self {
            vectors: Matrix3::identity() * a,
            inverse: Matrix3::identity() / a,
        }
    }

    pub fn to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * p.coords)
    }

    pub fn to_cartesian(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.vectors * p.coords)
    }

    /// Metric tensor `LᵀL`.
    pub fn metric(&self) -> Matrix3<f64> {
        self.vectors.transpose() * self.vectors
    }
}

// --- The Core Entity ---

/// A structure with a periodic cell.
///
/// The relaxation driver mutates positions in place; everything else treats
/// the crystal as read-only or works on a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crystal {
    pub name: String,
    pub atoms: Vec<Atom>,
    pub lattice: Lattice,
    pub pbc: [bool; 3],

    /// Operations supplied by the caller. When absent, `symmetry` detects them.
    pub symmetry_ops: Option<Vec<SymOp>>,
}

impl Crystal {
    pub fn new(name: &str, lattice: Lattice, pbc: [bool; 3]) -> Self {
        Self {
            name: name.to_string(),
            atoms: Vec::new(),
            lattice,
            pbc,
            symmetry_ops: None,
        }
    }

    pub fn with_atom(mut self, element_id: usize, position: Point3<f64>) -> Self {
        self.atoms.push(Atom::new(element_id, position));
        self
    }

    /// Adds an atom given in fractional coordinates.
    pub fn with_scaled_atom(mut self, element_id: usize, frac: Point3<f64>) -> Self {
        let position = self.lattice.to_cartesian(&frac);
        self.atoms.push(Atom::new(element_id, position));
        self
    }

    pub fn with_symmetry_ops(mut self, ops: Vec<SymOp>) -> Self {
        self.symmetry_ops = Some(ops);
        self
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Number of Cartesian degrees of freedom (3N).
    pub fn dof(&self) -> usize {
        3 * self.atoms.len()
    }

    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    pub fn scaled_positions(&self) -> Vec<Point3<f64>> {
        self.atoms
            .iter()
            .map(|a| self.lattice.to_fractional(&a.position))
            .collect()
    }

    /// Shifts every atom by the matching vector of `dx`.
    pub fn displace(&mut self, dx: &[Vector3<f64>]) {
        for (atom, d) in self.atoms.iter_mut().zip(dx) {
            atom.position += d;
        }
    }

    /// Wraps positions back into the cell along periodic axes.
    pub fn wrap_into_cell(&mut self) {
        spatial::wrap_into_cell(self);
    }

    /// Symmetry of this crystal: the explicit operations if present,
    /// otherwise the detected ones.
    pub fn symmetry(&self, symprec: f64) -> Result<Symmetry> {
        let ops = match &self.symmetry_ops {
            Some(ops) => ops.clone(),
            None => symmetry::detect_operations(self, symprec)?,
        };
        Symmetry::new(self, ops)
    }
}

// --- Configuration Types ---

/// Quasi-Newton Hessian update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Symmetric rank-one.
    #[serde(rename = "SR")]
    Sr,
    /// Powell-symmetric-Broyden.
    #[serde(rename = "PSB")]
    Psb,
    #[serde(rename = "BFGS")]
    Bfgs,
}

impl FromStr for UpdateMode {
    type Err = QnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SR" => Ok(Self::Sr),
            "PSB" => Ok(Self::Psb),
            "BFGS" => Ok(Self::Bfgs),
            _ => Err(QnError::UnknownUpdateMode(s.to_string())),
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sr => "SR",
            Self::Psb => "PSB",
            Self::Bfgs => "BFGS",
        };
        f.write_str(name)
    }
}

/// Starting Hessian: a multiple of the identity or a full (3N)² matrix,
/// row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HessianSeed {
    Scale(f64),
    Matrix(Vec<f64>),
}

impl Default for HessianSeed {
    fn default() -> Self {
        Self::Scale(10.0)
    }
}

/// Soft direction at one atom that the seed Hessian is biased along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionBias {
    pub atom: usize,
    pub direction: Vector3<f64>,
}

/// Settings of the engine alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuasiNewtonParams {
    pub starting_h: HessianSeed,
    pub diffusion: Option<DiffusionBias>,
    pub use_eigenvalues: bool,
    pub regularization: f64,
    pub symmetrize: bool,
    pub symprec: f64,
}

impl Default for QuasiNewtonParams {
    fn default() -> Self {
        Self {
            starting_h: HessianSeed::default(),
            diffusion: None,
            use_eigenvalues: true,
            regularization: 1e-6,
            symmetrize: true,
            symprec: 1e-5,
        }
    }
}

/// Settings of a full relaxation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxParams {
    pub mode: UpdateMode,
    pub ionic_steps: usize,
    pub ionic_force_tolerance: f64,
    /// Accepted for compatibility; no stopping criterion uses it.
    pub ionic_energy_tolerance: f64,
    pub min_displacement: f64,
    /// Denominator floor of the SR update.
    pub threshold: f64,
    #[serde(flatten)]
    pub engine: QuasiNewtonParams,
}

impl Default for RelaxParams {
    fn default() -> Self {
        Self {
            mode: UpdateMode::Psb,
            ionic_steps: 100,
            ionic_force_tolerance: 1.0e-2,
            ionic_energy_tolerance: 0.0,
            min_displacement: 1.0e-8,
            threshold: 1.0e-4,
            engine: QuasiNewtonParams::default(),
        }
    }
}

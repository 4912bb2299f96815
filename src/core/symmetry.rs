use log::debug;
use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::Crystal;
use crate::core::error::{QnError, Result};
use crate::core::spatial;

/// Margin used when wrapping mapped positions into [0, 1).
const WRAP_EPSILON: f64 = 1.0e-8;

/// Two transformed fields closer than this are the same image.
const IMAGE_TOLERANCE: f64 = 1.0e-10;

/// A space-group operation acting on fractional coordinates: `x' = W x + t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymOp {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl SymOp {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    pub fn apply(&self, frac: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * frac.coords + self.translation)
    }
}

/// Symmetry operations of one crystal together with the atom permutation
/// each operation induces.
#[derive(Debug, Clone)]
pub struct Symmetry {
    ops: Vec<SymOp>,
    /// Rotations expressed in Cartesian coordinates, `L W L⁻¹`.
    cartesian_rotations: Vec<Matrix3<f64>>,
    /// `indices[atom][op]` is the atom that `op` maps `atom` onto.
    indices: Vec<Vec<usize>>,
}

impl Symmetry {
    /// Builds the atom map of `ops` on `crystal`.
    ///
    /// Every mapped position is wrapped into the cell along periodic axes and
    /// matched to the nearest atom of the same species. Operations that do not
    /// induce a permutation are rejected.
    pub fn new(crystal: &Crystal, ops: Vec<SymOp>) -> Result<Self> {
        let ops = if ops.is_empty() { vec![SymOp::identity()] } else { ops };
        let frac = crystal.scaled_positions();
        let pbc = crystal.pbc;

        let mut indices = vec![Vec::with_capacity(ops.len()); frac.len()];
        for (iop, op) in ops.iter().enumerate() {
            let mut hit = vec![false; frac.len()];
            for (iat, x) in frac.iter().enumerate() {
                let mut mapped = op.apply(x);
                for axis in 0..3 {
                    if pbc[axis] {
                        mapped[axis] -= (mapped[axis] + WRAP_EPSILON).floor();
                    }
                }
                let element = crystal.atoms[iat].element_id;
                let target = nearest_atom(crystal, &frac, &mapped, element)
                    .ok_or(QnError::SymmetryMismatch { op: iop })?;
                if hit[target] {
                    return Err(QnError::SymmetryMismatch { op: iop });
                }
                hit[target] = true;
                indices[iat].push(target);
            }
        }

        let lat = &crystal.lattice;
        let cartesian_rotations = ops
            .iter()
            .map(|op| lat.vectors * op.rotation * lat.inverse)
            .collect();

        Ok(Self {
            ops,
            cartesian_rotations,
            indices,
        })
    }

    pub fn operations(&self) -> &[SymOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn indices(&self) -> &[Vec<usize>] {
        &self.indices
    }

    pub fn cartesian_rotation(&self, op: usize) -> &Matrix3<f64> {
        &self.cartesian_rotations[op]
    }

    /// Image of a per-atom vector field under operation `op`: atoms are
    /// permuted by the atom map and every vector is rotated.
    pub fn transform(&self, field: &[Vector3<f64>], op: usize) -> Vec<Vector3<f64>> {
        let rot = &self.cartesian_rotations[op];
        let mut image = vec![Vector3::zeros(); field.len()];
        for (iat, v) in field.iter().enumerate() {
            image[self.indices[iat][op]] = rot * v;
        }
        image
    }

    /// Symmetry images of `field`.
    ///
    /// With `selection`, returns the images of exactly those operations.
    /// Without it, returns the distinct images in order of first occurrence
    /// along with the operations that produced them, so the same selection
    /// can later be replayed on a response field.
    pub fn equivalent_vectors(
        &self,
        field: &[Vector3<f64>],
        selection: Option<&[usize]>,
    ) -> (Vec<Vec<Vector3<f64>>>, Vec<usize>) {
        if let Some(ops) = selection {
            let images = ops.iter().map(|&op| self.transform(field, op)).collect();
            return (images, ops.to_vec());
        }

        let mut images: Vec<Vec<Vector3<f64>>> = Vec::new();
        let mut selected = Vec::new();
        for op in 0..self.ops.len() {
            let image = self.transform(field, op);
            let seen = images.iter().any(|kept| same_field(kept, &image));
            if !seen {
                images.push(image);
                selected.push(op);
            }
        }
        (images, selected)
    }

    /// Projects a vector field onto its symmetric part (mean over all images).
    pub fn symmetrize_vectors(&self, field: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        let mut acc = vec![Vector3::zeros(); field.len()];
        for op in 0..self.ops.len() {
            for (a, v) in acc.iter_mut().zip(self.transform(field, op)) {
                *a += v;
            }
        }
        let n = self.ops.len() as f64;
        acc.iter_mut().for_each(|a| *a /= n);
        acc
    }
}

fn same_field(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| (x - y).amax() < IMAGE_TOLERANCE)
}

fn nearest_atom(
    crystal: &Crystal,
    frac: &[Point3<f64>],
    target: &Point3<f64>,
    element: usize,
) -> Option<usize> {
    frac.iter()
        .enumerate()
        .filter(|(i, _)| crystal.atoms[*i].element_id == element)
        .map(|(i, x)| (i, spatial::fractional_distance_sq(x, target, crystal.pbc)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

// --- Detection ---

/// Finds the space-group operations of `crystal` by brute force.
///
/// Candidate rotations are the integer matrices with entries in {-1, 0, 1}
/// and unit determinant that preserve the lattice metric. For each, every
/// translation that carries the first atom onto an atom of the same species
/// is tried; an operation is kept when it maps the whole atom set onto itself
/// within `symprec` (Cartesian distance). The identity is always first.
pub fn detect_operations(crystal: &Crystal, symprec: f64) -> Result<Vec<SymOp>> {
    if crystal.is_empty() {
        return Ok(vec![SymOp::identity()]);
    }
    let lat = &crystal.lattice;
    if lat.vectors.determinant().abs() < f64::EPSILON {
        return Err(QnError::SingularLattice);
    }

    let symprec = if symprec > 0.0 { symprec } else { 1.0e-5 };
    let frac = crystal.scaled_positions();
    let pbc = crystal.pbc;
    let metric = lat.metric();
    let metric_tol = symprec * 10.0 * metric.amax().max(1.0);

    let mut rotations = lattice_rotations(&metric, metric_tol);
    // Identity first so it is selected first whenever images coincide.
    if let Some(pos) = rotations.iter().position(|w| *w == Matrix3::identity()) {
        let id = rotations.remove(pos);
        rotations.insert(0, id);
    }

    let reference = &frac[0];
    let ref_element = crystal.atoms[0].element_id;
    let mut ops = Vec::new();

    for w in rotations {
        for (j, xj) in frac.iter().enumerate() {
            if crystal.atoms[j].element_id != ref_element {
                continue;
            }
            let mut t = xj.coords - w * reference.coords;
            for axis in 0..3 {
                if pbc[axis] {
                    t[axis] -= (t[axis] + WRAP_EPSILON).floor();
                }
            }
            let op = SymOp::new(w, t);
            if maps_onto_itself(crystal, &frac, &op, symprec)
                && !ops.iter().any(|o: &SymOp| o.rotation == op.rotation && same_translation(o, &op, pbc))
            {
                ops.push(op);
            }
        }
    }

    debug!("Detected {} symmetry operations for '{}'", ops.len(), crystal.name);
    Ok(ops)
}

fn lattice_rotations(metric: &Matrix3<f64>, tol: f64) -> Vec<Matrix3<f64>> {
    const VALUES: [f64; 3] = [-1.0, 0.0, 1.0];
    let mut found = Vec::new();
    for code in 0..3usize.pow(9) {
        let mut w = Matrix3::zeros();
        let mut c = code;
        for k in 0..9 {
            w[(k / 3, k % 3)] = VALUES[c % 3];
            c /= 3;
        }
        if (w.determinant().abs() - 1.0).abs() > 1e-8 {
            continue;
        }
        if (w.transpose() * metric * w - metric).amax() < tol {
            found.push(w);
        }
    }
    found
}

fn maps_onto_itself(crystal: &Crystal, frac: &[Point3<f64>], op: &SymOp, symprec: f64) -> bool {
    let lat = &crystal.lattice;
    frac.iter().enumerate().all(|(i, x)| {
        let mapped = op.apply(x);
        frac.iter().enumerate().any(|(j, y)| {
            if crystal.atoms[j].element_id != crystal.atoms[i].element_id {
                return false;
            }
            let mut d = y - mapped;
            for axis in 0..3 {
                if crystal.pbc[axis] {
                    d[axis] -= d[axis].round();
                }
            }
            (lat.vectors * d).norm() < symprec
        })
    })
}

fn same_translation(a: &SymOp, b: &SymOp, pbc: [bool; 3]) -> bool {
    spatial::fractional_distance_sq(&Point3::from(a.translation), &Point3::from(b.translation), pbc)
        < 1e-12
}

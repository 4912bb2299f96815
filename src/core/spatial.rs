use nalgebra::{Point3, Vector3};

use crate::core::domain::{Crystal, Lattice};

/// Minimum-image displacement `p2 - p1`, applied only along periodic axes.
#[inline]
pub fn min_image_delta(
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    lattice: &Lattice,
    pbc: [bool; 3],
) -> Vector3<f64> {
    let d_cart = p2 - p1;
    if !pbc.iter().any(|&p| p) {
        return d_cart;
    }

    // Periodic: wrap fractional delta to [-0.5, 0.5]
    let mut d_frac = lattice.inverse * d_cart;
    for axis in 0..3 {
        if pbc[axis] {
            d_frac[axis] -= d_frac[axis].round();
        }
    }
    lattice.vectors * d_frac
}

/// Squared minimum-image distance.
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, lattice: &Lattice, pbc: [bool; 3]) -> f64 {
    min_image_delta(p1, p2, lattice, pbc).norm_squared()
}

/// Squared distance between two fractional points, wrapped along periodic axes.
#[inline]
pub fn fractional_distance_sq(a: &Point3<f64>, b: &Point3<f64>, pbc: [bool; 3]) -> f64 {
    let mut d = b - a;
    for axis in 0..3 {
        if pbc[axis] {
            d[axis] -= d[axis].round();
        }
    }
    d.norm_squared()
}

/// Moves atoms into the primary unit cell along periodic axes.
///
/// **Invariant**: Modifies positions in-place. Does NOT reorder atoms.
pub fn wrap_into_cell(crystal: &mut Crystal) {
    let pbc = crystal.pbc;
    if !pbc.iter().any(|&p| p) {
        return;
    }

    let lat = &crystal.lattice;
    for atom in &mut crystal.atoms {
        let mut frac = lat.to_fractional(&atom.position);
        for axis in 0..3 {
            if pbc[axis] {
                let w = frac.coords[axis].rem_euclid(1.0);
                // rem_euclid rounds tiny negatives up to exactly 1.0
                frac.coords[axis] = if w >= 1.0 { 0.0 } else { w };
            }
        }
        atom.position = lat.to_cartesian(&frac);
    }
}

/// Largest per-atom Euclidean norm of a vector field (0 for an empty field).
///
/// NaN anywhere in the field yields NaN.
pub fn max_norm(field: &[Vector3<f64>]) -> f64 {
    field.iter().map(|v| v.norm()).fold(0.0f64, |acc, n| {
        if acc.is_nan() || n.is_nan() {
            f64::NAN
        } else {
            acc.max(n)
        }
    })
}

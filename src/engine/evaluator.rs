use crate::core::domain::Crystal;
use anyhow::Result;
use nalgebra::Vector3;

/// The result of a physical evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// The potential energy (eV).
    pub energy: f64,
    /// Per-atom forces (eV/Å), in atom order.
    pub forces: Vec<Vector3<f64>>,
}

impl EvaluationResult {
    /// Largest per-atom force norm.
    pub fn max_force(&self) -> f64 {
        crate::core::spatial::max_norm(&self.forces)
    }
}

/// A generic interface for physics engines.
/// Implementations must be Thread-Safe (Sync).
pub trait Evaluator: Send + Sync {
    /// Computes energy and forces of a structure without moving it.
    fn evaluate(&self, crystal: &Crystal) -> Result<EvaluationResult>;

    /// Returns the name of the engine (e.g., "Harmonic").
    fn name(&self) -> &str;
}

use serde::{Deserialize, Serialize};

/// Statistics of one ionic step.
/// Used for telemetry and progress reporting.
#[derive(Debug, Clone, Default)]
pub struct StepStats {
    pub step: usize,
    pub energy: f64,
    pub max_force: f64,    // eV/Å
    pub max_displacement: f64, // Å, 0 for the initial evaluation
}

/// Why a relaxation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Largest force fell below the force tolerance.
    Converged,
    /// Proposed step fell below the minimum displacement. Not a convergence
    /// guarantee: inspect the final forces.
    Stalled,
    /// Step budget exhausted.
    MaxStepsReached,
}

/// Events emitted by solvers to an observer.
#[derive(Debug, Clone)]
pub enum RelaxEvent {
    /// Diagnostic log message.
    Log(String),

    /// A completed ionic step.
    StepUpdate(StepStats),

    /// Solver has finished its run.
    Finished(Termination),
}

pub mod quasi_newton;
pub mod relax;

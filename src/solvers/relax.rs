use std::sync::Arc;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use nalgebra::Vector3;

use crate::core::domain::{Crystal, RelaxParams};
use crate::core::spatial;
use crate::engine::evaluator::Evaluator;
use crate::solvers::quasi_newton::QuasiNewton;
use crate::solvers::{RelaxEvent, StepStats, Termination};

/// Energy and forces recorded after one evaluation.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub energy: f64,
    pub forces: Vec<Vector3<f64>>,
    pub max_force: f64,
    /// Largest per-atom move that led to this geometry (None for the start).
    pub max_displacement: Option<f64>,
}

/// Outcome of a relaxation. The engine is handed back so the learned
/// Hessian can be reused.
#[derive(Debug, Clone)]
pub struct RelaxReport {
    pub termination: Termination,
    pub steps: Vec<StepRecord>,
    pub engine: QuasiNewton,
}

impl RelaxReport {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    pub fn final_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn final_energy(&self) -> Option<f64> {
        self.final_step().map(|s| s.energy)
    }

    pub fn final_max_force(&self) -> Option<f64> {
        self.final_step().map(|s| s.max_force)
    }

    /// Number of geometry updates performed.
    pub fn ionic_steps(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

/// Drives an evaluator and a `QuasiNewton` engine until the forces vanish,
/// the proposed steps vanish, or the step budget runs out.
pub struct QuasiNewtonRelaxer {
    evaluator: Arc<dyn Evaluator>,
    params: RelaxParams,
    tx: Option<Sender<RelaxEvent>>,
}

impl QuasiNewtonRelaxer {
    pub fn new(evaluator: Arc<dyn Evaluator>, params: RelaxParams) -> Self {
        Self {
            evaluator,
            params,
            tx: None,
        }
    }

    /// Reports progress on `tx` in addition to the log.
    pub fn with_events(mut self, tx: Sender<RelaxEvent>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn params(&self) -> &RelaxParams {
        &self.params
    }

    /// Relaxes `crystal` in place.
    pub fn relax(&self, crystal: &mut Crystal) -> Result<RelaxReport> {
        let p = &self.params;
        let mut engine = QuasiNewton::new(crystal, &p.engine)
            .context("Failed to initialize quasi-Newton engine")?;

        info!(
            "Relaxing '{}' ({} atoms) with {} using {}: max {} steps, force tol {:.3e}",
            crystal.name,
            crystal.len(),
            self.evaluator.name(),
            p.mode,
            p.ionic_steps,
            p.ionic_force_tolerance
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(RelaxEvent::Log(format!(
                "Relaxing {} atoms with {} ({})",
                crystal.len(),
                self.evaluator.name(),
                p.mode
            )));
        }
        if p.ionic_energy_tolerance > 0.0 {
            debug!(
                "Energy tolerance {:.3e} is recorded but not used as a stopping criterion",
                p.ionic_energy_tolerance
            );
        }

        let mut steps = vec![self.evaluate(crystal)?];
        self.report(0, &steps[0]);
        let mut termination = Termination::MaxStepsReached;

        for i in 1..=p.ionic_steps {
            let current = &steps[steps.len() - 1];
            if current.max_force < p.ionic_force_tolerance {
                termination = Termination::Converged;
                break;
            }

            let gradient: Vec<Vector3<f64>> = current.forces.iter().map(|f| -f).collect();
            let dx = engine
                .propose_step(&gradient, p.threshold, p.mode)
                .with_context(|| format!("Step proposal failed at step {}", i))?;

            let max_dx = spatial::max_norm(&dx);
            if !max_dx.is_finite() {
                bail!("Non-finite step proposed at step {}", i);
            }
            if max_dx < p.min_displacement {
                warn!(
                    "Proposed step {:.3e} below minimum displacement {:.3e}; stopping at max force {:.3e}",
                    max_dx, p.min_displacement, current.max_force
                );
                termination = Termination::Stalled;
                break;
            }

            crystal.displace(&dx);
            crystal.wrap_into_cell();

            let mut record = self.evaluate(crystal)?;
            record.max_displacement = Some(max_dx);
            self.report(i, &record);
            steps.push(record);
        }

        match termination {
            Termination::Converged => info!("Optimization converged after {} steps", steps.len() - 1),
            Termination::Stalled => info!("Optimization stalled after {} steps", steps.len() - 1),
            Termination::MaxStepsReached => info!(
                "Optimization reached maximum number of steps ({}) without converging",
                p.ionic_steps
            ),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(RelaxEvent::Finished(termination));
        }

        Ok(RelaxReport {
            termination,
            steps,
            engine,
        })
    }

    fn evaluate(&self, crystal: &Crystal) -> Result<StepRecord> {
        let res = self
            .evaluator
            .evaluate(crystal)
            .with_context(|| format!("{} evaluation failed", self.evaluator.name()))?;
        if res.forces.len() != crystal.len() {
            bail!(
                "{} returned {} forces for {} atoms",
                self.evaluator.name(),
                res.forces.len(),
                crystal.len()
            );
        }
        let max_force = res.max_force();
        if !res.energy.is_finite() || !max_force.is_finite() {
            bail!(
                "{} returned non-finite results (E = {}, max |F| = {})",
                self.evaluator.name(),
                res.energy,
                max_force
            );
        }
        Ok(StepRecord {
            energy: res.energy,
            max_force,
            forces: res.forces,
            max_displacement: None,
        })
    }

    fn report(&self, step: usize, record: &StepRecord) {
        debug!(
            "Step {}: E = {:.10}, max |F| = {:.6e}",
            step, record.energy, record.max_force
        );
        if let Some(tx) = &self.tx {
            let stats = StepStats {
                step,
                energy: record.energy,
                max_force: record.max_force,
                max_displacement: record.max_displacement.unwrap_or(0.0),
            };
            let _ = tx.send(RelaxEvent::StepUpdate(stats));
        }
    }
}

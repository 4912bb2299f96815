use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nalgebra::{DMatrix, Point3, Vector3};
use tracing_subscriber::filter::LevelFilter;

use qn_relax::analysis::hessian::estimate_hessian;
use qn_relax::core::domain::{Crystal, Lattice, RelaxParams, UpdateMode};
use qn_relax::engine::evaluator::Evaluator;
use qn_relax::engine::harmonic::HarmonicEvaluator;
use qn_relax::solvers::relax::QuasiNewtonRelaxer;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Symmetry-aware quasi-Newton relaxation demo", long_about = None)]
struct Args {
    /// JSON file with relaxation settings (defaults are used when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hessian update rule (SR, PSB, BFGS); overrides the config
    #[arg(short, long)]
    mode: Option<UpdateMode>,

    /// Maximum number of ionic steps; overrides the config
    #[arg(short, long)]
    steps: Option<usize>,

    /// Estimate the finite-difference Hessian instead of relaxing
    #[arg(long)]
    hessian: bool,

    /// Finite-difference displacement (Angstroms)
    #[arg(long, default_value_t = 0.01)]
    dx: f64,

    /// Write the effective settings as JSON and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// --- Initialization Helpers ---

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    // The fmt subscriber also installs the `log` bridge, which carries the
    // library's records.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_params(args: &Args) -> Result<RelaxParams> {
    let mut params = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => RelaxParams::default(),
    };
    if let Some(mode) = args.mode {
        params.mode = mode;
    }
    if let Some(steps) = args.steps {
        params.ionic_steps = steps;
    }
    Ok(params)
}

/// CsCl-type cell (two species, a = 3 Å) with nearest-neighbour coupling.
fn create_default_system() -> (Crystal, DMatrix<f64>) {
    let reference = Crystal::new("CsCl", Lattice::cubic(3.0), [true; 3])
        .with_scaled_atom(0, Point3::new(0.0, 0.0, 0.0))
        .with_scaled_atom(1, Point3::new(0.5, 0.5, 0.5));

    // Block [[a, -b], [-b, a]] on every Cartesian axis
    let (a, b) = (4.0, 1.5);
    let k = DMatrix::from_fn(6, 6, |i, j| match (i % 3 == j % 3, i / 3 == j / 3) {
        (true, true) => a,
        (true, false) => -b,
        _ => 0.0,
    });
    (reference, k)
}

// --- Main ---

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let params = load_params(&args)?;
    if let Some(path) = &args.write_config {
        let text = serde_json::to_string_pretty(&params)?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Settings written to {}", path.display());
        return Ok(());
    }

    let (reference, k) = create_default_system();
    let evaluator: Arc<dyn Evaluator> = Arc::new(HarmonicEvaluator::new(&reference, k)?);

    if args.hessian {
        let h = estimate_hessian(evaluator.as_ref(), &reference, args.dx, params.engine.symprec)?;
        println!("Estimated Hessian ({}x{}):", h.nrows(), h.ncols());
        println!("{:.6}", h);
        return Ok(());
    }

    let mut crystal = reference.clone();
    crystal.displace(&[Vector3::new(0.08, -0.03, 0.05), Vector3::new(-0.02, 0.06, 0.01)]);
    info!("Start geometry displaced from the reference minimum");

    let relaxer = QuasiNewtonRelaxer::new(evaluator, params);
    let report = relaxer.relax(&mut crystal)?;

    println!(
        "{:?} after {} steps: E = {:.10}, max |F| = {:.3e}",
        report.termination,
        report.ionic_steps(),
        report.final_energy().unwrap_or(f64::NAN),
        report.final_max_force().unwrap_or(f64::NAN)
    );
    for (i, atom) in crystal.atoms.iter().enumerate() {
        let p = atom.position;
        println!("  Atom {}: [{:10.6}, {:10.6}, {:10.6}]", i, p.x, p.y, p.z);
    }
    Ok(())
}

//! Quasi-Newton relaxation of periodic atomistic structures, with a
//! symmetry-reduced finite-difference Hessian estimator.

pub mod core {
    pub mod domain;
    pub mod error;
    pub mod spatial;
    pub mod symmetry;
}

pub mod engine {
    pub mod evaluator;
    pub mod harmonic;
}

pub mod analysis {
    pub mod hessian;
}

pub mod solvers;

pub use crate::core::error::{QnError, Result};

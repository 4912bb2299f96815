use thiserror::Error;

/// Failures raised by the symmetry, Hessian and quasi-Newton machinery.
///
/// Precondition violations are reported as soon as they are detected;
/// numerical failures (singular matrices) are surfaced without retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QnError {
    #[error("Hessian of {len} elements cannot be reshaped to {expected}x{expected}")]
    InvalidHessianShape { len: usize, expected: usize },

    #[error("invalid diffusion bias: {0}")]
    InvalidDiffusion(String),

    #[error("regularization must be larger than 0 when eigenvalues are used")]
    ZeroRegularization,

    #[error("mode not recognized: {0}. Choose from `SR`, `PSB` and `BFGS`")]
    UnknownUpdateMode(String),

    #[error("gradient has {got} atoms, structure has {expected}")]
    GradientShapeMismatch { got: usize, expected: usize },

    #[error("force shape does not match displacement shape: expected {expected_steps}x{expected_atoms}, got {got_steps}x{got_atoms}")]
    ForceShapeMismatch {
        expected_steps: usize,
        expected_atoms: usize,
        got_steps: usize,
        got_atoms: usize,
    },

    #[error("forces not set yet")]
    ForcesNotSet,

    #[error("singular matrix in {0}")]
    SingularMatrix(&'static str),

    #[error("symmetry operation {op} does not map atoms one-to-one")]
    SymmetryMismatch { op: usize },

    #[error("lattice vectors are linearly dependent")]
    SingularLattice,
}

pub type Result<T> = std::result::Result<T, QnError>;

use std::fmt;

/// Raised by an equation system when it cannot be evaluated at the current values
/// (e.g. a logarithm of a negative number or a table lookup out of range).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Which dense solve reported a zero pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSystemKind {
    Linear,
    LinearTearing,
    NewtonStep,
    QuadraticModel,
}

impl fmt::Display for LinearSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinearSystemKind::Linear => "linear system",
            LinearSystemKind::LinearTearing => "linear tearing system",
            LinearSystemKind::NewtonStep => "nonlinear system",
            LinearSystemKind::QuadraticModel => "line search model",
        };
        f.write_str(name)
    }
}

/// Failures of the algebraic loop solver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("error solving nonlinear system (iteration limit: {iterations})")]
    IterationLimitExceeded { iterations: usize },

    #[error("error solving {kind} (iteration: {iteration}, zero pivot: {pivot})")]
    SingularLinearSystem {
        kind: LinearSystemKind,
        iteration: usize,
        pivot: usize,
    },

    #[error("no feasible step found (lambda: {lambda:e}): {source}")]
    InfeasibleEvaluation { lambda: f64, source: DomainError },

    #[error("can't get sufficient decrease of solution (lambda: {lambda:e})")]
    InsufficientDecrease { lambda: f64 },

    #[error("evaluation of algebraic loop failed: {0}")]
    Evaluation(#[from] DomainError),

    #[error("invalid solver settings: {0}")]
    InvalidSettings(String),
}

pub type SolverResult<T> = Result<T, SolverError>;

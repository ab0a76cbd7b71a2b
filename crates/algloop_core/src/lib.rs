/// The `algloop_core` crate solves the algebraic loops of a time-domain simulation
/// with a damped Newton method.
///
/// Key components:
/// - **Traits**: `EquationSystem`, the loop as seen by the solver (values, residual,
///   nominal values, bounds, optional analytic Jacobian).
/// - **Newton**: `NewtonSolver`, dispatching between linear, linear tearing and
///   nonlinear loops.
/// - **Jacobian**: scaled analytic or forward-difference Jacobians.
/// - **Line search**: feasibility backtracking plus a quadratic merit model.
/// - **Diagnostics**: structured records pushed into an injected sink.
pub mod diagnostics;
pub mod error;
pub mod jacobian;
pub mod line_search;
pub mod linalg;
pub mod newton;
pub mod settings;
pub mod traits;
mod workspace;

pub use diagnostics::{
    Category, DiagnosticRecord, DiagnosticsSink, FieldValue, Level, MemorySink, NullSink,
    TracingSink,
};
pub use error::{DomainError, LinearSystemKind, SolverError, SolverResult};
pub use jacobian::JacobianSource;
pub use linalg::{DenseLinearSolver, PartialPivLu, SingularMatrix};
pub use newton::{IterationStatus, NewtonSolver, SolveReport};
pub use settings::NewtonSettings;
pub use traits::EquationSystem;

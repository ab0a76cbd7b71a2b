use nalgebra::DMatrix;

use crate::error::DomainError;

/// An algebraic loop: a block of equations that has to be solved simultaneously.
///
/// The solver talks to the loop only through this trait. Values are pushed with
/// `set_values`, `evaluate` recomputes the loop's internal state and `residual`
/// reads the result back.
///
/// Sign conventions:
/// - nonlinear loops return `f(y)` and are solved for `f(y) = 0`.
/// - untorn linear loops return the right-hand side `b` of `A y = b`, with `A`
///   available from `system_matrix`.
/// - linear tearing loops return `A y - b`; they are solved for a correction
///   about the zero vector.
pub trait EquationSystem {
    /// Number of real unknowns.
    fn dimension(&self) -> usize;

    /// Writes the current values of the unknowns into `out`.
    fn values(&self, out: &mut [f64]);

    /// Overwrites the unknowns.
    fn set_values(&mut self, y: &[f64]);

    /// Recomputes the loop at the current values.
    /// Returns a `DomainError` if the equations are undefined there.
    fn evaluate(&mut self) -> Result<(), DomainError>;

    /// Writes the residual of the last evaluation into `out`.
    fn residual(&self, out: &mut [f64]);

    /// (Re-)initializes the loop. Called before the dimension is queried.
    fn initialize(&mut self) {}

    /// Display names of the unknowns, `y0`, `y1`, ... by default.
    fn names(&self) -> Vec<String> {
        (0..self.dimension()).map(|i| format!("y{i}")).collect()
    }

    /// Typical magnitudes used to scale the unknowns. Defaults to 1.
    fn nominal(&self, out: &mut [f64]) {
        out.fill(1.0);
    }

    /// Lower bounds. Unbounded by default.
    fn min(&self, out: &mut [f64]) {
        out.fill(f64::NEG_INFINITY);
    }

    /// Upper bounds. Unbounded by default.
    fn max(&self, out: &mut [f64]) {
        out.fill(f64::INFINITY);
    }

    /// The loop is linear in its unknowns. Nonlinear by default.
    fn is_linear(&self) -> bool {
        false
    }

    /// The loop is linear and returns `A y - b` about the zero vector.
    fn is_linear_tearing(&self) -> bool {
        false
    }

    /// Analytic Jacobian of the residual at the current values.
    ///
    /// `Ok(None)` means the loop does not provide one. A matrix of the wrong shape
    /// and an `Err` are both treated as unavailable and finite differences are used.
    fn system_matrix(&mut self) -> anyhow::Result<Option<DMatrix<f64>>> {
        Ok(None)
    }

    /// Simulation time, for diagnostics only.
    fn simulation_time(&self) -> f64 {
        0.0
    }

    /// Index of the loop in the model, for diagnostics only.
    fn equation_index(&self) -> usize {
        0
    }
}

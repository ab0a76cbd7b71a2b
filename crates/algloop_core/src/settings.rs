use serde::{Deserialize, Serialize};

use crate::error::{SolverError, SolverResult};

/// Tolerances and iteration cap of the Newton solver.
///
/// A component of the residual counts as converged when
/// `|f_i| <= atol + rtol * f_nominal_i`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub atol: f64,
    pub rtol: f64,
    pub max_iterations: usize,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            atol: 1e-6,
            rtol: 1e-6,
            max_iterations: 50,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> SolverResult<()> {
        if !(self.atol.is_finite() && self.atol > 0.0) {
            return Err(SolverError::InvalidSettings(format!(
                "atol must be positive, got {}",
                self.atol
            )));
        }
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(SolverError::InvalidSettings(format!(
                "rtol must be positive, got {}",
                self.rtol
            )));
        }
        if self.max_iterations == 0 {
            return Err(SolverError::InvalidSettings(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

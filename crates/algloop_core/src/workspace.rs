use nalgebra::{DMatrix, DVector};

use crate::traits::EquationSystem;

/// Buffers sized to the loop dimension, owned by one solver.
///
/// Replaced wholesale when the dimension changes; nothing outside the solver
/// holds a reference into them.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    pub(crate) names: Vec<String>,
    pub(crate) y_nominal: DVector<f64>,
    pub(crate) y_min: DVector<f64>,
    pub(crate) y_max: DVector<f64>,
    pub(crate) y: DVector<f64>,
    pub(crate) f: DVector<f64>,
    pub(crate) f_nominal: DVector<f64>,
    pub(crate) y_help: DVector<f64>,
    pub(crate) f_help: DVector<f64>,
    pub(crate) y_test: DVector<f64>,
    pub(crate) f_test: DVector<f64>,
    pub(crate) step: DVector<f64>,
    pub(crate) jac: DMatrix<f64>, // column-major, dim x dim
}

impl Workspace {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            names: Vec::with_capacity(dim),
            y_nominal: DVector::from_element(dim, 1.0),
            y_min: DVector::from_element(dim, f64::NEG_INFINITY),
            y_max: DVector::from_element(dim, f64::INFINITY),
            y: DVector::zeros(dim),
            f: DVector::zeros(dim),
            f_nominal: DVector::zeros(dim),
            y_help: DVector::zeros(dim),
            f_help: DVector::zeros(dim),
            y_test: DVector::zeros(dim),
            f_test: DVector::zeros(dim),
            step: DVector::zeros(dim),
            jac: DMatrix::zeros(dim, dim),
        }
    }

    /// Allocates for the system's dimension and pulls names, nominal values and bounds.
    pub(crate) fn for_system<S: EquationSystem + ?Sized>(system: &S, dim: usize) -> Self {
        let mut ws = Self::new(dim);
        ws.names = system.names();
        ws.names.resize_with(dim, String::new);
        system.nominal(ws.y_nominal.as_mut_slice());
        system.min(ws.y_min.as_mut_slice());
        system.max(ws.y_max.as_mut_slice());
        ws
    }

    pub(crate) fn dimension(&self) -> usize {
        self.y.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    struct Bounded;

    impl EquationSystem for Bounded {
        fn dimension(&self) -> usize {
            2
        }
        fn values(&self, out: &mut [f64]) {
            out.fill(0.0);
        }
        fn set_values(&mut self, _y: &[f64]) {}
        fn evaluate(&mut self) -> Result<(), DomainError> {
            Ok(())
        }
        fn residual(&self, out: &mut [f64]) {
            out.fill(0.0);
        }
        fn nominal(&self, out: &mut [f64]) {
            out.copy_from_slice(&[2.0, 3.0]);
        }
        fn max(&self, out: &mut [f64]) {
            out.copy_from_slice(&[10.0, 20.0]);
        }
    }

    #[test]
    fn pulls_static_data_from_system() {
        let ws = Workspace::for_system(&Bounded, 2);
        assert_eq!(ws.dimension(), 2);
        assert_eq!(ws.names, vec!["y0".to_string(), "y1".to_string()]);
        assert_eq!(ws.y_nominal.as_slice(), &[2.0, 3.0]);
        assert_eq!(ws.y_min[0], f64::NEG_INFINITY);
        assert_eq!(ws.y_max.as_slice(), &[10.0, 20.0]);
        assert_eq!(ws.jac.shape(), (2, 2));
    }
}

use nalgebra::{DMatrix, DVector};

/// The dense factorization hit an exactly zero pivot.
///
/// `pivot` is the 1-based column of the first zero pivot, in the spirit of
/// LAPACK's `info` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("matrix is singular (zero pivot in column {pivot})")]
pub struct SingularMatrix {
    pub pivot: usize,
}

/// Factors a square dense matrix and solves for one right-hand side.
pub trait DenseLinearSolver {
    /// Solves `matrix * x = rhs`, overwriting `rhs` with `x`.
    /// `rhs` is left unspecified when an error is returned.
    fn solve(&mut self, matrix: &DMatrix<f64>, rhs: &mut DVector<f64>)
        -> Result<(), SingularMatrix>;
}

/// LU decomposition with partial pivoting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialPivLu;

impl DenseLinearSolver for PartialPivLu {
    fn solve(
        &mut self,
        matrix: &DMatrix<f64>,
        rhs: &mut DVector<f64>,
    ) -> Result<(), SingularMatrix> {
        let lu = matrix.clone().lu();
        let u = lu.u();
        let n = u.nrows().min(u.ncols());
        if let Some(col) = (0..n).find(|&i| u[(i, i)] == 0.0) {
            return Err(SingularMatrix { pivot: col + 1 });
        }
        if !lu.solve_mut(rhs) {
            return Err(SingularMatrix { pivot: n });
        }
        Ok(())
    }
}

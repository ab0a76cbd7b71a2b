//! Step damping for the nonlinear Newton branch.
//!
//! A full Newton step is first shortened until the loop can be evaluated at the
//! (bound-clipped) trial point. The step length is then refined by minimizing a
//! quadratic model of the merit function `phi(lambda) = |f(y - lambda * dy) / f_nominal|^2`
//! through the points `0`, `lambda / 2` and `lambda`, until
//! `phi(lambda) <= (1 - ALPHA * lambda) * phi(0)`.
//!
//! See C. T. Kelley, *Solving Nonlinear Equations with Newton's Method*,
//! SIAM 2003, for the safeguarded parabolic line search.

use nalgebra::{DMatrix, DVector};

use crate::diagnostics::{DiagnosticsSink, Emitter, FieldValue, Level};
use crate::error::{LinearSystemKind, SolverError, SolverResult};
use crate::jacobian::evaluate_residual;
use crate::linalg::DenseLinearSolver;
use crate::newton::SolveReport;
use crate::settings::NewtonSettings;
use crate::traits::EquationSystem;
use crate::workspace::Workspace;

/// Guard for sufficient decrease.
pub const ALPHA: f64 = 1e-4;

/// Smallest step length tried before giving up.
pub const MIN_LAMBDA: f64 = 1e-10;

/// Result of one damping episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DampedStep {
    pub lambda: f64,
    /// Scaled merit of the accepted point.
    pub phi: f64,
    /// The accepted point already satisfies the convergence test.
    pub converged: bool,
    /// The loop was last evaluated at the accepted point.
    pub system_synced: bool,
}

/// `|f_i| <= atol + rtol * f_nominal_i` for every component.
pub(crate) fn is_converged(
    f: &DVector<f64>,
    f_nominal: &DVector<f64>,
    settings: &NewtonSettings,
) -> bool {
    f.iter()
        .zip(f_nominal.iter())
        .all(|(fi, nom)| fi.abs() <= settings.atol + settings.rtol * nom)
}

/// Divides `f` by `f_nominal` in place and returns the sum of squares.
pub(crate) fn scale_merit(f: &mut DVector<f64>, f_nominal: &DVector<f64>) -> f64 {
    let mut phi = 0.0;
    for (fi, nom) in f.iter_mut().zip(f_nominal.iter()) {
        *fi /= nom;
        phi += *fi * *fi;
    }
    phi
}

/// `out = clip(y - lambda * step, y_min, y_max)`.
fn trial_point(
    y: &DVector<f64>,
    step: &DVector<f64>,
    lambda: f64,
    y_min: &DVector<f64>,
    y_max: &DVector<f64>,
    out: &mut DVector<f64>,
) {
    for i in 0..y.len() {
        out[i] = (y[i] - lambda * step[i]).max(y_min[i]).min(y_max[i]);
    }
}

/// Step length minimizing the parabola through `(0, phi)`, `(lambda_test, phi_test)`
/// and `(lambda, phi_trial)`, bounded below by `lambda / 10`.
fn quadratic_model_step<L: DenseLinearSolver>(
    linear: &mut L,
    phi: f64,
    phi_test: f64,
    phi_trial: f64,
    lambda_test: f64,
    lambda: f64,
    iteration: usize,
) -> SolverResult<f64> {
    #[rustfmt::skip]
    let vandermonde = DMatrix::from_row_slice(
        3,
        3,
        &[
            1.0, 0.0, 0.0,
            1.0, lambda_test, lambda_test * lambda_test,
            1.0, lambda, lambda * lambda,
        ],
    );
    let mut coeffs = DVector::from_vec(vec![phi, phi_test, phi_trial]);
    linear
        .solve(&vandermonde, &mut coeffs)
        .map_err(|err| SolverError::SingularLinearSystem {
            kind: LinearSystemKind::QuadraticModel,
            iteration,
            pivot: err.pivot,
        })?;
    // f64::max drops a NaN vertex
    Ok((0.1 * lambda).max(-0.5 * coeffs[1] / coeffs[2]))
}

/// Runs one damping episode.
///
/// Expects `ws.y` at the current iterate, `ws.step` holding the unscaled Newton
/// step and `phi` the scaled merit at `ws.y`. On success the accepted point is in
/// `ws.y` and its unscaled residual in `ws.f`.
pub(crate) fn damp_step<S, D, L>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    linear: &mut L,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
    phi: f64,
) -> SolverResult<DampedStep>
where
    S: EquationSystem + ?Sized,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    let iteration = report.iterations;
    let mut lambda = 1.0;

    // Shorten the step until the loop is defined at the trial point.
    loop {
        trial_point(&ws.y, &ws.step, lambda, &ws.y_min, &ws.y_max, &mut ws.y_help);
        match evaluate_residual(
            system,
            ws.y_help.as_slice(),
            ws.f_help.as_mut_slice(),
            report,
        ) {
            Ok(()) => break,
            Err(source) => {
                if lambda < MIN_LAMBDA {
                    return Err(SolverError::InfeasibleEvaluation { lambda, source });
                }
                em.emit(
                    Level::Debug,
                    format!("infeasible trial point: {source}"),
                    vec![("lambda", FieldValue::Scalar(lambda))],
                );
                lambda *= 0.5;
            }
        }
    }

    let converged = is_converged(&ws.f_help, &ws.f_nominal, settings);
    let mut phi_trial = scale_merit(&mut ws.f_help, &ws.f_nominal);
    let mut system_synced = true;

    // A trial that already converged is taken as is.
    if !converged {
        loop {
            // The half step also bounds the reduction from above.
            let lambda_test = 0.5 * lambda;
            trial_point(&ws.y, &ws.step, lambda_test, &ws.y_min, &ws.y_max, &mut ws.y_test);
            evaluate_residual(
                system,
                ws.y_test.as_slice(),
                ws.f_test.as_mut_slice(),
                report,
            )?;
            system_synced = false;
            let phi_test = scale_merit(&mut ws.f_test, &ws.f_nominal);

            let guard = 1.0 - ALPHA * lambda;
            if !(phi_trial <= guard * phi) || phi_test < guard * phi_trial {
                let lambda_model = quadratic_model_step(
                    linear,
                    phi,
                    phi_test,
                    phi_trial,
                    lambda_test,
                    lambda,
                    iteration,
                )?;
                let next = lambda_model.min(lambda_test);
                if !(next >= MIN_LAMBDA) {
                    return Err(SolverError::InsufficientDecrease { lambda: next });
                }
                if lambda_model >= lambda_test {
                    lambda = lambda_test;
                    std::mem::swap(&mut ws.y_help, &mut ws.y_test);
                    std::mem::swap(&mut ws.f_help, &mut ws.f_test);
                    phi_trial = phi_test;
                } else {
                    lambda = lambda_model;
                    trial_point(&ws.y, &ws.step, lambda, &ws.y_min, &ws.y_max, &mut ws.y_help);
                    evaluate_residual(
                        system,
                        ws.y_help.as_slice(),
                        ws.f_help.as_mut_slice(),
                        report,
                    )?;
                    phi_trial = scale_merit(&mut ws.f_help, &ws.f_nominal);
                }
                system_synced = true;
                em.emit(
                    Level::Debug,
                    "line search",
                    vec![
                        ("lambda", FieldValue::Scalar(lambda)),
                        ("phi", FieldValue::Scalar(phi)),
                        ("phi_trial", FieldValue::Scalar(phi_trial)),
                    ],
                );
            }

            if phi_trial <= (1.0 - ALPHA * lambda) * phi {
                break;
            }
        }
    }

    std::mem::swap(&mut ws.y, &mut ws.y_help);
    for i in 0..ws.f.len() {
        ws.f[i] = ws.f_help[i] * ws.f_nominal[i];
    }

    Ok(DampedStep {
        lambda,
        phi: phi_trial,
        converged,
        system_synced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Category, MemorySink};
    use crate::error::DomainError;
    use crate::linalg::PartialPivLu;

    #[test]
    fn convergence_test_is_componentwise() {
        let settings = NewtonSettings {
            atol: 1e-8,
            rtol: 1e-3,
            max_iterations: 10,
        };
        let nominal = DVector::from_vec(vec![1.0, 100.0]);
        assert!(is_converged(&DVector::from_vec(vec![5e-4, 5e-2]), &nominal, &settings));
        assert!(!is_converged(&DVector::from_vec(vec![2e-3, 5e-2]), &nominal, &settings));
        assert!(!is_converged(&DVector::from_vec(vec![5e-4, 0.2]), &nominal, &settings));
    }

    #[test]
    fn scale_merit_divides_in_place() {
        let mut f = DVector::from_vec(vec![2.0, -6.0]);
        let phi = scale_merit(&mut f, &DVector::from_vec(vec![2.0, 3.0]));
        assert_eq!(f.as_slice(), &[1.0, -2.0]);
        assert_eq!(phi, 5.0);
    }

    #[test]
    fn trial_point_is_clipped_to_bounds() {
        let y = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let step = DVector::from_vec(vec![-10.0, 10.0, 1.0]);
        let lo = DVector::from_vec(vec![-1.0, -1.0, -1.0]);
        let hi = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let mut out = DVector::zeros(3);
        trial_point(&y, &step, 0.5, &lo, &hi, &mut out);
        assert_eq!(out.as_slice(), &[1.0, -1.0, -0.5]);
    }

    #[test]
    fn quadratic_model_finds_vertex_of_exact_parabola() {
        // phi(l) = (l - 0.3)^2 + 1
        let phi = |l: f64| (l - 0.3) * (l - 0.3) + 1.0;
        let lambda =
            quadratic_model_step(&mut PartialPivLu, phi(0.0), phi(0.5), phi(1.0), 0.5, 1.0, 0)
                .expect("model solve");
        assert!((lambda - 0.3).abs() < 1e-12);
    }

    #[test]
    fn quadratic_model_step_is_bounded_below() {
        // vertex at 0.01, clipped to lambda / 10
        let phi = |l: f64| (l - 0.01) * (l - 0.01);
        let lambda =
            quadratic_model_step(&mut PartialPivLu, phi(0.0), phi(0.5), phi(1.0), 0.5, 1.0, 0)
                .expect("model solve");
        assert!((lambda - 0.1).abs() < 1e-12);
    }

    /// f(y) = y^3 - 8, undefined above 5.
    struct Cubic {
        y: f64,
        f: f64,
    }

    impl EquationSystem for Cubic {
        fn dimension(&self) -> usize {
            1
        }
        fn values(&self, out: &mut [f64]) {
            out[0] = self.y;
        }
        fn set_values(&mut self, y: &[f64]) {
            self.y = y[0];
        }
        fn evaluate(&mut self) -> Result<(), DomainError> {
            if self.y > 5.0 {
                return Err(DomainError::new("y out of table range"));
            }
            self.f = self.y.powi(3) - 8.0;
            Ok(())
        }
        fn residual(&self, out: &mut [f64]) {
            out[0] = self.f;
        }
    }

    #[test]
    fn backtracks_into_the_domain_and_decreases_merit() {
        let settings = NewtonSettings::default();
        let mut system = Cubic { y: 0.5, f: 0.0 };
        let mut ws = Workspace::for_system(&system, 1);
        ws.y[0] = 0.5;
        ws.f[0] = 0.5f64.powi(3) - 8.0;
        ws.f_nominal[0] = 0.75;
        // Newton step lands at y = 11
        ws.step[0] = -10.5;
        let phi = (ws.f[0] / 0.75).powi(2);

        let mut sink = MemorySink::default();
        let mut em = Emitter {
            sink: &mut sink,
            category: Category::NonlinearSystem,
            equation_index: 0,
            simulation_time: 0.0,
        };
        let mut report = SolveReport::default();
        let step = damp_step(
            &mut system,
            &mut ws,
            &settings,
            &mut PartialPivLu,
            &mut em,
            &mut report,
            phi,
        )
        .expect("damped step");

        assert!(step.lambda <= 0.25);
        assert!(step.phi < phi);
        assert!(ws.y[0] <= 5.0 && ws.y[0] > 0.5);
        assert!((ws.f[0] - (ws.y[0].powi(3) - 8.0)).abs() < 1e-12);
        assert!(sink.matching("infeasible trial point").count() >= 2);
    }

    #[test]
    fn infeasible_everywhere_is_fatal() {
        struct Undefined;
        impl EquationSystem for Undefined {
            fn dimension(&self) -> usize {
                1
            }
            fn values(&self, out: &mut [f64]) {
                out[0] = 0.0;
            }
            fn set_values(&mut self, _y: &[f64]) {}
            fn evaluate(&mut self) -> Result<(), DomainError> {
                Err(DomainError::new("sqrt of negative pressure"))
            }
            fn residual(&self, _out: &mut [f64]) {}
        }

        let settings = NewtonSettings::default();
        let mut ws = Workspace::for_system(&Undefined, 1);
        ws.f_nominal[0] = 1.0;
        ws.step[0] = 1.0;
        let mut sink = MemorySink::default();
        let mut em = Emitter {
            sink: &mut sink,
            category: Category::NonlinearSystem,
            equation_index: 0,
            simulation_time: 0.0,
        };
        let mut report = SolveReport::default();
        let err = damp_step(
            &mut Undefined,
            &mut ws,
            &settings,
            &mut PartialPivLu,
            &mut em,
            &mut report,
            1.0,
        )
        .expect_err("no feasible point");
        match err {
            SolverError::InfeasibleEvaluation { lambda, source } => {
                assert!(lambda < MIN_LAMBDA);
                assert_eq!(source.message, "sqrt of negative pressure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // lambda = 1, 1/2, ..., down to the first value below the floor
        assert_eq!(report.residual_evaluations, 35);
    }
}

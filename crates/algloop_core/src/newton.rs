use serde::{Deserialize, Serialize};

use crate::diagnostics::{Category, DiagnosticsSink, Emitter, FieldValue, Level, NullSink};
use crate::error::{LinearSystemKind, SolverError, SolverResult};
use crate::jacobian::{build_jacobian, evaluate_residual, JacobianSource};
use crate::line_search::{damp_step, is_converged, scale_merit};
use crate::linalg::{DenseLinearSolver, PartialPivLu};
use crate::settings::NewtonSettings;
use crate::traits::EquationSystem;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IterationStatus {
    #[default]
    Continue,
    Done,
    SolverError,
}

/// Work done by one `solve()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SolveReport {
    pub status: IterationStatus,
    /// Newton steps taken by the nonlinear branch.
    pub iterations: usize,
    pub jacobian_builds: usize,
    pub linear_solves: usize,
    pub residual_evaluations: usize,
}

/// Damped Newton solver for one algebraic loop.
///
/// Owns the loop, the diagnostics sink and the dense linear solver. Buffers are
/// sized on `initialize()` and reallocated whenever the loop reports a new
/// dimension.
pub struct NewtonSolver<S, D = NullSink, L = PartialPivLu> {
    system: S,
    settings: NewtonSettings,
    diagnostics: D,
    linear: L,
    ws: Workspace,
    first_call: bool,
    status: IterationStatus,
}

impl<S: EquationSystem> NewtonSolver<S> {
    pub fn new(system: S, settings: NewtonSettings) -> Self {
        Self::with_parts(system, settings, NullSink, PartialPivLu)
    }
}

impl<S: EquationSystem, D: DiagnosticsSink> NewtonSolver<S, D> {
    pub fn with_diagnostics(system: S, settings: NewtonSettings, diagnostics: D) -> Self {
        Self::with_parts(system, settings, diagnostics, PartialPivLu)
    }
}

impl<S, D, L> NewtonSolver<S, D, L>
where
    S: EquationSystem,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    pub fn with_parts(system: S, settings: NewtonSettings, diagnostics: D, linear: L) -> Self {
        Self {
            system,
            settings,
            diagnostics,
            linear,
            ws: Workspace::new(0),
            first_call: true,
            status: IterationStatus::Continue,
        }
    }

    /// (Re-)initializes the loop and pulls its dimension, names, nominal values
    /// and bounds. Buffers are only reallocated when the dimension changes.
    /// An empty loop sets the status to `SolverError`.
    pub fn initialize(&mut self) {
        self.first_call = false;
        self.system.initialize();

        let dim = self.system.dimension();
        if dim == 0 {
            self.ws = Workspace::new(0);
            self.status = IterationStatus::SolverError;
        } else if dim != self.ws.dimension() {
            self.ws = Workspace::for_system(&self.system, dim);
        }

        let mut em = Emitter {
            sink: &mut self.diagnostics,
            category: category_of(&self.system),
            equation_index: self.system.equation_index(),
            simulation_time: self.system.simulation_time(),
        };
        let message = format!("Newton: eq{} initialized", em.equation_index);
        em.emit(
            Level::Debug,
            message,
            vec![
                ("dimension", FieldValue::Count(dim)),
                ("names", FieldValue::Names(self.ws.names.clone())),
            ],
        );
    }

    /// Solves the loop starting from its current values.
    ///
    /// On success the loop holds the solution, `values()` returns it and
    /// `residual()` the unscaled residual there. An empty loop is not an error:
    /// the returned report carries `IterationStatus::SolverError`.
    pub fn solve(&mut self) -> SolverResult<SolveReport> {
        self.settings.validate()?;
        if self.first_call {
            self.initialize();
        }

        let settings = self.settings;
        let mut report = SolveReport::default();
        let Self {
            system,
            diagnostics,
            linear,
            ws,
            status,
            ..
        } = self;

        if ws.dimension() == 0 {
            *status = IterationStatus::SolverError;
            report.status = *status;
            return Ok(report);
        }

        let mut em = Emitter {
            sink: diagnostics,
            category: category_of(&*system),
            equation_index: system.equation_index(),
            simulation_time: system.simulation_time(),
        };

        system.values(ws.y.as_mut_slice());
        let tearing = system.is_linear_tearing();
        if !tearing {
            report.residual_evaluations += 1;
            system.evaluate()?;
            system.residual(ws.f.as_mut_slice());
        }

        *status = IterationStatus::Continue;
        let message = format!(
            "Newton: eq{} at time {}",
            em.equation_index, em.simulation_time
        );
        em.emit(Level::Debug, message, vec![]);

        if system.is_linear() && !tearing {
            solve_linear(system, ws, &settings, linear, &mut em, &mut report)?;
        } else if tearing {
            solve_linear_tearing(system, ws, &settings, linear, &mut em, &mut report)?;
        } else {
            solve_nonlinear(system, ws, &settings, linear, &mut em, &mut report)?;
        }

        *status = IterationStatus::Done;
        report.status = *status;
        if em.enabled(Level::Debug) {
            em.emit(
                Level::Debug,
                "solution",
                vec![
                    ("y*", FieldValue::Vector(ws.y.as_slice().to_vec())),
                    ("iterations", FieldValue::Count(report.iterations)),
                ],
            );
        }
        Ok(report)
    }

    /// Status of the last `solve()`.
    pub fn iteration_status(&self) -> IterationStatus {
        self.status
    }

    pub fn dimension(&self) -> usize {
        self.ws.dimension()
    }

    /// Current iterate.
    pub fn values(&self) -> &[f64] {
        self.ws.y.as_slice()
    }

    /// Unscaled residual at the current iterate.
    pub fn residual(&self) -> &[f64] {
        self.ws.f.as_slice()
    }

    /// Residual scale from the latest Jacobian build.
    pub fn residual_nominal(&self) -> &[f64] {
        self.ws.f_nominal.as_slice()
    }

    pub fn settings(&self) -> &NewtonSettings {
        &self.settings
    }

    /// Takes effect on the next `solve()`.
    pub fn set_settings(&mut self, settings: NewtonSettings) {
        self.settings = settings;
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn diagnostics(&self) -> &D {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut D {
        &mut self.diagnostics
    }

    pub fn into_system(self) -> S {
        self.system
    }

    /// Called by the integrator after an accepted step. No-op.
    pub fn step_completed(&mut self, _time: f64) {}

    /// Called by the integrator when a step is rolled back. No-op.
    pub fn restore_old_values(&mut self) {}

    /// Called by the integrator when a rollback is undone. No-op.
    pub fn restore_new_values(&mut self) {}
}

fn category_of<S: EquationSystem + ?Sized>(system: &S) -> Category {
    if system.is_linear() {
        Category::LinearSystem
    } else {
        Category::NonlinearSystem
    }
}

/// Scales `ws.f` by the residual nominals and solves `jac * step = f` into `ws.step`.
fn solve_scaled<L: DenseLinearSolver>(
    ws: &mut Workspace,
    linear: &mut L,
    report: &mut SolveReport,
    kind: LinearSystemKind,
) -> SolverResult<()> {
    for i in 0..ws.f.len() {
        ws.f[i] /= ws.f_nominal[i];
    }
    ws.step.copy_from(&ws.f);
    report.linear_solves += 1;
    linear
        .solve(&ws.jac, &mut ws.step)
        .map_err(|err| SolverError::SingularLinearSystem {
            kind,
            iteration: report.iterations,
            pivot: err.pivot,
        })
}

/// `A y = b`: `residual()` is `b` and one solve gives the solution.
fn solve_linear<S, D, L>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    linear: &mut L,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
) -> SolverResult<()>
where
    S: EquationSystem,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    build_jacobian(system, ws, settings, em, report)?;
    solve_scaled(ws, linear, report, LinearSystemKind::Linear)?;
    for j in 0..ws.y.len() {
        ws.y[j] = ws.step[j] * ws.y_nominal[j];
    }
    evaluate_residual(system, ws.y.as_slice(), ws.f.as_mut_slice(), report)?;
    Ok(())
}

/// `A y - b` about zero: the solution is the negated scaled correction.
fn solve_linear_tearing<S, D, L>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    linear: &mut L,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
) -> SolverResult<()>
where
    S: EquationSystem,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    // the iterate is kept in y_test until the correction is known
    ws.y_test.copy_from(&ws.y);
    ws.y.fill(0.0);
    if let Err(err) = tearing_correction(system, ws, settings, linear, em, report) {
        ws.y.copy_from(&ws.y_test);
        system.set_values(ws.y.as_slice());
        return Err(err);
    }
    for j in 0..ws.y.len() {
        ws.y[j] = -ws.step[j] * ws.y_nominal[j];
    }
    evaluate_residual(system, ws.y.as_slice(), ws.f.as_mut_slice(), report)?;

    if !is_converged(&ws.f, &ws.f_nominal, settings) {
        em.emit(
            Level::Warning,
            "linear tearing residual above tolerance",
            vec![("f", FieldValue::Vector(ws.f.as_slice().to_vec()))],
        );
    }
    Ok(())
}

/// Builds the Jacobian about the zero vector in `ws.y` and solves for the scaled
/// correction into `ws.step`.
fn tearing_correction<S, D, L>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    linear: &mut L,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
) -> SolverResult<()>
where
    S: EquationSystem,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    evaluate_residual(system, ws.y.as_slice(), ws.f.as_mut_slice(), report)?;
    build_jacobian(system, ws, settings, em, report)?;
    solve_scaled(ws, linear, report, LinearSystemKind::LinearTearing)
}

fn solve_nonlinear<S, D, L>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    linear: &mut L,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
) -> SolverResult<()>
where
    S: EquationSystem,
    D: DiagnosticsSink,
    L: DenseLinearSolver,
{
    // whether the loop was last evaluated at ws.y
    let mut synced = true;

    loop {
        if report.iterations >= settings.max_iterations {
            return Err(SolverError::IterationLimitExceeded {
                iterations: report.iterations,
            });
        }

        if em.enabled(Level::Debug) {
            let k = report.iterations;
            em.emit(
                Level::Debug,
                format!("iteration {k}"),
                vec![
                    ("y", FieldValue::Vector(ws.y.as_slice().to_vec())),
                    ("f", FieldValue::Vector(ws.f.as_slice().to_vec())),
                ],
            );
        }

        // an analytic matrix is taken at the loop's current values
        if !synced {
            report.residual_evaluations += 1;
            system.set_values(ws.y.as_slice());
            system.evaluate()?;
            synced = true;
        }
        let source = build_jacobian(system, ws, settings, em, report)?;
        synced &= source == JacobianSource::Analytic;

        if is_converged(&ws.f, &ws.f_nominal, settings) {
            break;
        }

        let phi = scale_merit(&mut ws.f, &ws.f_nominal);
        ws.step.copy_from(&ws.f);
        report.linear_solves += 1;
        linear
            .solve(&ws.jac, &mut ws.step)
            .map_err(|err| SolverError::SingularLinearSystem {
                kind: LinearSystemKind::NewtonStep,
                iteration: report.iterations,
                pivot: err.pivot,
            })?;
        report.iterations += 1;

        for j in 0..ws.step.len() {
            ws.step[j] *= ws.y_nominal[j];
        }

        let damped = damp_step(system, ws, settings, linear, em, report, phi)?;
        synced = damped.system_synced;
        em.emit(
            Level::Debug,
            "iterate accepted",
            vec![
                ("iteration", FieldValue::Count(report.iterations)),
                ("lambda", FieldValue::Scalar(damped.lambda)),
                ("phi", FieldValue::Scalar(phi)),
                ("phi_accepted", FieldValue::Scalar(damped.phi)),
            ],
        );
        if damped.converged {
            break;
        }
    }

    if !synced {
        report.residual_evaluations += 1;
        system.set_values(ws.y.as_slice());
        system.evaluate()?;
    }
    system.residual(ws.f.as_mut_slice());
    Ok(())
}

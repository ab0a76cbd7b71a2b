use crate::diagnostics::{DiagnosticsSink, Emitter, FieldValue, Level};
use crate::error::{DomainError, SolverResult};
use crate::newton::SolveReport;
use crate::settings::NewtonSettings;
use crate::traits::EquationSystem;
use crate::workspace::Workspace;

/// Where the Jacobian of the last build came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianSource {
    Analytic,
    FiniteDifference,
}

/// Pushes `y` into the system, evaluates it and reads the residual into `out`.
pub(crate) fn evaluate_residual<S: EquationSystem + ?Sized>(
    system: &mut S,
    y: &[f64],
    out: &mut [f64],
    report: &mut SolveReport,
) -> Result<(), DomainError> {
    system.set_values(y);
    report.residual_evaluations += 1;
    system.evaluate()?;
    system.residual(out);
    Ok(())
}

/// Builds the scaled Jacobian `ws.jac` and the residual scale `ws.f_nominal`
/// about `ws.y`, whose residual must already be in `ws.f`.
///
/// On return `ws.jac[(i, j)] = df_i/dy_j * y_nominal_j / f_nominal_i`, i.e. the
/// Jacobian of the residual scaled by `f_nominal` with respect to unknowns scaled
/// by `y_nominal`. `ws.y` is left unchanged; the system itself may be left at a
/// perturbed point.
pub(crate) fn build_jacobian<S, D>(
    system: &mut S,
    ws: &mut Workspace,
    settings: &NewtonSettings,
    em: &mut Emitter<'_, D>,
    report: &mut SolveReport,
) -> SolverResult<JacobianSource>
where
    S: EquationSystem + ?Sized,
    D: DiagnosticsSink,
{
    let dim = ws.dimension();
    report.jacobian_builds += 1;
    ws.f_nominal.fill(1e2 * settings.atol);

    let source = if copy_analytic(system, ws, em) {
        JacobianSource::Analytic
    } else {
        for j in 0..dim {
            ws.y_help.copy_from(&ws.y);
            let step = 1e2 * settings.rtol * ws.y_nominal[j];
            ws.y_help[j] += step;

            evaluate_residual(
                system,
                ws.y_help.as_slice(),
                ws.f_help.as_mut_slice(),
                report,
            )?;

            for i in 0..dim {
                ws.jac[(i, j)] = (ws.f_help[i] - ws.f[i]) / step;
            }
        }
        JacobianSource::FiniteDifference
    };

    for j in 0..dim {
        for i in 0..dim {
            let weighted = ws.jac[(i, j)].abs() * ws.y_nominal[j];
            if weighted > ws.f_nominal[i] {
                ws.f_nominal[i] = weighted;
            }
        }
    }

    if em.enabled(Level::Debug) {
        em.emit(
            Level::Debug,
            "jacobian",
            vec![("f_nominal", FieldValue::Vector(ws.f_nominal.as_slice().to_vec()))],
        );
    }

    for j in 0..dim {
        for i in 0..dim {
            ws.jac[(i, j)] *= ws.y_nominal[j] / ws.f_nominal[i];
        }
    }

    Ok(source)
}

/// Copies the analytic system matrix into `ws.jac` if the loop provides one of
/// the right shape.
fn copy_analytic<S, D>(system: &mut S, ws: &mut Workspace, em: &mut Emitter<'_, D>) -> bool
where
    S: EquationSystem + ?Sized,
    D: DiagnosticsSink,
{
    let dim = ws.dimension();
    match system.system_matrix() {
        Ok(Some(matrix)) if matrix.shape() == (dim, dim) => {
            ws.jac.copy_from(&matrix);
            true
        }
        Ok(Some(matrix)) => {
            let message = format!(
                "analytic Jacobian has shape {:?}, expected {:?}",
                matrix.shape(),
                (dim, dim)
            );
            em.emit(Level::Debug, message, vec![]);
            false
        }
        Ok(None) => false,
        Err(err) => {
            let message = format!(
                "analytic Jacobian failed for eq{} at time {}: {err:#}",
                em.equation_index, em.simulation_time
            );
            em.emit(Level::Warning, message, vec![]);
            false
        }
    }
}

//! Damped nonlinear least-squares minimization.
//!
//! [`levenberg_marquardt`] minimizes `||r(p)||^2` for a residual vector
//! supplied through the [`ResidualProblem`] trait. The Jacobian is
//! approximated by forward differences, so problems only need to evaluate
//! their residuals; this matches the way the calibration stages re-run whole
//! closed-form sub-solves inside a residual evaluation, where an analytic
//! Jacobian would be impractical.
//!
//! Each iteration solves the damped normal equations
//! `(J'J + lambda * diag(J'J)) step = -J'r` and accepts the step only if it
//! reduces the cost, shrinking `lambda` on acceptance and growing it on
//! rejection. The accepted cost sequence is therefore non-increasing, and the
//! returned parameters never cost more than the initial guess.
//!
//! Running out of iterations is not an error: the best parameters found are
//! returned with a [`Termination`] that callers can inspect. Only numerical
//! breakdown (a damped system that stays singular) or a residual failure
//! outside the step search aborts the solve.

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector};

/// Forward difference step scale, as the square root of the assumed relative
/// error in residual evaluations.
const FD_EPSILON: f64 = 1.0e-16;

/// Damping factor bounds for the inner accept/reject loop.
const LAMBDA_MIN: f64 = 1.0e-12;
const LAMBDA_MAX: f64 = 1.0e12;

/// A nonlinear least-squares problem: a residual vector evaluated at a
/// parameter vector.
///
/// Implementations may fail for parameter values outside their domain (for
/// example a camera pose that puts a calibration point behind the focal
/// plane). A failure while probing a trial step makes the solver reject the
/// step and raise the damping instead of aborting.
pub trait ResidualProblem {
    /// Error produced by a failed residual evaluation.
    type Error: std::fmt::Debug + std::fmt::Display;

    /// Number of residuals. Must not change over the lifetime of a solve.
    fn residual_count(&self) -> usize;

    /// Evaluates the residual vector at `params` into `out`.
    fn residuals(
        &mut self,
        params: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), Self::Error>;
}

/// Convergence tolerances and iteration budget.
#[derive(Debug, Clone)]
pub struct Options {
    /// Relative cost reduction below which the solve counts as converged.
    pub ftol: f64,
    /// Relative step length below which the solve counts as converged.
    pub xtol: f64,
    /// Gradient infinity norm below which the solve counts as converged.
    pub gtol: f64,
    /// Iteration budget; exhausting it is reported, not an error.
    pub max_iterations: usize,
    /// Starting damping factor.
    pub initial_lambda: f64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ftol: 1.0e-5,
            xtol: 1.0e-7,
            gtol: 1.0e-8,
            max_iterations: 200,
            initial_lambda: 1.0e-3,
        }
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The relative cost reduction dropped below `ftol`.
    CostTolerance,
    /// The relative step length dropped below `xtol`.
    StepTolerance,
    /// The gradient infinity norm dropped below `gtol`.
    GradientTolerance,
    /// No downhill step could be found even at maximum damping.
    Stalled,
    /// The iteration budget ran out.
    IterationLimit,
}

/// Result of a solve. `params` always carries the best (lowest cost)
/// parameter vector seen, so `cost <= initial_cost` holds even on
/// non-convergence.
#[derive(Debug, Clone)]
pub struct Solution {
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`.
    pub cost: f64,
    /// Sum of squared residuals at the initial guess.
    pub initial_cost: f64,
    pub iterations: usize,
    pub termination: Termination,
    /// Cost after every accepted step, starting with the initial cost.
    /// Non-increasing by construction.
    pub cost_history: Vec<f64>,
}

impl Solution {
    /// Whether the solve met one of the convergence tolerances.
    pub fn converged(&self) -> bool {
        matches!(
            self.termination,
            Termination::CostTolerance | Termination::StepTolerance | Termination::GradientTolerance
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OptimError<E: std::fmt::Debug + std::fmt::Display> {
    #[error("residual evaluation failed: {0}")]
    Residual(E),
    #[error("damped normal equations remained singular at iteration {iteration}")]
    NumericalBreakdown { iteration: usize },
    #[error("underdetermined problem: {residuals} residuals for {parameters} parameters")]
    Underdetermined { residuals: usize, parameters: usize },
}

/// Minimizes `||r(p)||^2` starting from `initial`.
///
/// # Errors
///
/// * [`OptimError::Underdetermined`] when there are fewer residuals than
///   parameters.
/// * [`OptimError::Residual`] when the residuals cannot be evaluated at the
///   initial guess or while probing the Jacobian.
/// * [`OptimError::NumericalBreakdown`] when the damped normal equations stay
///   singular at maximum damping.
pub fn levenberg_marquardt<P: ResidualProblem>(
    problem: &mut P,
    initial: &DVector<f64>,
    options: &Options,
) -> Result<Solution, OptimError<P::Error>> {
    let n = initial.len();
    let m = problem.residual_count();
    if m < n {
        return Err(OptimError::Underdetermined {
            residuals: m,
            parameters: n,
        });
    }

    let mut params = initial.clone();
    let mut residuals = DVector::zeros(m);
    problem
        .residuals(&params, &mut residuals)
        .map_err(OptimError::Residual)?;
    let initial_cost = residuals.norm_squared();
    let mut cost = initial_cost;
    let mut cost_history = vec![cost];

    let mut lambda = options.initial_lambda;
    let mut termination = Termination::IterationLimit;
    let mut iterations = 0;

    for iteration in 0..options.max_iterations {
        iterations = iteration + 1;

        let jacobian = forward_difference_jacobian(problem, &params, &residuals)
            .map_err(OptimError::Residual)?;
        let jt = jacobian.transpose();
        let gradient = &jt * &residuals;
        if gradient.amax() < options.gtol {
            termination = Termination::GradientTolerance;
            iterations = iteration;
            break;
        }
        let jtj = &jt * &jacobian;

        // inner loop: grow the damping until a step is accepted
        let mut accepted = false;
        loop {
            let mut damped = jtj.clone();
            for j in 0..n {
                damped[(j, j)] += lambda * jtj[(j, j)].max(LAMBDA_MIN);
            }

            let step = match Cholesky::new(damped) {
                Some(chol) => chol.solve(&(-&gradient)),
                None => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        return Err(OptimError::NumericalBreakdown { iteration });
                    }
                    continue;
                }
            };

            let trial = &params + &step;
            let mut trial_residuals = DVector::zeros(m);
            let trial_cost = match problem.residuals(&trial, &mut trial_residuals) {
                Ok(()) => trial_residuals.norm_squared(),
                // a trial step into an invalid region is just a bad step
                Err(_) => f64::INFINITY,
            };

            if trial_cost.is_finite() && trial_cost < cost {
                let cost_drop = cost - trial_cost;
                let step_norm = step.norm();

                params = trial;
                residuals = trial_residuals;
                cost = trial_cost;
                cost_history.push(cost);
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                accepted = true;

                // a tiny relative improvement only counts as convergence
                // while the damping is healthy; heavily damped crawls are
                // slow progress, not a minimum
                if lambda <= options.initial_lambda {
                    if cost_drop <= options.ftol * cost.max(f64::MIN_POSITIVE) {
                        termination = Termination::CostTolerance;
                    } else if step_norm <= options.xtol * (params.norm() + options.xtol) {
                        termination = Termination::StepTolerance;
                    }
                }
                break;
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                termination = Termination::Stalled;
                break;
            }
        }

        debug!(
            "lm iteration {}: cost {:.6e}, lambda {:.3e}",
            iterations, cost, lambda
        );

        if !accepted || termination != Termination::IterationLimit {
            break;
        }
    }

    Ok(Solution {
        params,
        cost,
        initial_cost,
        iterations,
        termination,
        cost_history,
    })
}

/// Forward difference Jacobian. The step for parameter `j` is
/// `sqrt(FD_EPSILON) * |p_j|`, falling back to `sqrt(FD_EPSILON)` for zero
/// parameters.
fn forward_difference_jacobian<P: ResidualProblem>(
    problem: &mut P,
    params: &DVector<f64>,
    residuals: &DVector<f64>,
) -> Result<DMatrix<f64>, P::Error> {
    let n = params.len();
    let m = residuals.len();
    let mut jacobian = DMatrix::zeros(m, n);
    let mut probe = params.clone();
    let mut probed = DVector::zeros(m);

    let base_step = FD_EPSILON.sqrt();
    for j in 0..n {
        let mut h = base_step * params[j].abs();
        if h == 0.0 {
            h = base_step;
        }
        probe[j] = params[j] + h;
        problem.residuals(&probe, &mut probed)?;
        let inv_h = 1.0 / (probe[j] - params[j]);
        for i in 0..m {
            jacobian[(i, j)] = (probed[i] - residuals[i]) * inv_h;
        }
        probe[j] = params[j];
    }

    Ok(jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fit y = a * x + b to exact data; linear, so one step suffices.
    struct LineFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl ResidualProblem for LineFit {
        type Error = std::convert::Infallible;

        fn residual_count(&self) -> usize {
            self.xs.len()
        }

        fn residuals(
            &mut self,
            params: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), Self::Error> {
            for i in 0..self.xs.len() {
                out[i] = self.ys[i] - (params[0] * self.xs[i] + params[1]);
            }
            Ok(())
        }
    }

    /// The Rosenbrock function written as two residuals.
    struct Rosenbrock;

    impl ResidualProblem for Rosenbrock {
        type Error = std::convert::Infallible;

        fn residual_count(&self) -> usize {
            2
        }

        fn residuals(
            &mut self,
            params: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), Self::Error> {
            out[0] = 10.0 * (params[1] - params[0] * params[0]);
            out[1] = 1.0 - params[0];
            Ok(())
        }
    }

    #[test]
    fn test_linear_problem_converges() {
        let mut problem = LineFit {
            xs: vec![0.0, 1.0, 2.0, 3.0],
            ys: vec![1.0, 3.0, 5.0, 7.0],
        };
        let solution = levenberg_marquardt(
            &mut problem,
            &DVector::from_vec(vec![0.0, 0.0]),
            &Options::default(),
        )
        .unwrap();
        assert!(solution.converged());
        assert_relative_eq!(solution.params[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(solution.params[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rosenbrock_converges() {
        let solution = levenberg_marquardt(
            &mut Rosenbrock,
            &DVector::from_vec(vec![-1.2, 1.0]),
            &Options::default(),
        )
        .unwrap();
        assert!(solution.converged());
        assert_relative_eq!(solution.params[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(solution.params[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_cost_history_is_monotonic() {
        let solution = levenberg_marquardt(
            &mut Rosenbrock,
            &DVector::from_vec(vec![-1.2, 1.0]),
            &Options::default(),
        )
        .unwrap();
        for pair in solution.cost_history.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(solution.cost <= solution.initial_cost);
    }

    #[test]
    fn test_iteration_budget_is_not_an_error() {
        let solution = levenberg_marquardt(
            &mut Rosenbrock,
            &DVector::from_vec(vec![-1.2, 1.0]),
            &Options {
                max_iterations: 1,
                ..Options::default()
            },
        )
        .unwrap();
        assert!(!solution.converged());
        assert!(solution.cost <= solution.initial_cost);
    }

    #[test]
    fn test_underdetermined_problem_is_rejected() {
        let mut problem = LineFit {
            xs: vec![1.0],
            ys: vec![2.0],
        };
        let result = levenberg_marquardt(
            &mut problem,
            &DVector::from_vec(vec![0.0, 0.0]),
            &Options::default(),
        );
        assert!(matches!(result, Err(OptimError::Underdetermined { .. })));
    }

    #[test]
    fn test_already_optimal_terminates_on_gradient() {
        let mut problem = LineFit {
            xs: vec![0.0, 1.0, 2.0, 3.0],
            ys: vec![1.0, 3.0, 5.0, 7.0],
        };
        let solution = levenberg_marquardt(
            &mut problem,
            &DVector::from_vec(vec![2.0, 1.0]),
            &Options::default(),
        )
        .unwrap();
        assert_eq!(solution.termination, Termination::GradientTolerance);
        assert_eq!(solution.cost, 0.0);
    }
}

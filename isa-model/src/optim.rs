//! Quasi-Newton minimization on top of `argmin`.
//!
//! Objectives return `(cost, gradient)` together. A run that stops
//! early because the line search gives up is not an error; the best
//! iterate so far is kept. Non-finite values always abort.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::debug;
use matrix_util::{check_finite_scalar, NonFinite};

/// Iterations per solver restart; the best iterate carries over
const CHUNK_ITERS: usize = 50;

#[derive(Debug, Clone)]
pub struct LbfgsSettings {
    /// Iteration cap. Default: 100
    pub max_iter: usize,
    /// Stop when the gradient norm drops below this. Default: 1e-8
    pub tol_grad: f64,
    /// Stop when the cost changes by less than this. Default: 1e-12
    pub tol_cost: f64,
    /// History length. Default: 7
    pub memory: usize,
}

impl Default for LbfgsSettings {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol_grad: 1e-8,
            tol_cost: 1e-12,
            memory: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub param: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

struct Problem<'a, F> {
    func: &'a F,
}

impl<F> CostFunction for Problem<'_, F>
where
    F: Fn(&[f64]) -> anyhow::Result<(f64, Vec<f64>)>,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let (cost, _) = (self.func)(param)?;
        Ok(cost)
    }
}

impl<F> Gradient for Problem<'_, F>
where
    F: Fn(&[f64]) -> anyhow::Result<(f64, Vec<f64>)>,
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let (_, grad) = (self.func)(param)?;
        Ok(grad)
    }
}

/// Minimize `func` from `init` with L-BFGS and a More-Thuente line search
pub fn minimize<F>(func: &F, init: Vec<f64>, settings: &LbfgsSettings) -> anyhow::Result<Minimum>
where
    F: Fn(&[f64]) -> anyhow::Result<(f64, Vec<f64>)>,
{
    let (init_cost, init_grad) = func(&init)?;
    check_finite_scalar(init_cost, "initial cost")?;

    let grad_norm = init_grad.iter().map(|g| g * g).sum::<f64>().sqrt();
    let mut best = Minimum {
        param: init,
        cost: init_cost,
        iterations: 0,
        converged: grad_norm <= settings.tol_grad,
    };

    let mut remaining = settings.max_iter;
    while remaining > 0 && !best.converged {
        let chunk = remaining.min(CHUNK_ITERS);

        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, settings.memory)
            .with_tolerance_grad(settings.tol_grad)?
            .with_tolerance_cost(settings.tol_cost)?;

        let start = best.param.clone();
        let result = Executor::new(Problem { func }, solver)
            .configure(|state| state.param(start).max_iters(chunk as u64))
            .run();

        match result {
            Ok(res) => {
                let state = res.state();
                best.iterations += state.get_iter() as usize;

                if let Some(param) = state.get_best_param() {
                    let cost = state.get_best_cost();
                    if cost < best.cost {
                        best.param = param.clone();
                        best.cost = cost;
                    }
                }

                match state.get_termination_reason() {
                    Some(TerminationReason::MaxItersReached) => {
                        remaining -= chunk;
                    }
                    reason => {
                        best.converged = matches!(reason, Some(TerminationReason::SolverConverged));
                        break;
                    }
                }
            }
            Err(e) => {
                if e.downcast_ref::<NonFinite>().is_some() {
                    return Err(e);
                }
                debug!("L-BFGS stopped early: {}", e);
                break;
            }
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn finds_the_minimum_of_a_quadratic() -> anyhow::Result<()> {
        let target = [1.0, -2.0, 0.5];
        let func = |x: &[f64]| -> anyhow::Result<(f64, Vec<f64>)> {
            let cost = x
                .iter()
                .zip(target.iter())
                .enumerate()
                .map(|(i, (a, b))| (i + 1) as f64 * (a - b) * (a - b))
                .sum();
            let grad = x
                .iter()
                .zip(target.iter())
                .enumerate()
                .map(|(i, (a, b))| 2.0 * (i + 1) as f64 * (a - b))
                .collect();
            Ok((cost, grad))
        };

        let res = minimize(&func, vec![0.0; 3], &LbfgsSettings::default())?;
        for (x, t) in res.param.iter().zip(target.iter()) {
            assert_abs_diff_eq!(x, t, epsilon = 1e-6);
        }
        assert!(res.cost <= 1e-10);
        Ok(())
    }

    #[test]
    fn non_finite_cost_is_an_error() {
        let func = |_: &[f64]| -> anyhow::Result<(f64, Vec<f64>)> {
            Err(NonFinite {
                context: "test".into(),
            }
            .into())
        };
        assert!(minimize(&func, vec![0.0], &LbfgsSettings::default()).is_err());
    }

    #[test]
    fn never_returns_worse_than_the_start() -> anyhow::Result<()> {
        let func = |x: &[f64]| -> anyhow::Result<(f64, Vec<f64>)> {
            Ok(((x[0] - 3.0).powi(2), vec![2.0 * (x[0] - 3.0)]))
        };
        let res = minimize(
            &func,
            vec![2.9],
            &LbfgsSettings {
                max_iter: 1,
                ..Default::default()
            },
        )?;
        assert!(res.cost <= 0.01);
        Ok(())
    }
}

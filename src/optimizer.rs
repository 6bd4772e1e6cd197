//! Box-constrained quasi-Newton minimisation.
//!
//! A projected L-BFGS: the two-loop recursion runs on the free variables only
//! (those not pinned at a bound by their own gradient), and every trial point
//! is projected back into the box before the Armijo test.

use std::collections::VecDeque;

use crate::error::Unavailable;

#[derive(Debug, Clone, Copy)]
pub struct LbfgsOptions {
    pub max_iter: usize,
    pub memory: usize,
    /// Stop once the projected gradient's largest component falls below this.
    pub grad_tol: f64,
    /// Stop once the relative objective decrease falls below this.
    pub value_tol: f64,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            max_iter: 300,
            memory: 8,
            grad_tol: 1e-5,
            value_tol: 1e-10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn uniform(n: usize, lower: f64, upper: f64) -> Self {
        Self {
            lower: vec![lower; n],
            upper: vec![upper; n],
        }
    }

    /// Pins variable `i` to `value`.
    pub fn fix(&mut self, i: usize, value: f64) {
        self.lower[i] = value;
        self.upper[i] = value;
    }

    pub fn set(&mut self, i: usize, lower: f64, upper: f64) {
        self.lower[i] = lower;
        self.upper[i] = upper;
    }

    fn project(&self, x: &mut [f64]) {
        for (i, v) in x.iter_mut().enumerate() {
            *v = v.clamp(self.lower[i], self.upper[i]);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimises `f` inside `bounds`. The objective writes its gradient into the
/// second argument and returns the value; it may return a non-finite value to
/// reject a trial point, but not at the (projected) start.
pub fn minimize<F>(
    mut f: F,
    x0: &[f64],
    bounds: &Bounds,
    opts: LbfgsOptions,
) -> Result<Solution, Unavailable>
where
    F: FnMut(&[f64], &mut [f64]) -> f64,
{
    let n = x0.len();
    if bounds.lower.len() != n || bounds.upper.len() != n {
        return Err(Unavailable::NumericalFailure(format!(
            "bounds cover {} variables, start has {n}",
            bounds.lower.len()
        )));
    }

    let mut x = x0.to_vec();
    bounds.project(&mut x);
    let mut g = vec![0.0; n];
    let mut fx = f(&x, &mut g);
    if !fx.is_finite() || g.iter().any(|v| !v.is_finite()) {
        return Err(Unavailable::NumericalFailure(
            "objective not finite at start".to_string(),
        ));
    }

    let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(opts.memory);
    let mut x_new = vec![0.0; n];
    let mut g_new = vec![0.0; n];

    for iter in 0..opts.max_iter {
        if projected_grad_norm(&x, &g, bounds) < opts.grad_tol {
            return Ok(Solution {
                x,
                value: fx,
                iterations: iter,
                converged: true,
            });
        }

        let free = free_mask(&x, &g, bounds);
        let mut dir = two_loop(&g, &free, &history);
        let mut slope = dot(&dir, &g);
        if slope >= 0.0 {
            history.clear();
            dir = steepest(&g, &free);
            slope = dot(&dir, &g);
            if slope >= 0.0 {
                return Ok(Solution {
                    x,
                    value: fx,
                    iterations: iter,
                    converged: true,
                });
            }
        }

        let Some(f_new) = line_search(&mut f, &x, fx, &g, &dir, bounds, &mut x_new, &mut g_new)
        else {
            if history.is_empty() {
                return Ok(Solution {
                    x,
                    value: fx,
                    iterations: iter,
                    converged: false,
                });
            }
            // Curvature memory led us astray; retry from steepest descent.
            history.clear();
            continue;
        };

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-10 {
            if history.len() == opts.memory {
                history.pop_front();
            }
            history.push_back((s, y, 1.0 / sy));
        }

        let decrease = fx - f_new;
        x.copy_from_slice(&x_new);
        g.copy_from_slice(&g_new);
        fx = f_new;
        if decrease.abs() <= opts.value_tol * fx.abs().max(1.0) {
            return Ok(Solution {
                x,
                value: fx,
                iterations: iter + 1,
                converged: true,
            });
        }
    }

    let converged = projected_grad_norm(&x, &g, bounds) < opts.grad_tol * 10.0;
    Ok(Solution {
        x,
        value: fx,
        iterations: opts.max_iter,
        converged,
    })
}

#[allow(clippy::too_many_arguments)]
fn line_search<F>(
    f: &mut F,
    x: &[f64],
    fx: f64,
    g: &[f64],
    dir: &[f64],
    bounds: &Bounds,
    x_new: &mut [f64],
    g_new: &mut [f64],
) -> Option<f64>
where
    F: FnMut(&[f64], &mut [f64]) -> f64,
{
    const ARMIJO: f64 = 1e-4;
    let mut step = 1.0;
    for _ in 0..40 {
        for i in 0..x.len() {
            x_new[i] = x[i] + step * dir[i];
        }
        bounds.project(x_new);
        let moved: f64 = x_new.iter().zip(x).zip(g).map(|((a, b), gi)| (a - b) * gi).sum();
        let f_trial = f(x_new, g_new);
        if f_trial.is_finite()
            && g_new.iter().all(|v| v.is_finite())
            && f_trial <= fx + ARMIJO * moved
        {
            return Some(f_trial);
        }
        step *= 0.5;
    }
    None
}

fn two_loop(g: &[f64], free: &[bool], history: &VecDeque<(Vec<f64>, Vec<f64>, f64)>) -> Vec<f64> {
    let mut q: Vec<f64> = g
        .iter()
        .zip(free)
        .map(|(v, keep)| if *keep { *v } else { 0.0 })
        .collect();
    let mut alphas = Vec::with_capacity(history.len());
    for (s, y, rho) in history.iter().rev() {
        let a = rho * dot(s, &q);
        for (qi, yi) in q.iter_mut().zip(y) {
            *qi -= a * yi;
        }
        alphas.push(a);
    }
    if let Some((s, y, _)) = history.back() {
        let yy = dot(y, y);
        if yy > 0.0 {
            let gamma = dot(s, y) / yy;
            q.iter_mut().for_each(|v| *v *= gamma);
        }
    }
    for ((s, y, rho), a) in history.iter().zip(alphas.iter().rev()) {
        let b = rho * dot(y, &q);
        for (qi, si) in q.iter_mut().zip(s) {
            *qi += (a - b) * si;
        }
    }
    q.iter()
        .zip(free)
        .map(|(v, keep)| if *keep { -v } else { 0.0 })
        .collect()
}

fn steepest(g: &[f64], free: &[bool]) -> Vec<f64> {
    g.iter()
        .zip(free)
        .map(|(v, keep)| if *keep { -v } else { 0.0 })
        .collect()
}

fn free_mask(x: &[f64], g: &[f64], bounds: &Bounds) -> Vec<bool> {
    (0..x.len())
        .map(|i| {
            let pinned = bounds.upper[i] - bounds.lower[i] <= 0.0;
            let at_lower = x[i] <= bounds.lower[i] && g[i] > 0.0;
            let at_upper = x[i] >= bounds.upper[i] && g[i] < 0.0;
            !(pinned || at_lower || at_upper)
        })
        .collect()
}

fn projected_grad_norm(x: &[f64], g: &[f64], bounds: &Bounds) -> f64 {
    (0..x.len())
        .map(|i| (x[i] - (x[i] - g[i]).clamp(bounds.lower[i], bounds.upper[i])).abs())
        .fold(0.0, f64::max)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rosenbrock(x: &[f64], g: &mut [f64]) -> f64 {
        let (a, b) = (x[0], x[1]);
        g[0] = -2.0 * (1.0 - a) - 400.0 * a * (b - a * a);
        g[1] = 200.0 * (b - a * a);
        (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2)
    }

    #[test]
    fn finds_unconstrained_minimum() {
        let sol = minimize(
            rosenbrock,
            &[-1.2, 1.0],
            &Bounds::uniform(2, -5.0, 5.0),
            LbfgsOptions::default(),
        )
        .unwrap();
        assert!(sol.converged);
        assert!((sol.x[0] - 1.0).abs() < 1e-3, "{:?}", sol.x);
        assert!((sol.x[1] - 1.0).abs() < 1e-3, "{:?}", sol.x);
    }

    #[test]
    fn respects_active_bounds() {
        // Minimum of (x-3)^2 + (y+2)^2 clipped into [0,1]^2 is (1, 0).
        let f = |x: &[f64], g: &mut [f64]| {
            g[0] = 2.0 * (x[0] - 3.0);
            g[1] = 2.0 * (x[1] + 2.0);
            (x[0] - 3.0).powi(2) + (x[1] + 2.0).powi(2)
        };
        let sol = minimize(f, &[0.5, 0.5], &Bounds::uniform(2, 0.0, 1.0), LbfgsOptions::default())
            .unwrap();
        assert!((sol.x[0] - 1.0).abs() < 1e-9);
        assert!(sol.x[1].abs() < 1e-9);
    }

    #[test]
    fn fixed_variables_do_not_move() {
        let f = |x: &[f64], g: &mut [f64]| {
            g[0] = 2.0 * x[0];
            g[1] = 2.0 * (x[1] - 4.0);
            x[0] * x[0] + (x[1] - 4.0).powi(2)
        };
        let mut bounds = Bounds::uniform(2, -10.0, 10.0);
        bounds.fix(0, 0.7);
        let sol = minimize(f, &[0.0, 0.0], &bounds, LbfgsOptions::default()).unwrap();
        assert_eq!(sol.x[0], 0.7);
        assert!((sol.x[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn non_finite_start_is_a_numerical_failure() {
        let f = |_: &[f64], _: &mut [f64]| f64::NAN;
        let err = minimize(f, &[0.0], &Bounds::uniform(1, -1.0, 1.0), LbfgsOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), "numerical_failure");
    }
}

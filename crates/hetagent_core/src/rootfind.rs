//! Bracketing scalar root finder.

use crate::error::{SolverError, SolverResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrentSettings {
    /// Absolute tolerance on the root location.
    pub x_tolerance: f64,
    /// Stop as soon as `|f(x)|` falls below this.
    pub f_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BrentSettings {
    fn default() -> Self {
        Self {
            x_tolerance: 1e-8,
            f_tolerance: 1e-7,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Root {
    pub x: f64,
    pub f: f64,
    pub iterations: usize,
    /// Number of calls to the objective, including the two bracket ends.
    pub evaluations: usize,
}

/// Brent's method on `[lower, upper]`.
///
/// The objective may fail; its error aborts the search unchanged. A bracket
/// whose ends have the same sign is rejected before any iteration.
pub fn brent<F>(mut f: F, lower: f64, upper: f64, settings: &BrentSettings) -> SolverResult<Root>
where
    F: FnMut(f64) -> SolverResult<f64>,
{
    if !(lower < upper) || !lower.is_finite() || !upper.is_finite() {
        return Err(SolverError::InvalidInput(format!(
            "bracket must satisfy lower < upper, got [{}, {}]",
            lower, upper
        )));
    }
    if !(settings.x_tolerance > 0.0) || settings.f_tolerance < 0.0 {
        return Err(SolverError::InvalidInput(
            "Brent tolerances must be positive".to_string(),
        ));
    }

    let (mut a, mut b) = (lower, upper);
    let mut fa = f(a)?;
    let mut fb = f(b)?;
    let mut evaluations = 2;
    let done = |x: f64, fx: f64, iterations: usize, evaluations: usize| Root {
        x,
        f: fx,
        iterations,
        evaluations,
    };

    if fa == 0.0 {
        return Ok(done(a, fa, 0, evaluations));
    }
    if fb == 0.0 {
        return Ok(done(b, fb, 0, evaluations));
    }
    if fa.signum() == fb.signum() || fa.is_nan() || fb.is_nan() {
        return Err(SolverError::BracketWithoutSignChange {
            lower,
            upper,
            f_lower: fa,
            f_upper: fb,
        });
    }

    let (mut c, mut fc) = (b, fb);
    let mut d = b - a;
    let mut e = d;

    for iteration in 1..=settings.max_iterations {
        if fb.signum() == fc.signum() {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol = 2.0 * f64::EPSILON * b.abs() + 0.5 * settings.x_tolerance;
        let half = 0.5 * (c - b);
        if half.abs() <= tol || fb.abs() <= settings.f_tolerance {
            debug!(iteration, x = b, f = fb, "Brent converged");
            return Ok(done(b, fb, iteration, evaluations));
        }

        if e.abs() >= tol && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation, or secant when only two
            // distinct points are available.
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * half * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * half * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let limit = (3.0 * half * q - (tol * q).abs()).min((e * q).abs());
            if 2.0 * p < limit {
                e = d;
                d = p / q;
            } else {
                d = half;
                e = d;
            }
        } else {
            d = half;
            e = d;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol { d } else { tol.copysign(half) };
        fb = f(b)?;
        evaluations += 1;
    }

    Err(SolverError::RootNotFound {
        iterations: settings.max_iterations,
        width: (c - b).abs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn finds_cubic_root() {
        let settings = BrentSettings {
            f_tolerance: 0.0,
            ..BrentSettings::default()
        };
        let root = brent(|x| Ok(x * x * x - 2.0 * x - 5.0), 2.0, 3.0, &settings)
            .expect("root should be found");
        assert_abs_diff_eq!(root.x, 2.094_551_481_542_327, epsilon = 1e-8);
        assert!(root.evaluations < 20, "took {} evaluations", root.evaluations);
    }

    #[test]
    fn stops_on_function_tolerance() {
        let settings = BrentSettings {
            x_tolerance: 1e-14,
            f_tolerance: 1e-3,
            max_iterations: 100,
        };
        let root = brent(|x| Ok(x - 0.25), 0.0, 1.0, &settings).expect("root should be found");
        assert!(root.f.abs() <= 1e-3);
    }

    #[test]
    fn rejects_bracket_without_sign_change() {
        let err = brent(|x| Ok(x * x + 1.0), -1.0, 1.0, &BrentSettings::default())
            .expect_err("expected bracket error");
        assert!(matches!(err, SolverError::BracketWithoutSignChange { .. }));
        assert!(format!("{err}").contains("sign"));
    }

    #[test]
    fn endpoint_root_returns_immediately() {
        let root = brent(|x| Ok(x), 0.0, 1.0, &BrentSettings::default()).expect("root");
        assert_eq!(root.x, 0.0);
        assert_eq!(root.evaluations, 2);
    }

    #[test]
    fn objective_errors_propagate() {
        let err = brent(
            |x| {
                if x > 0.5 {
                    Err(SolverError::InvalidInput("boom".to_string()))
                } else {
                    Ok(x - 0.75)
                }
            },
            0.0,
            1.0,
            &BrentSettings::default(),
        )
        .expect_err("expected objective error");
        assert_eq!(err, SolverError::InvalidInput("boom".to_string()));
    }

    #[test]
    fn reports_exhausted_iterations() {
        let settings = BrentSettings {
            x_tolerance: 1e-15,
            f_tolerance: 0.0,
            max_iterations: 2,
        };
        let err = brent(|x| Ok(x.powi(3) - 0.3), 0.0, 1.0, &settings).expect_err("too few steps");
        assert!(matches!(err, SolverError::RootNotFound { iterations: 2, .. }));
    }
}

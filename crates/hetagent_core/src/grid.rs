//! Asset grids.
//!
//! Grids are strictly increasing and may be non-uniform. Besides the points
//! themselves an [`AssetGrid`] carries the forward and backward spacings used
//! by the finite differences and the trapezoid cell widths used to turn
//! probability masses into densities.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetGrid {
    points: Vec<f64>,
    forward: Vec<f64>,
    backward: Vec<f64>,
    widths: Vec<f64>,
}

/// Serializable description of how to build an [`AssetGrid`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum GridSpec {
    Uniform {
        n: usize,
        low: f64,
        high: f64,
    },
    PowerSpaced {
        n: usize,
        k: f64,
        low: f64,
        high: f64,
    },
    TwoSidedPowerSpaced {
        n: usize,
        k_neg: f64,
        k_pos: f64,
        frac_neg: f64,
        low: f64,
        high: f64,
    },
}

impl GridSpec {
    pub fn build(&self) -> Result<AssetGrid> {
        match *self {
            GridSpec::Uniform { n, low, high } => AssetGrid::uniform(n, low, high),
            GridSpec::PowerSpaced { n, k, low, high } => AssetGrid::power_spaced(n, k, low, high),
            GridSpec::TwoSidedPowerSpaced {
                n,
                k_neg,
                k_pos,
                frac_neg,
                low,
                high,
            } => AssetGrid::two_sided_power_spaced(n, k_neg, k_pos, frac_neg, low, high),
        }
    }
}

impl AssetGrid {
    pub fn from_points(points: Vec<f64>) -> Result<Self> {
        let n = points.len();
        if n < 2 {
            bail!("Asset grid needs at least two points, got {}.", n);
        }
        if points.iter().any(|p| !p.is_finite()) {
            bail!("Asset grid contains non-finite points.");
        }
        if let Some(i) = (1..n).find(|&i| points[i] <= points[i - 1]) {
            bail!(
                "Asset grid must be strictly increasing (a[{}] = {} <= a[{}] = {}).",
                i,
                points[i],
                i - 1,
                points[i - 1]
            );
        }

        let mut forward = vec![0.0; n];
        let mut backward = vec![0.0; n];
        for i in 0..n - 1 {
            forward[i] = points[i + 1] - points[i];
            backward[i + 1] = forward[i];
        }
        // The end points reuse their only available neighbor spacing.
        forward[n - 1] = forward[n - 2];
        backward[0] = backward[1];
        let widths = forward
            .iter()
            .zip(&backward)
            .map(|(f, b)| 0.5 * (f + b))
            .collect();

        Ok(Self {
            points,
            forward,
            backward,
            widths,
        })
    }

    pub fn uniform(n: usize, low: f64, high: f64) -> Result<Self> {
        Self::power_spaced(n, 1.0, low, high)
    }

    /// `a_i = low + (high - low) * (i / (n - 1))^k`. Points crowd toward
    /// `low` for `k > 1`; `k = 1` is the uniform grid.
    pub fn power_spaced(n: usize, k: f64, low: f64, high: f64) -> Result<Self> {
        validate_range(n, low, high)?;
        if !(k > 0.0) || !k.is_finite() {
            bail!("Grid curvature must be positive and finite, got {}.", k);
        }
        Self::from_points(power_points(n, k, low, high))
    }

    /// Grid with `round(frac_neg * n)` points on `[low, 0)` and the rest on
    /// `[0, high]`.
    ///
    /// The negative range is split at its midpoint into two mirrored halves,
    /// one crowding toward the borrowing limit and one toward zero, each with
    /// curvature `k_neg`. That requires an even number of negative points; an
    /// odd count hands one point to the positive side.
    pub fn two_sided_power_spaced(
        n: usize,
        k_neg: f64,
        k_pos: f64,
        frac_neg: f64,
        low: f64,
        high: f64,
    ) -> Result<Self> {
        validate_range(n, low, high)?;
        if !(0.0..1.0).contains(&frac_neg) {
            bail!("frac_neg must lie in [0, 1), got {}.", frac_neg);
        }
        for (name, k) in [("k_neg", k_neg), ("k_pos", k_pos)] {
            if !(k > 0.0) || !k.is_finite() {
                bail!("{} must be positive and finite, got {}.", name, k);
            }
        }
        if high <= 0.0 {
            bail!("Two-sided grid needs a positive upper bound, got {}.", high);
        }

        let mut n_neg = (frac_neg * n as f64).round() as usize;
        if n_neg > 0 && low >= 0.0 {
            bail!(
                "frac_neg = {} requests negative points but the lower bound {} is not negative.",
                frac_neg,
                low
            );
        }
        if n_neg % 2 == 1 {
            warn!(
                n_neg,
                "negative side needs an even point count; moving one point to the positive side"
            );
            n_neg -= 1;
        }
        let n_pos = n - n_neg;
        if n_pos < 2 {
            bail!(
                "Two-sided grid leaves {} points for the positive side; at least 2 are required.",
                n_pos
            );
        }

        let mut points = Vec::with_capacity(n);
        if n_neg > 0 {
            let half = n_neg / 2;
            let mid = 0.5 * low;
            for j in 0..half {
                let s = j as f64 / half as f64;
                points.push(low + (mid - low) * s.powf(k_neg));
            }
            for j in (1..=half).rev() {
                let s = j as f64 / half as f64;
                points.push(mid * s.powf(k_neg));
            }
        }
        let positive_low = if n_neg > 0 { 0.0 } else { low.max(0.0) };
        points.extend(power_points(n_pos, k_pos, positive_low, high));
        Self::from_points(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn min(&self) -> f64 {
        self.points[0]
    }

    pub fn max(&self) -> f64 {
        self.points[self.points.len() - 1]
    }

    /// `a[i+1] - a[i]`; the last entry repeats the final spacing.
    pub fn forward_spacing(&self) -> &[f64] {
        &self.forward
    }

    /// `a[i] - a[i-1]`; the first entry repeats the initial spacing.
    pub fn backward_spacing(&self) -> &[f64] {
        &self.backward
    }

    /// Trapezoid widths `(Δa_f + Δa_b) / 2`. Equal to Δa everywhere on a
    /// uniform grid.
    pub fn cell_widths(&self) -> &[f64] {
        &self.widths
    }

    pub fn min_spacing(&self) -> f64 {
        self.forward.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    pub fn is_uniform(&self, tol: f64) -> bool {
        let h = self.forward[0];
        self.forward.iter().all(|d| (d - h).abs() <= tol * h.abs())
    }
}

fn validate_range(n: usize, low: f64, high: f64) -> Result<()> {
    if n < 2 {
        bail!("Asset grid needs at least two points, got {}.", n);
    }
    if !low.is_finite() || !high.is_finite() {
        bail!("Asset grid bounds must be finite.");
    }
    if low >= high {
        bail!("Asset grid lower bound {} must be below upper bound {}.", low, high);
    }
    Ok(())
}

fn power_points(n: usize, k: f64, low: f64, high: f64) -> Vec<f64> {
    let span = high - low;
    let last = (n - 1) as f64;
    (0..n)
        .map(|i| {
            if i == n - 1 {
                high
            } else {
                low + span * (i as f64 / last).powf(k)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn power_spacing_with_unit_curvature_is_uniform() {
        let grid = AssetGrid::power_spaced(11, 1.0, -0.1, 0.9).expect("grid should build");
        let uniform = AssetGrid::uniform(11, -0.1, 0.9).expect("grid should build");
        assert_eq!(grid.len(), 11);
        assert!(grid.is_uniform(1e-12));
        for (a, b) in grid.points().iter().zip(uniform.points()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-15);
        }
        assert_relative_eq!(grid.points()[1] - grid.points()[0], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn power_spacing_crowds_toward_lower_bound() {
        let grid = AssetGrid::power_spaced(20, 2.0, 0.0, 1.0).expect("grid should build");
        let spacing = grid.forward_spacing();
        assert!(spacing[0] < spacing[17]);
        assert_eq!(grid.min(), 0.0);
        assert_eq!(grid.max(), 1.0);
    }

    #[test]
    fn two_sided_without_negative_fraction_matches_positive_power_grid() {
        let two_sided = AssetGrid::two_sided_power_spaced(30, 2.0, 1.5, 0.0, -0.5, 2.0)
            .expect("grid should build");
        let positive = AssetGrid::power_spaced(30, 1.5, 0.0, 2.0).expect("grid should build");
        assert_eq!(two_sided.points(), positive.points());
    }

    #[test]
    fn two_sided_grid_is_increasing_and_straddles_zero() {
        let grid = AssetGrid::two_sided_power_spaced(40, 2.0, 2.0, 0.25, -1.0, 4.0)
            .expect("grid should build");
        assert_eq!(grid.len(), 40);
        assert_eq!(grid.min(), -1.0);
        assert_eq!(grid.max(), 4.0);
        assert!(grid.points().windows(2).all(|w| w[1] > w[0]));
        assert_eq!(grid.points().iter().filter(|&&a| a < 0.0).count(), 10);
        assert!(grid.points().contains(&0.0));
        // Denser near the kink at zero than in the middle of the negative range.
        let idx_zero = grid.points().iter().position(|&a| a == 0.0).unwrap();
        let near_zero = grid.points()[idx_zero] - grid.points()[idx_zero - 1];
        let middle = grid.points()[5] - grid.points()[4];
        assert!(near_zero < middle);
    }

    #[test]
    fn two_sided_grid_adjusts_odd_negative_count() {
        // round(0.3 * 15) = 5 negative points requested; one moves across.
        let grid = AssetGrid::two_sided_power_spaced(15, 1.0, 1.0, 0.3, -1.0, 1.0)
            .expect("grid should build");
        assert_eq!(grid.len(), 15);
        assert_eq!(grid.points().iter().filter(|&&a| a < 0.0).count(), 4);
    }

    #[test]
    fn two_sided_grid_rejects_negative_fraction_with_positive_bound() {
        let err = AssetGrid::two_sided_power_spaced(20, 1.0, 1.0, 0.5, 0.5, 1.0)
            .expect_err("expected bound error");
        assert!(format!("{err}").contains("not negative"));
    }

    #[test]
    fn cell_widths_equal_spacing_on_uniform_grid() {
        let grid = AssetGrid::uniform(5, 0.0, 1.0).expect("grid should build");
        for w in grid.cell_widths() {
            assert_relative_eq!(*w, 0.25, epsilon = 1e-15);
        }
    }

    #[test]
    fn cell_widths_use_trapezoid_rule_on_nonuniform_grid() {
        let grid = AssetGrid::from_points(vec![0.0, 1.0, 3.0, 7.0]).expect("grid should build");
        assert_eq!(grid.cell_widths(), &[1.0, 1.5, 3.0, 4.0]);
        assert_eq!(grid.forward_spacing(), &[1.0, 2.0, 4.0, 4.0]);
        assert_eq!(grid.backward_spacing(), &[1.0, 1.0, 2.0, 4.0]);
    }

    #[test]
    fn from_points_rejects_non_increasing_input() {
        let err = AssetGrid::from_points(vec![0.0, 1.0, 1.0]).expect_err("expected error");
        assert!(format!("{err}").contains("strictly increasing"));
    }

    #[test]
    fn grid_spec_round_trips_through_json() {
        let spec = GridSpec::TwoSidedPowerSpaced {
            n: 50,
            k_neg: 2.0,
            k_pos: 3.0,
            frac_neg: 0.2,
            low: -1.0,
            high: 10.0,
        };
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: GridSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(spec, back);
        assert_eq!(back.build().expect("grid should build").len(), 50);
    }
}

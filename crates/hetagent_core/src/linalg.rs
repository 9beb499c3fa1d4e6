//! Sparse helpers and a banded direct solver.
//!
//! Generators over (asset, income) only couple neighboring asset points and
//! income states at the same asset point. Ordered income-fastest, every
//! matrix the solvers factor is banded with bandwidth close to the number of
//! income states, so Gaussian elimination with partial pivoting inside the
//! band costs `O(N * N_z^2)`.

use crate::error::{SolverError, SolverResult};
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Pivots below this multiple of the largest matrix entry count as zero.
const PIVOT_TOLERANCE: f64 = 64.0 * f64::EPSILON;

/// `shift * I + scale * matrix`.
pub fn shifted(matrix: &CsrMatrix<f64>, shift: f64, scale: f64) -> CsrMatrix<f64> {
    let n = matrix.nrows();
    let mut coo = CooMatrix::new(n, matrix.ncols());
    for (i, j, v) in matrix.triplet_iter() {
        coo.push(i, j, scale * v);
    }
    if shift != 0.0 {
        for i in 0..n {
            coo.push(i, i, shift);
        }
    }
    CsrMatrix::from(&coo)
}

/// Copy of `matrix` with row `row` replaced by the unit vector `e_row`.
pub fn with_unit_row(matrix: &CsrMatrix<f64>, row: usize) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(matrix.nrows(), matrix.ncols());
    for (i, j, v) in matrix.triplet_iter() {
        if i != row {
            coo.push(i, j, *v);
        }
    }
    coo.push(row, row, 1.0);
    CsrMatrix::from(&coo)
}

pub fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

/// Solves `matrix * x = rhs` by banded Gaussian elimination with partial
/// pivoting.
///
/// `ordering[k]` is the original index eliminated at step `k`; it must be a
/// permutation of `0..n`. The band is measured after reordering, so a good
/// ordering keeps the cost linear in `n`.
pub fn solve_banded(
    matrix: &CsrMatrix<f64>,
    rhs: &DVector<f64>,
    ordering: &[usize],
) -> SolverResult<DVector<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(SolverError::InvalidInput(format!(
            "banded solve needs a square matrix, got {}x{}",
            n,
            matrix.ncols()
        )));
    }
    if rhs.len() != n || ordering.len() != n {
        return Err(SolverError::InvalidInput(format!(
            "banded solve dimension mismatch: matrix {}, rhs {}, ordering {}",
            n,
            rhs.len(),
            ordering.len()
        )));
    }
    if n == 0 {
        return Ok(DVector::zeros(0));
    }

    let mut position = vec![usize::MAX; n];
    for (k, &original) in ordering.iter().enumerate() {
        if original >= n || position[original] != usize::MAX {
            return Err(SolverError::InvalidInput(
                "ordering is not a permutation".to_string(),
            ));
        }
        position[original] = k;
    }

    let mut kl = 0usize;
    let mut ku = 0usize;
    let mut scale = 0.0f64;
    for (i, j, v) in matrix.triplet_iter() {
        let (pi, pj) = (position[i], position[j]);
        if pi > pj {
            kl = kl.max(pi - pj);
        } else {
            ku = ku.max(pj - pi);
        }
        scale = scale.max(v.abs());
    }

    // Row p stores columns p - kl ..= p + ku + kl; the extra kl columns
    // absorb fill-in from row swaps.
    let width = 2 * kl + ku + 1;
    let at = |row: usize, col: usize| row * width + col + kl - row;
    let mut band = vec![0.0; n * width];
    for (i, j, v) in matrix.triplet_iter() {
        band[at(position[i], position[j])] += *v;
    }
    let mut b: Vec<f64> = ordering.iter().map(|&original| rhs[original]).collect();

    let tolerance = scale * PIVOT_TOLERANCE;
    for k in 0..n {
        let last_row = (k + kl).min(n - 1);
        let last_col = (k + ku + kl).min(n - 1);

        let mut pivot_row = k;
        let mut best = band[at(k, k)].abs();
        for i in k + 1..=last_row {
            let candidate = band[at(i, k)].abs();
            if candidate > best {
                best = candidate;
                pivot_row = i;
            }
        }
        if !(best > tolerance) {
            return Err(SolverError::SingularSystem {
                row: ordering[k],
                pivot: best,
            });
        }
        if pivot_row != k {
            for j in k..=last_col {
                band.swap(at(k, j), at(pivot_row, j));
            }
            b.swap(k, pivot_row);
        }

        let pivot = band[at(k, k)];
        for i in k + 1..=last_row {
            let factor = band[at(i, k)] / pivot;
            if factor == 0.0 {
                continue;
            }
            band[at(i, k)] = 0.0;
            for j in k + 1..=last_col {
                band[at(i, j)] -= factor * band[at(k, j)];
            }
            b[i] -= factor * b[k];
        }
    }

    let mut x = vec![0.0; n];
    for k in (0..n).rev() {
        let last_col = (k + ku + kl).min(n - 1);
        let mut acc = b[k];
        for j in k + 1..=last_col {
            acc -= band[at(k, j)] * x[j];
        }
        x[k] = acc / band[at(k, k)];
    }

    let mut out = DVector::zeros(n);
    for (k, &original) in ordering.iter().enumerate() {
        out[original] = x[k];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn csr_from_dense(dense: &DMatrix<f64>) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(dense.nrows(), dense.ncols());
        for i in 0..dense.nrows() {
            for j in 0..dense.ncols() {
                if dense[(i, j)] != 0.0 {
                    coo.push(i, j, dense[(i, j)]);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn banded_solve_matches_dense_lu() {
        let dense = DMatrix::from_row_slice(
            5,
            5,
            &[
                4.0, -1.0, 0.0, 0.0, 0.5, //
                -1.0, 4.0, -1.0, 0.0, 0.0, //
                0.0, -1.0, 4.0, -1.0, 0.0, //
                0.0, 0.0, -1.0, 4.0, -1.0, //
                0.3, 0.0, 0.0, -1.0, 4.0,
            ],
        );
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let expected = dense.clone().lu().solve(&rhs).expect("dense solve");
        let ordering: Vec<usize> = (0..5).collect();
        let x = solve_banded(&csr_from_dense(&dense), &rhs, &ordering).expect("banded solve");
        for i in 0..5 {
            assert!((x[i] - expected[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn banded_solve_pivots_on_zero_diagonal() {
        let dense = DMatrix::from_row_slice(3, 3, &[0.0, 2.0, 0.0, 1.0, 1.0, 0.0, 0.0, 3.0, 5.0]);
        let rhs = DVector::from_vec(vec![2.0, 3.0, 13.0]);
        let ordering = vec![2, 0, 1];
        let x = solve_banded(&csr_from_dense(&dense), &rhs, &ordering).expect("banded solve");
        let residual = &dense * &x - &rhs;
        assert!(max_abs(&residual) < 1e-12);
        assert!((x[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn banded_solve_reports_singular_matrix() {
        let dense = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let rhs = DVector::from_vec(vec![1.0, 1.0]);
        let err = solve_banded(&csr_from_dense(&dense), &rhs, &[0, 1]).expect_err("singular");
        assert!(matches!(err, SolverError::SingularSystem { .. }));
    }

    #[test]
    fn ordering_must_be_a_permutation() {
        let dense = DMatrix::<f64>::identity(2, 2);
        let rhs = DVector::from_vec(vec![1.0, 1.0]);
        let err = solve_banded(&csr_from_dense(&dense), &rhs, &[0, 0]).expect_err("bad ordering");
        assert!(format!("{err}").contains("permutation"));
    }

    #[test]
    fn shifted_and_unit_row_helpers() {
        let dense = DMatrix::from_row_slice(2, 2, &[-1.0, 1.0, 2.0, -2.0]);
        let a = csr_from_dense(&dense);
        let b = shifted(&a, 3.0, -1.0);
        let x = DVector::from_vec(vec![1.0, 1.0]);
        let y = &b * &x;
        assert_eq!(y.as_slice(), &[3.0, 3.0]);
        let c = with_unit_row(&a, 1);
        let y = &c * &DVector::from_vec(vec![5.0, 7.0]);
        assert_eq!(y.as_slice(), &[2.0, 7.0]);
    }
}

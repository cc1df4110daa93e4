//! Dense symmetric positive-definite solver for the regularized normal equations.

use crate::error::{AppError, Result};
use ndarray::{Array1, Array2};

/// Solve `A x = b` for symmetric positive-definite `A` by Cholesky factorization.
pub fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return Err(AppError::Internal(format!(
            "cholesky_solve: shape mismatch ({}x{} vs {})",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(AppError::Internal(format!(
                "matrix is not positive definite at pivot {}",
                j
            )));
        }
        let d = diag.sqrt();
        l[[j, j]] = d;

        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / d;
        }
    }

    // L z = b
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut s = b[i];
        for k in 0..i {
            s -= l[[i, k]] * z[k];
        }
        z[i] = s / l[[i, i]];
    }

    // Lᵀ x = z
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut s = z[i];
        for k in (i + 1)..n {
            s -= l[[k, i]] * x[k];
        }
        x[i] = s / l[[i, i]];
    }

    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_solves_spd_system() {
        let a = array![[4.0, 12.0, -16.0], [12.0, 37.0, -43.0], [-16.0, -43.0, 98.0]];
        let expected = array![1.0, -2.0, 3.0];
        let b = a.dot(&expected);
        let x = cholesky_solve(&a, &b).unwrap();
        for (got, want) in x.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let b = array![1.0, 1.0];
        assert!(cholesky_solve(&a, &b).is_err());
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let a = Array2::<f64>::eye(2);
        let b = array![1.0, 1.0, 1.0];
        assert!(cholesky_solve(&a, &b).is_err());
    }
}

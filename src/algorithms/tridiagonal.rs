//! Stabilization and eigendecomposition of the Lanczos tridiagonal matrix.
//!
//! When the Lanczos process reaches an invariant subspace, `T_m` can be singular or very
//! close to it. Before diagonalizing, its diagonal is shifted by a small multiple of its
//! smallest diagonal entry, `T_m + jitter * min_i T[i, i] * I`. The shift moves every
//! eigenvalue by the same amount and leaves the eigenvectors untouched.

use super::LanczosDecomposition;
use crate::error::DiagonalizationError;
use faer::{Col, Mat, MatRef, Side};

/// Returns `T + coefficient * min_i T[i, i] * I`.
///
/// The minimum diagonal entry is used, not the mean or the maximum.
pub fn add_jitter(t: MatRef<'_, f64>, coefficient: f64) -> Mat<f64> {
    let m = t.nrows();
    let mut jittered = t.to_owned();
    if m == 0 || coefficient == 0.0 {
        return jittered;
    }
    let min_diag = (0..m).map(|i| t[(i, i)]).fold(f64::INFINITY, f64::min);
    let shift = coefficient * min_diag;
    for i in 0..m {
        jittered[(i, i)] += shift;
    }
    jittered
}

/// Eigenvalues (ascending) and orthogonal eigenvectors of a symmetric tridiagonal matrix.
#[derive(Clone, Debug)]
pub struct TridiagonalEigen {
    pub eigenvalues: Col<f64>,
    pub eigenvectors: Mat<f64>,
}

/// Diagonalizes a small symmetric (tridiagonal) matrix, `U^T T U = diag(eigenvalues)`.
///
/// Uses `faer`'s dense self-adjoint eigensolver. A failure to converge is reported as a
/// numerical failure.
pub fn tridiagonal_eigen(t: MatRef<'_, f64>) -> Result<TridiagonalEigen, DiagonalizationError> {
    let evd = t.self_adjoint_eigen(Side::Lower)?;
    let diag = evd.S();
    let eigenvalues = Col::from_fn(diag.dim(), |i| diag[i]);
    Ok(TridiagonalEigen {
        eigenvalues,
        eigenvectors: evd.U().to_owned(),
    })
}

/// Builds `T_m` from its coefficients, applies the jitter, and diagonalizes it.
pub fn jittered_eigen(
    decomposition: &LanczosDecomposition,
    jitter: f64,
) -> Result<TridiagonalEigen, DiagonalizationError> {
    let t = decomposition.to_dense();
    let jittered = add_jitter(t.as_ref(), jitter);
    tridiagonal_eigen(jittered.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_jitter_uses_minimum_diagonal() {
        let t: Mat<f64> = mat![[4.0, 1.0, 0.0], [1.0, 2.0, 1.0], [0.0, 1.0, 8.0]];
        let jittered = add_jitter(t.as_ref(), 0.5);
        // min diag = 2, shift = 1.
        assert_eq!(jittered[(0, 0)], 5.0);
        assert_eq!(jittered[(1, 1)], 3.0);
        assert_eq!(jittered[(2, 2)], 9.0);
        assert_eq!(jittered[(0, 1)], 1.0);
        assert_eq!(jittered[(2, 1)], 1.0);
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let t: Mat<f64> = mat![[1.0, 2.0], [2.0, -3.0]];
        assert_eq!(add_jitter(t.as_ref(), 0.0), t);
    }

    #[test]
    fn test_eigen_diagonalizes_tridiagonal() {
        let decomposition = LanczosDecomposition {
            alphas: vec![2.0, 2.0, 2.0, 2.0],
            betas: vec![-1.0, -1.0, -1.0],
            steps_taken: 4,
        };
        let t = decomposition.to_dense();
        let eig = jittered_eigen(&decomposition, 0.0).unwrap();

        let u = eig.eigenvectors.as_ref();
        let m = eig.eigenvalues.nrows();
        assert_eq!(m, 4);
        let ortho_loss = (&Mat::<f64>::identity(m, m) - u.transpose() * u).norm_l2();
        assert!(ortho_loss < 1e-12);

        let d = u.transpose() * &t * u;
        for i in 0..m {
            assert!((d[(i, i)] - eig.eigenvalues[i]).abs() < 1e-12);
            if i > 0 {
                assert!(eig.eigenvalues[i - 1] <= eig.eigenvalues[i]);
            }
        }

        // The eigenvalues of this matrix are 2 - 2 cos(k pi / 5), k = 1..4.
        let expected_min = 2.0 - 2.0 * (std::f64::consts::PI / 5.0).cos();
        assert!((eig.eigenvalues[0] - expected_min).abs() < 1e-12);
    }

    #[test]
    fn test_jitter_shifts_eigenvalues_uniformly() {
        let decomposition = LanczosDecomposition {
            alphas: vec![3.0, 1.0],
            betas: vec![0.5],
            steps_taken: 2,
        };
        let plain = jittered_eigen(&decomposition, 0.0).unwrap();
        let shifted = jittered_eigen(&decomposition, 1e-3).unwrap();
        for i in 0..2 {
            assert!((shifted.eigenvalues[i] - plain.eigenvalues[i] - 1e-3).abs() < 1e-12);
        }
    }
}

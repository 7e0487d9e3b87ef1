//! Low-level building blocks of the diagonalization.
//!
//! - [`lanczos`]: the Lanczos tridiagonalization of an implicit operator, one independent
//!   run per batch element and probe vector.
//! - [`tridiagonal`]: jitter stabilization and dense eigendecomposition of the resulting
//!   small tridiagonal matrices.
//!
//! Most users should go through [`crate::diagonalization`] instead.

pub mod lanczos;
pub mod tridiagonal;

use faer::Mat;

/// The scalar coefficients of the symmetric tridiagonal matrix `T_m` produced by `m`
/// Lanczos steps: `alphas` on the diagonal and `betas` on both off-diagonals.
#[derive(Clone, Debug, PartialEq)]
pub struct LanczosDecomposition {
    /// The `m` diagonal coefficients.
    pub alphas: Vec<f64>,
    /// The `m - 1` off-diagonal coefficients.
    pub betas: Vec<f64>,
    /// Number of completed iterations, `m`.
    pub steps_taken: usize,
}

impl LanczosDecomposition {
    /// Assembles the dense `m x m` tridiagonal matrix `T_m`.
    pub fn to_dense(&self) -> Mat<f64> {
        let steps = self.steps_taken;
        let mut t_m = Mat::zeros(steps, steps);
        for (i, &alpha) in self.alphas.iter().enumerate() {
            t_m[(i, i)] = alpha;
        }
        for (i, &beta) in self.betas.iter().enumerate() {
            t_m[(i, i + 1)] = beta;
            t_m[(i + 1, i)] = beta;
        }
        t_m
    }
}

/// Output of a single Lanczos run.
#[derive(Clone, Debug)]
pub struct LanczosOutput {
    /// The `n x m` orthonormal basis `Q_0`.
    pub basis: Mat<f64>,
    /// The coefficients of `T_m = Q_0^T A Q_0`.
    pub decomposition: LanczosDecomposition,
}

//! Differentiable Lanczos diagonalization of implicit symmetric operators.
//!
//! This crate computes an approximate eigendecomposition `A ≈ Q diag(Λ) Q^T` of a large
//! symmetric matrix `A` (or a batch of them) that is only available through matrix-vector
//! products, using a fixed number of Lanczos iterations. It also provides the exact
//! reverse-mode gradient of `(Λ, Q)` with respect to the parameters that define `A`, so the
//! decomposition can sit inside a gradient-based optimization loop.
//!
//! Built on the [`faer`] linear algebra framework, the operator is described by an
//! [`operator::OperatorRepresentation`] that builds a matrix-free
//! [`operator::MatrixOperator`] out of parameter tensors.
//!
//! ## Pipeline
//!
//! 1. **Lanczos tridiagonalization** ([`algorithms::lanczos`]): from each probe vector,
//!    build an orthonormal basis `Q_0` and a tridiagonal `T_m = Q_0^T A Q_0`, with full
//!    reorthogonalization and early termination on breakdown.
//! 2. **Jitter** ([`algorithms::tridiagonal::add_jitter`]): shift `T_m` by
//!    `jitter * min(diag(T_m))` to keep the small eigensolve well posed.
//! 3. **Tridiagonal eigensolve** ([`algorithms::tridiagonal::tridiagonal_eigen`]):
//!    `T_m = U diag(Λ) U^T`.
//! 4. **Composition** ([`diagonalization`]): `Q = Q_0 U`, plus a saved state for the
//!    closed-form backward pass.
//!
//! ## Example Usage
//!
//! ```rust
//! use faer::Mat;
//! use lanczos_diagonalization::{
//!     DenseRepresentation, DiagonalizationConfig, MatBatch, MatrixShape,
//!     OperatorParameters, ProbeVectors, diagonalize, diagonalize_backward,
//! };
//! use rand::{SeedableRng, rngs::StdRng};
//!
//! // A small symmetric positive definite matrix.
//! let a = Mat::from_fn(4, 4, |i, j| {
//!     if i == j { 4.0 + i as f64 }
//!     else if (i as isize - j as isize).abs() == 1 { 1.0 }
//!     else { 0.0 }
//! });
//! let parameters = OperatorParameters::new(vec![MatBatch::single(a.clone())]);
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let (output, state) = diagonalize(
//!     &DenseRepresentation,
//!     &parameters,
//!     &MatrixShape::new(4),
//!     4,
//!     ProbeVectors::default(),
//!     DiagonalizationConfig::default().with_tridiagonal_jitter(0.0),
//!     &mut rng,
//! )
//! .unwrap();
//!
//! // With max_iter = n the reconstruction is exact up to rounding.
//! let reconstructed = output.reconstruct(0).unwrap();
//! assert!((&reconstructed - &a).norm_l2() < 1e-10);
//!
//! // Gradient of L = sum(Λ) = trace(A) is the identity.
//! let d_eigenvalues = output.eigenvalues.map(|l| faer::Col::from_fn(l.nrows(), |_| 1.0));
//! let grads = diagonalize_backward(Some(&d_eigenvalues), None, state).unwrap();
//! let d_a = &grads.get(0).unwrap().items()[0];
//! assert!((d_a - &Mat::<f64>::identity(4, 4)).norm_l2() < 1e-10);
//! ```

// Declare the modules that form the crate's API structure.
pub mod algorithms;
pub mod batch;
pub mod config;
pub mod diagonalization;
pub mod error;
pub mod operator;

// Re-export the main API for convenient access.
pub use batch::{Batch, BatchShape, ColBatch, MatBatch};
pub use config::DiagonalizationConfig;
pub use diagonalization::{
    Diagonalization, DiagonalizationOutput, MatrixShape, ProbeVectors, SavedState, diagonalize,
    diagonalize_backward,
};
pub use error::DiagonalizationError;
pub use operator::{
    DenseRepresentation, FnRepresentation, LowRankPlusDiagRepresentation, MatrixOperator,
    OperatorParameters, OperatorRepresentation, ParameterGradients,
};

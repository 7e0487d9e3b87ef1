//! Approximate eigendecomposition of an implicit symmetric operator, and its gradient.
//!
//! The forward pass ([`Diagonalization::evaluate`]) runs `max_iter` Lanczos steps from each
//! probe vector, diagonalizes the jittered tridiagonal matrix `T_m = U diag(Λ) U^T`, and
//! returns the eigenvalues `Λ` together with the eigenvectors `Q = Q_0 U`, so that
//! `Q diag(Λ) Q^T` approximates the operator.
//!
//! The backward pass ([`Diagonalization::gradient`]) does not differentiate through the
//! iteration. It differentiates the eigendecomposition itself with the closed form of
//! Ionescu et al., "Matrix Backpropagation for Deep Networks with Structured Layers" (2015):
//!
//! ```text
//! K[i, j]  = 1 / (Λ[i] - Λ[j] + ε)  for i != j,  K[i, i] = 0
//! dL/dA    = Q (K^T ⊙ (Q^T dL/dQ)) Q^T  +  Q diag(dL/dΛ) Q^T
//! ```
//!
//! which is exact when `(Q, Λ)` are eigenpairs of the operator, e.g. when `max_iter = n`.
//!
//! The two passes are tied together by a [`SavedState`] owned by the caller: every forward
//! call returns its own state, and the gradient call consumes it.
//!
//! ## Output shape
//!
//! Each output element corresponds to one (probe, batch element) pair. The leading shape of
//! the outputs is `[probes] ++ batch_shape`, where the probe axis only appears when more
//! than one probe vector was used, and the batch axes only appear when a batch shape was
//! declared.

use crate::{
    algorithms::{
        lanczos::{lanczos_tridiag, random_probes},
        tridiagonal::jittered_eigen,
    },
    batch::{BatchShape, ColBatch, MatBatch, map_elements},
    config::DiagonalizationConfig,
    error::DiagonalizationError,
    operator::{MatrixOperator, OperatorParameters, OperatorRepresentation, ParameterGradients},
};
use faer::{Accum, Col, Mat, MatRef, Par, linalg::matmul::matmul};
use rand::Rng;

/// Floor added to every eigenvalue gap in the backward pass. Colliding eigenvalues then give
/// large but finite gradients instead of a division by zero.
pub const EIGENGAP_FLOOR: f64 = 1e-10;

/// The declared shape of the implicit matrix: `n x n`, optionally batched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixShape {
    pub size: usize,
    /// `None` for a single matrix. Outputs then carry no batch axes.
    pub batch_shape: Option<BatchShape>,
}

impl MatrixShape {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            batch_shape: None,
        }
    }

    pub fn batched(size: usize, batch_shape: impl Into<BatchShape>) -> Self {
        Self {
            size,
            batch_shape: Some(batch_shape.into()),
        }
    }

    /// The batch shape the operator must have; an absent shape is one implicit element.
    pub fn effective_batch_shape(&self) -> BatchShape {
        self.batch_shape.clone().unwrap_or_else(BatchShape::scalar)
    }
}

/// How the Lanczos runs are seeded.
#[derive(Clone, Debug)]
pub enum ProbeVectors {
    /// `count` independent standard normal vectors per batch element, drawn from the RNG.
    Random { count: usize },
    /// Caller-supplied starting vectors: one `n x p` block per batch element.
    Explicit(MatBatch),
}

impl Default for ProbeVectors {
    fn default() -> Self {
        ProbeVectors::Random { count: 1 }
    }
}

/// The eigenvalues and eigenvectors returned by the forward pass.
#[derive(Clone, Debug)]
pub struct DiagonalizationOutput {
    /// `Λ`, ascending, length `m` per element.
    pub eigenvalues: ColBatch,
    /// `Q = Q_0 U`, `n x m` per element, orthonormal columns.
    pub eigenvectors: MatBatch,
}

impl DiagonalizationOutput {
    pub fn shape(&self) -> &BatchShape {
        self.eigenvectors.shape()
    }

    /// Returns `Q diag(Λ) Q^T` for the element at a flat index.
    pub fn reconstruct(&self, index: usize) -> Option<Mat<f64>> {
        let q = self.eigenvectors.get(index)?;
        let lambda = self.eigenvalues.get(index)?;
        let scaled = Mat::from_fn(q.nrows(), q.ncols(), |i, j| q[(i, j)] * lambda[j]);
        Some(&scaled * q.transpose())
    }
}

/// Everything the gradient pass needs from its forward pass.
///
/// The state owns its data: concurrent forward calls never share one. It is consumed by
/// [`Diagonalization::gradient`] (or [`diagonalize_backward`]), which releases it.
pub struct SavedState<'r, R: OperatorRepresentation> {
    representation: &'r R,
    parameters: OperatorParameters,
    operator: Option<R::Operator>,
    eigenvalues: ColBatch,
    eigenvectors: MatBatch,
    num_probes: usize,
    batch_shape: BatchShape,
    parallel: bool,
}

impl<'r, R: OperatorRepresentation> SavedState<'r, R> {
    pub fn parameters(&self) -> &OperatorParameters {
        &self.parameters
    }

    pub fn eigenvalues(&self) -> &ColBatch {
        &self.eigenvalues
    }

    pub fn eigenvectors(&self) -> &MatBatch {
        &self.eigenvectors
    }

    /// The operator built during the forward pass. `None` in memory-efficient mode.
    pub fn operator(&self) -> Option<&R::Operator> {
        self.operator.as_ref()
    }

    /// Rebuilds the operator from the saved parameters and the original representation.
    pub fn rebuild_operator(&self) -> Result<R::Operator, DiagonalizationError> {
        self.representation.build(&self.parameters)
    }
}

/// A differentiable diagonalization: [`evaluate`](Self::evaluate) and
/// [`gradient`](Self::gradient) bound to one operator representation and one configuration.
pub struct Diagonalization<'r, R: OperatorRepresentation> {
    representation: &'r R,
    config: DiagonalizationConfig,
}

impl<'r, R: OperatorRepresentation> Diagonalization<'r, R> {
    pub fn new(representation: &'r R, config: DiagonalizationConfig) -> Self {
        Self {
            representation,
            config,
        }
    }

    pub fn config(&self) -> &DiagonalizationConfig {
        &self.config
    }

    /// Runs the forward pass.
    ///
    /// # Arguments
    /// * `parameters`: The parameter tensors the operator is built from.
    /// * `shape`: The declared matrix size and optional batch shape.
    /// * `max_iter`: The number of Lanczos iterations. Fewer columns are returned on breakdown.
    /// * `probes`: Random or explicit starting vectors.
    /// * `rng`: Source of the random probe vectors.
    ///
    /// # Returns
    /// The eigenpairs, and the state to hand to [`Self::gradient`].
    pub fn evaluate<G: Rng>(
        &self,
        parameters: &OperatorParameters,
        shape: &MatrixShape,
        max_iter: usize,
        probes: ProbeVectors,
        rng: &mut G,
    ) -> Result<(DiagonalizationOutput, SavedState<'r, R>), DiagonalizationError> {
        self.config.validate()?;
        if max_iter == 0 {
            return Err(DiagonalizationError::input("`max_iter` must be at least 1."));
        }
        if shape.size == 0 {
            return Err(DiagonalizationError::invalid_shape(
                "declared matrix size",
                "n >= 1",
                shape.size,
            ));
        }

        let batch_shape = shape.effective_batch_shape();
        if batch_shape.numel() == 0 {
            return Err(DiagonalizationError::invalid_shape(
                "declared batch shape",
                "non-empty batch",
                batch_shape.dims(),
            ));
        }

        let operator = self.representation.build(parameters)?;
        if operator.size() != shape.size {
            return Err(DiagonalizationError::invalid_shape(
                "operator size",
                shape.size,
                operator.size(),
            ));
        }
        if operator.batch_shape() != &batch_shape {
            return Err(DiagonalizationError::invalid_shape(
                "operator batch shape",
                batch_shape.dims(),
                operator.batch_shape().dims(),
            ));
        }

        let probes = match probes {
            ProbeVectors::Random { count: 0 } => {
                return Err(DiagonalizationError::input(
                    "At least one probe vector is required.",
                ));
            }
            ProbeVectors::Random { count } => random_probes(shape.size, &batch_shape, count, rng),
            ProbeVectors::Explicit(probes) => probes,
        };

        let lanczos_outputs = lanczos_tridiag(&operator, &probes, max_iter, &self.config)?;
        let num_probes = lanczos_outputs.len() / batch_shape.numel();

        let jitter = self.config.tridiagonal_jitter;
        let eigenpairs = map_elements(lanczos_outputs.len(), self.config.parallel, |element| {
            let output = &lanczos_outputs[element];
            let eig = jittered_eigen(&output.decomposition, jitter)?;

            // Q = Q_0 U, written into a pre-allocated destination.
            let mut q = Mat::<f64>::zeros(output.basis.nrows(), eig.eigenvectors.ncols());
            matmul(
                q.as_mut(),
                Accum::Replace,
                output.basis.as_ref(),
                eig.eigenvectors.as_ref(),
                1.0,
                Par::Seq,
            );
            Ok((eig.eigenvalues, q))
        })?;

        let mut output_shape = match shape.batch_shape {
            Some(_) => batch_shape.clone(),
            None => BatchShape::scalar(),
        };
        if num_probes > 1 {
            output_shape = output_shape.prepend(num_probes);
        }

        let (eigenvalues, eigenvectors): (Vec<Col<f64>>, Vec<Mat<f64>>) =
            eigenpairs.into_iter().unzip();
        let eigenvalues = ColBatch::new(output_shape.clone(), eigenvalues)?;
        let eigenvectors = MatBatch::new(output_shape, eigenvectors)?;

        log::debug!(
            "Diagonalized {} element(s); output shape {:?}, largest basis {} column(s).",
            eigenvectors.len(),
            eigenvectors.shape().dims(),
            eigenvectors.iter().map(|q| q.ncols()).max().unwrap_or(0),
        );

        let output = DiagonalizationOutput {
            eigenvalues: eigenvalues.clone(),
            eigenvectors: eigenvectors.clone(),
        };
        let state = SavedState {
            representation: self.representation,
            parameters: parameters.clone(),
            operator: (!self.config.memory_efficient).then_some(operator),
            eigenvalues,
            eigenvectors,
            num_probes,
            batch_shape,
            parallel: self.config.parallel,
        };
        Ok((output, state))
    }

    /// Runs the backward pass for a state returned by [`Self::evaluate`].
    ///
    /// `d_eigenvalues` and `d_eigenvectors` are the upstream gradients, shaped like the
    /// forward outputs; `None` stands for zero.
    pub fn gradient(
        &self,
        state: SavedState<'r, R>,
        d_eigenvalues: Option<&ColBatch>,
        d_eigenvectors: Option<&MatBatch>,
    ) -> Result<ParameterGradients, DiagonalizationError> {
        diagonalize_backward(d_eigenvalues, d_eigenvectors, state)
    }
}

/// Gradient of a loss with respect to the dense symmetric matrix `A`, given eigenpairs
/// `(Q, Λ)` of `A` and the upstream gradients `dL/dΛ`, `dL/dQ`.
pub fn eigen_gradient(
    q: MatRef<'_, f64>,
    eigenvalues: &Col<f64>,
    d_eigenvalues: Option<&Col<f64>>,
    d_eigenvectors: Option<MatRef<'_, f64>>,
) -> Mat<f64> {
    let n = q.nrows();
    let m = q.ncols();
    let mut d_matrix = Mat::<f64>::zeros(n, n);

    if let Some(d_q) = d_eigenvectors {
        // (K^T)[i, j] = K[j, i] = 1 / (Λ[j] - Λ[i] + ε), zero on the diagonal.
        let projected = q.transpose() * d_q;
        let inner = Mat::from_fn(m, m, |i, j| {
            if i == j {
                0.0
            } else {
                projected[(i, j)] / (eigenvalues[j] - eigenvalues[i] + EIGENGAP_FLOOR)
            }
        });
        d_matrix = &d_matrix + &(q * &inner * q.transpose());
    }

    if let Some(d_lambda) = d_eigenvalues {
        let scaled = Mat::from_fn(n, m, |i, j| q[(i, j)] * d_lambda[j]);
        d_matrix = &d_matrix + &(&scaled * q.transpose());
    }

    d_matrix
}

/// Runs the forward pass with a one-off [`Diagonalization`].
pub fn diagonalize<'r, R, G>(
    representation: &'r R,
    parameters: &OperatorParameters,
    shape: &MatrixShape,
    max_iter: usize,
    probes: ProbeVectors,
    config: DiagonalizationConfig,
    rng: &mut G,
) -> Result<(DiagonalizationOutput, SavedState<'r, R>), DiagonalizationError>
where
    R: OperatorRepresentation,
    G: Rng,
{
    Diagonalization::new(representation, config).evaluate(parameters, shape, max_iter, probes, rng)
}

/// Maps upstream gradients of the forward outputs to gradients of the operator's parameters.
///
/// Contributions of different probe vectors for the same batch element are summed, since
/// they all depend on the same parameters. The resulting `dL/dA` (one `n x n` matrix per
/// batch element) is handed to the representation, which decides which parameters receive
/// it.
pub fn diagonalize_backward<R: OperatorRepresentation>(
    d_eigenvalues: Option<&ColBatch>,
    d_eigenvectors: Option<&MatBatch>,
    saved_state: SavedState<'_, R>,
) -> Result<ParameterGradients, DiagonalizationError> {
    let SavedState {
        representation,
        parameters,
        eigenvalues,
        eigenvectors,
        num_probes,
        batch_shape,
        parallel,
        ..
    } = saved_state;

    if let Some(d_lambda) = d_eigenvalues {
        if d_lambda.shape() != eigenvalues.shape()
            || d_lambda
                .iter()
                .zip(eigenvalues.iter())
                .any(|(d, l)| d.nrows() != l.nrows())
        {
            return Err(DiagonalizationError::invalid_shape(
                "eigenvalue gradient",
                eigenvalues.iter().map(|l| l.nrows()).collect::<Vec<_>>(),
                d_lambda.iter().map(|d| d.nrows()).collect::<Vec<_>>(),
            ));
        }
    }
    if let Some(d_q) = d_eigenvectors {
        if d_q.shape() != eigenvectors.shape()
            || d_q
                .iter()
                .zip(eigenvectors.iter())
                .any(|(d, q)| (d.nrows(), d.ncols()) != (q.nrows(), q.ncols()))
        {
            return Err(DiagonalizationError::invalid_shape(
                "eigenvector gradient",
                eigenvectors
                    .iter()
                    .map(|q| (q.nrows(), q.ncols()))
                    .collect::<Vec<_>>(),
                d_q.iter()
                    .map(|d| (d.nrows(), d.ncols()))
                    .collect::<Vec<_>>(),
            ));
        }
    }

    let per_element = map_elements(eigenvectors.len(), parallel, |element| {
        Ok(eigen_gradient(
            eigenvectors.items()[element].as_ref(),
            &eigenvalues.items()[element],
            d_eigenvalues.map(|d| &d.items()[element]),
            d_eigenvectors.map(|d| d.items()[element].as_ref()),
        ))
    })?;

    let n = eigenvectors.items()[0].nrows();
    let batch_len = batch_shape.numel();
    let d_matrix = MatBatch::from_fn(batch_shape, |b| {
        (0..num_probes).fold(Mat::<f64>::zeros(n, n), |acc, p| {
            &acc + &per_element[p * batch_len + b]
        })
    });

    representation.parameter_gradients(&parameters, d_matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::DenseRepresentation;
    use faer::mat;
    use rand::{SeedableRng, rngs::StdRng};

    fn dense_params(a: Mat<f64>) -> OperatorParameters {
        OperatorParameters::new(vec![MatBatch::single(a)])
    }

    #[test]
    fn test_eigen_gradient_of_eigenvalues_only() {
        // dΛ only: dL/dA = Q diag(dΛ) Q^T. With Q = I this is diag(dΛ).
        let q = Mat::<f64>::identity(3, 3);
        let lambda = Col::from_fn(3, |i| (i + 1) as f64);
        let d_lambda = Col::from_fn(3, |i| 10.0 * (i + 1) as f64);
        let g = eigen_gradient(q.as_ref(), &lambda, Some(&d_lambda), None);
        assert_eq!(g, mat![[10.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 30.0]]);
    }

    #[test]
    fn test_eigen_gradient_uses_reciprocal_gaps() {
        let q = Mat::<f64>::identity(2, 2);
        let lambda = Col::from_fn(2, |i| if i == 0 { 1.0 } else { 3.0 });
        let d_q: Mat<f64> = mat![[0.0, 1.0], [0.0, 0.0]];
        let g = eigen_gradient(q.as_ref(), &lambda, None, Some(d_q.as_ref()));
        // inner[0, 1] = 1 / (Λ[1] - Λ[0]) = 1 / 2.
        assert!((g[(0, 1)] - 0.5).abs() < 1e-9);
        assert_eq!(g[(1, 0)], 0.0);
        assert_eq!(g[(0, 0)], 0.0);
    }

    #[test]
    fn test_eigen_gradient_finite_for_equal_eigenvalues() {
        let q = Mat::<f64>::identity(2, 2);
        let lambda = Col::from_fn(2, |_| 2.0);
        let d_q: Mat<f64> = mat![[0.3, 1.0], [-1.0, 0.2]];
        let g = eigen_gradient(q.as_ref(), &lambda, None, Some(d_q.as_ref()));
        for i in 0..2 {
            for j in 0..2 {
                assert!(g[(i, j)].is_finite());
                assert!(g[(i, j)].abs() <= 1.0 / EIGENGAP_FLOOR + 1.0);
            }
        }
    }

    #[test]
    fn test_memory_efficient_drops_operator() {
        let a: Mat<f64> = mat![[2.0, 1.0], [1.0, 2.0]];
        let params = dense_params(a);
        let shape = MatrixShape::new(2);
        let mut rng = StdRng::seed_from_u64(42);

        let (_, state) = diagonalize(
            &DenseRepresentation,
            &params,
            &shape,
            2,
            ProbeVectors::default(),
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .unwrap();
        assert!(state.operator().is_some());

        let (_, state) = diagonalize(
            &DenseRepresentation,
            &params,
            &shape,
            2,
            ProbeVectors::default(),
            DiagonalizationConfig::default().with_memory_efficient(true),
            &mut rng,
        )
        .unwrap();
        assert!(state.operator().is_none());
        let rebuilt = state.rebuild_operator().unwrap();
        assert_eq!(rebuilt.size(), 2);
    }

    #[test]
    fn test_output_shape_contract() {
        let mut rng = StdRng::seed_from_u64(1);
        let batch = BatchShape::new([3]);
        let matrices = MatBatch::from_fn(batch.clone(), |b| {
            Mat::from_fn(4, 4, |i, j| if i == j { (b + i + 1) as f64 } else { 0.1 })
        });
        let params = OperatorParameters::new(vec![matrices]);
        let repr = DenseRepresentation;
        let diag = Diagonalization::new(&repr, DiagonalizationConfig::default());

        let (out, _) = diag
            .evaluate(
                &params,
                &MatrixShape::batched(4, batch.clone()),
                4,
                ProbeVectors::Random { count: 1 },
                &mut rng,
            )
            .unwrap();
        assert_eq!(out.shape().dims(), &[3]);

        let (out, _) = diag
            .evaluate(
                &params,
                &MatrixShape::batched(4, batch),
                4,
                ProbeVectors::Random { count: 2 },
                &mut rng,
            )
            .unwrap();
        assert_eq!(out.shape().dims(), &[2, 3]);
        assert_eq!(out.eigenvalues.shape().dims(), &[2, 3]);

        let single = dense_params(mat![[1.0, 0.0], [0.0, 2.0]]);
        let (out, _) = diagonalize(
            &repr,
            &single,
            &MatrixShape::new(2),
            2,
            ProbeVectors::Random { count: 1 },
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .unwrap();
        assert!(out.shape().dims().is_empty());
        assert_eq!(out.eigenvectors.len(), 1);
    }

    #[test]
    fn test_declared_shape_mismatch_fails_fast() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = dense_params(Mat::identity(3, 3));

        let err = diagonalize(
            &DenseRepresentation,
            &params,
            &MatrixShape::new(4),
            3,
            ProbeVectors::default(),
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .err()
        .unwrap();
        assert!(err.is_invalid_shape());

        let err = diagonalize(
            &DenseRepresentation,
            &params,
            &MatrixShape::batched(3, vec![2]),
            3,
            ProbeVectors::default(),
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .err()
        .unwrap();
        assert!(err.is_invalid_shape());

        let err = diagonalize(
            &DenseRepresentation,
            &params,
            &MatrixShape::new(3),
            3,
            ProbeVectors::Random { count: 0 },
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .err()
        .unwrap();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_backward_rejects_mismatched_upstream() {
        let mut rng = StdRng::seed_from_u64(5);
        let params = dense_params(mat![[3.0, 1.0], [1.0, 2.0]]);
        let (_, state) = diagonalize(
            &DenseRepresentation,
            &params,
            &MatrixShape::new(2),
            2,
            ProbeVectors::default(),
            DiagonalizationConfig::default(),
            &mut rng,
        )
        .unwrap();
        let wrong = MatBatch::single(Mat::zeros(3, 2));
        let err = diagonalize_backward(None, Some(&wrong), state).unwrap_err();
        assert!(err.is_invalid_shape());
    }
}

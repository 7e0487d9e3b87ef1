//! This module defines the core abstraction for implicit linear operators.
//!
//! The Lanczos process never needs the individual entries of a matrix; its only primitive
//! is the matrix-vector product. The diagonalization is therefore written against two
//! small traits:
//!
//! 1.  [`MatrixOperator`]: a built operator that can multiply one batch element by a block
//!     of vectors. This is the "matmul closure".
//! 2.  [`OperatorRepresentation`]: the scheme that builds such an operator out of a list of
//!     parameter tensors, and that maps a gradient with respect to the (dense) matrix back
//!     onto those parameters.
//!
//! Splitting the two lets the saved state of a forward pass keep either the built operator
//! or only the parameters, and rebuild the operator later from the same representation.
//!
//! Three representations are provided: a batch of dense matrices
//! ([`DenseRepresentation`]), a low-rank-plus-diagonal factorization
//! ([`LowRankPlusDiagRepresentation`]), and an arbitrary closure ([`FnRepresentation`]).

use crate::{
    batch::{BatchShape, MatBatch},
    error::DiagonalizationError,
};
use faer::{Mat, MatRef};
use std::sync::Arc;

/// A symmetric linear operator over a batch of `n x n` matrices, accessed only through
/// products with blocks of vectors.
///
/// Implementations must be `Sync`: independent batch elements may be processed on several
/// threads at once.
pub trait MatrixOperator: Sync {
    /// Returns the dimension `n` of each (square) matrix.
    fn size(&self) -> usize;

    /// Returns the leading batch shape. Empty for a single matrix.
    fn batch_shape(&self) -> &BatchShape;

    /// Computes `A_b * rhs` for the flat batch index `b`.
    ///
    /// `rhs` has `size()` rows; the result must have the same dimensions as `rhs`.
    fn apply(&self, batch: usize, rhs: MatRef<'_, f64>) -> Mat<f64>;
}

/// An ordered list of parameter tensors describing an operator.
///
/// Tensors are reference counted, so the saved state of a forward pass can hold on to them
/// without copying.
#[derive(Clone, Debug, Default)]
pub struct OperatorParameters {
    tensors: Vec<Arc<MatBatch>>,
}

impl OperatorParameters {
    pub fn new(tensors: Vec<MatBatch>) -> Self {
        Self {
            tensors: tensors.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_shared(tensors: Vec<Arc<MatBatch>>) -> Self {
        Self { tensors }
    }

    pub fn get(&self, index: usize) -> Option<&MatBatch> {
        self.tensors.get(index).map(|t| t.as_ref())
    }

    pub fn shared(&self, index: usize) -> Option<Arc<MatBatch>> {
        self.tensors.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatBatch> {
        self.tensors.iter().map(|t| t.as_ref())
    }
}

/// Gradients with respect to each parameter tensor, in parameter order.
///
/// `None` means the parameter receives no gradient.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterGradients {
    grads: Vec<Option<MatBatch>>,
}

impl ParameterGradients {
    pub fn new(grads: Vec<Option<MatBatch>>) -> Self {
        Self { grads }
    }

    pub fn get(&self, index: usize) -> Option<&MatBatch> {
        self.grads.get(index).and_then(|g| g.as_ref())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn into_vec(self) -> Vec<Option<MatBatch>> {
        self.grads
    }
}

/// Builds [`MatrixOperator`]s from parameter tensors.
pub trait OperatorRepresentation {
    type Operator: MatrixOperator;

    /// Builds the operator described by `parameters`.
    fn build(&self, parameters: &OperatorParameters)
    -> Result<Self::Operator, DiagonalizationError>;

    /// Maps `d_matrix`, the gradient with respect to each dense matrix `A_b` (one `n x n`
    /// entry per batch element), onto the parameter tensors.
    ///
    /// The default treats the first parameter as the dense matrix itself: it receives
    /// `d_matrix` unchanged and every other parameter receives nothing.
    fn parameter_gradients(
        &self,
        parameters: &OperatorParameters,
        d_matrix: MatBatch,
    ) -> Result<ParameterGradients, DiagonalizationError> {
        let mut grads: Vec<Option<MatBatch>> = vec![None; parameters.len().max(1)];
        grads[0] = Some(d_matrix);
        Ok(ParameterGradients::new(grads))
    }
}

fn check_square(batch: &MatBatch, what: &str) -> Result<usize, DiagonalizationError> {
    let (rows, cols) = batch.uniform_dims().ok_or_else(|| {
        DiagonalizationError::representation(format!("{what} must hold equally sized matrices"))
    })?;
    if rows != cols {
        return Err(DiagonalizationError::invalid_shape(
            what,
            (rows, rows),
            (rows, cols),
        ));
    }
    Ok(rows)
}

/// A batch of explicit dense symmetric matrices, stored in parameter 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseRepresentation;

/// The operator built by [`DenseRepresentation`].
#[derive(Clone, Debug)]
pub struct DenseOperator {
    matrices: Arc<MatBatch>,
    size: usize,
}

impl DenseOperator {
    pub fn matrices(&self) -> &MatBatch {
        &self.matrices
    }
}

impl OperatorRepresentation for DenseRepresentation {
    type Operator = DenseOperator;

    fn build(&self, parameters: &OperatorParameters) -> Result<DenseOperator, DiagonalizationError> {
        let matrices = parameters.shared(0).ok_or_else(|| {
            DiagonalizationError::representation("the dense representation needs one parameter")
        })?;
        let size = check_square(&matrices, "dense matrix parameter")?;
        Ok(DenseOperator { matrices, size })
    }
}

impl MatrixOperator for DenseOperator {
    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn batch_shape(&self) -> &BatchShape {
        self.matrices.shape()
    }

    #[inline]
    fn apply(&self, batch: usize, rhs: MatRef<'_, f64>) -> Mat<f64> {
        // Ensure dimensional compatibility for the matrix product.
        assert_eq!(
            self.size,
            rhs.nrows(),
            "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
            self.size,
            rhs.nrows(),
        );
        self.matrices.items()[batch].as_ref() * rhs
    }
}

/// `A = R R^T + diag(d)` with `R` (`n x r`) in parameter 0 and `d` (`n x 1`) in parameter 1.
///
/// The product costs `O(nr)` per vector and the dense matrix is never formed.
#[derive(Clone, Copy, Debug, Default)]
pub struct LowRankPlusDiagRepresentation;

/// The operator built by [`LowRankPlusDiagRepresentation`].
#[derive(Clone, Debug)]
pub struct LowRankPlusDiagOperator {
    factors: Arc<MatBatch>,
    diagonals: Arc<MatBatch>,
    size: usize,
}

impl OperatorRepresentation for LowRankPlusDiagRepresentation {
    type Operator = LowRankPlusDiagOperator;

    fn build(
        &self,
        parameters: &OperatorParameters,
    ) -> Result<LowRankPlusDiagOperator, DiagonalizationError> {
        let (Some(factors), Some(diagonals)) = (parameters.shared(0), parameters.shared(1)) else {
            return Err(DiagonalizationError::representation(format!(
                "the low-rank-plus-diagonal representation needs 2 parameters, got {}",
                parameters.len()
            )));
        };
        if factors.shape() != diagonals.shape() {
            return Err(DiagonalizationError::invalid_shape(
                "diagonal parameter batch shape",
                factors.shape().dims(),
                diagonals.shape().dims(),
            ));
        }
        let (size, _rank) = factors.uniform_dims().ok_or_else(|| {
            DiagonalizationError::representation("low-rank factors must be equally sized")
        })?;
        if diagonals.uniform_dims() != Some((size, 1)) {
            return Err(DiagonalizationError::invalid_shape(
                "diagonal parameter",
                (size, 1),
                diagonals.uniform_dims(),
            ));
        }
        Ok(LowRankPlusDiagOperator {
            factors,
            diagonals,
            size,
        })
    }

    /// With `G = dL/dA`: `dL/dR = (G + G^T) R` and `dL/dd = diag(G)`.
    fn parameter_gradients(
        &self,
        parameters: &OperatorParameters,
        d_matrix: MatBatch,
    ) -> Result<ParameterGradients, DiagonalizationError> {
        let operator = self.build(parameters)?;
        let n = operator.size;
        let d_factors = d_matrix.map(|g| Mat::from_fn(n, n, |i, j| g[(i, j)] + g[(j, i)]));
        let d_factors = MatBatch::new(
            operator.factors.shape().clone(),
            d_factors
                .iter()
                .zip(operator.factors.iter())
                .map(|(sym, r)| sym * r)
                .collect(),
        )?;
        let d_diagonals = d_matrix.map(|g| Mat::from_fn(n, 1, |i, _| g[(i, i)]));
        Ok(ParameterGradients::new(vec![
            Some(d_factors),
            Some(d_diagonals),
        ]))
    }
}

impl MatrixOperator for LowRankPlusDiagOperator {
    fn size(&self) -> usize {
        self.size
    }

    fn batch_shape(&self) -> &BatchShape {
        self.factors.shape()
    }

    fn apply(&self, batch: usize, rhs: MatRef<'_, f64>) -> Mat<f64> {
        assert_eq!(
            self.size,
            rhs.nrows(),
            "Dimension mismatch: operator columns ({}) do not match vector rows ({}).",
            self.size,
            rhs.nrows(),
        );
        let r = self.factors.items()[batch].as_ref();
        let d = &self.diagonals.items()[batch];
        let projected = r.transpose() * rhs;
        let mut out = r * &projected;
        for j in 0..rhs.ncols() {
            for i in 0..rhs.nrows() {
                out[(i, j)] += d[(i, 0)] * rhs[(i, j)];
            }
        }
        out
    }
}

/// An operator given by a closure `apply(parameters, batch, rhs)`.
///
/// This is the most general representation: the closure receives the parameter tensors and
/// may compute the product in any way it likes. Gradients follow the default mapping of
/// [`OperatorRepresentation::parameter_gradients`].
pub struct FnRepresentation<F> {
    size: usize,
    batch_shape: BatchShape,
    apply: Arc<F>,
}

impl<F> FnRepresentation<F>
where
    F: Fn(&OperatorParameters, usize, MatRef<'_, f64>) -> Mat<f64> + Send + Sync,
{
    pub fn new(size: usize, batch_shape: BatchShape, apply: F) -> Self {
        Self {
            size,
            batch_shape,
            apply: Arc::new(apply),
        }
    }
}

/// The operator built by [`FnRepresentation`]: the closure bound to its parameters.
pub struct FnOperator<F> {
    parameters: OperatorParameters,
    size: usize,
    batch_shape: BatchShape,
    apply: Arc<F>,
}

impl<F> OperatorRepresentation for FnRepresentation<F>
where
    F: Fn(&OperatorParameters, usize, MatRef<'_, f64>) -> Mat<f64> + Send + Sync,
{
    type Operator = FnOperator<F>;

    fn build(&self, parameters: &OperatorParameters) -> Result<FnOperator<F>, DiagonalizationError> {
        Ok(FnOperator {
            parameters: parameters.clone(),
            size: self.size,
            batch_shape: self.batch_shape.clone(),
            apply: Arc::clone(&self.apply),
        })
    }
}

impl<F> MatrixOperator for FnOperator<F>
where
    F: Fn(&OperatorParameters, usize, MatRef<'_, f64>) -> Mat<f64> + Send + Sync,
{
    fn size(&self) -> usize {
        self.size
    }

    fn batch_shape(&self) -> &BatchShape {
        &self.batch_shape
    }

    fn apply(&self, batch: usize, rhs: MatRef<'_, f64>) -> Mat<f64> {
        (self.apply)(&self.parameters, batch, rhs)
    }
}

// Unit tests to verify the operator representations against explicit products.
#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn dense_params(matrix: Mat<f64>) -> OperatorParameters {
        OperatorParameters::new(vec![MatBatch::single(matrix)])
    }

    #[test]
    fn test_dense_operator_matches_matmul() {
        let matrix: Mat<f64> = mat![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0],];
        let vector: Mat<f64> = mat![[1.0], [2.0], [3.0]];
        let expected = &matrix * &vector;

        let operator = DenseRepresentation
            .build(&dense_params(matrix))
            .unwrap();
        assert_eq!(operator.size(), 3);
        assert_eq!(operator.batch_shape(), &BatchShape::scalar());
        assert_eq!(operator.apply(0, vector.as_ref()), expected);
    }

    #[test]
    fn test_dense_representation_rejects_rectangular() {
        let params = dense_params(Mat::zeros(2, 3));
        let err = DenseRepresentation.build(&params).unwrap_err();
        assert!(err.is_invalid_shape());
    }

    #[test]
    #[should_panic(
        expected = "Dimension mismatch: operator columns (2) do not match vector rows (3)."
    )]
    fn test_dimension_mismatch_panic() {
        let operator = DenseRepresentation
            .build(&dense_params(mat![[1.0, 0.0], [0.0, 1.0]]))
            .unwrap();
        let vector: Mat<f64> = mat![[1.0], [2.0], [3.0]];
        operator.apply(0, vector.as_ref());
    }

    #[test]
    fn test_low_rank_plus_diag_matches_dense() {
        let r: Mat<f64> = mat![[1.0, 0.5], [2.0, -1.0], [0.0, 3.0]];
        let d: Mat<f64> = mat![[1.0], [2.0], [3.0]];
        let dense = Mat::from_fn(3, 3, |i, j| {
            let low_rank = r[(i, 0)] * r[(j, 0)] + r[(i, 1)] * r[(j, 1)];
            if i == j { low_rank + d[(i, 0)] } else { low_rank }
        });
        let params = OperatorParameters::new(vec![MatBatch::single(r), MatBatch::single(d)]);
        let operator = LowRankPlusDiagRepresentation.build(&params).unwrap();

        let rhs: Mat<f64> = mat![[1.0, 0.0], [-2.0, 1.0], [0.5, 1.0]];
        let diff = (&operator.apply(0, rhs.as_ref()) - &(&dense * &rhs)).norm_l2();
        assert!(diff < 1e-12);
    }

    #[test]
    fn test_low_rank_plus_diag_gradient_chain_rule() {
        // For L = <G, A> with A = r r^T + diag(d), dL/dr = (G + G^T) r and dL/dd = diag(G).
        let r: Mat<f64> = mat![[1.0], [2.0]];
        let d: Mat<f64> = mat![[0.5], [0.25]];
        let g: Mat<f64> = mat![[1.0, 2.0], [0.0, 3.0]];
        let params = OperatorParameters::new(vec![MatBatch::single(r), MatBatch::single(d)]);
        let grads = LowRankPlusDiagRepresentation
            .parameter_gradients(&params, MatBatch::single(g))
            .unwrap();

        let d_r = &grads.get(0).unwrap().items()[0];
        assert_eq!(d_r[(0, 0)], 2.0 * 1.0 + 2.0 * 2.0);
        assert_eq!(d_r[(1, 0)], 2.0 * 1.0 + 6.0 * 2.0);
        let d_d = &grads.get(1).unwrap().items()[0];
        assert_eq!(d_d[(0, 0)], 1.0);
        assert_eq!(d_d[(1, 0)], 3.0);
    }

    #[test]
    fn test_fn_representation_sees_parameters() {
        let repr = FnRepresentation::new(2, BatchShape::scalar(), |params, batch, rhs| {
            let scale = params.get(0).unwrap().items()[batch][(0, 0)];
            Mat::from_fn(rhs.nrows(), rhs.ncols(), |i, j| scale * rhs[(i, j)])
        });
        let params = dense_params(mat![[4.0]]);
        let operator = repr.build(&params).unwrap();
        let out = operator.apply(0, mat![[1.0], [2.0]].as_ref());
        assert_eq!(out, mat![[4.0], [8.0]]);

        // Default mapping routes the matrix gradient to the first parameter only.
        let grads = repr
            .parameter_gradients(&params, MatBatch::single(Mat::identity(2, 2)))
            .unwrap();
        assert_eq!(grads.len(), 1);
        assert!(grads.get(0).is_some());
    }
}

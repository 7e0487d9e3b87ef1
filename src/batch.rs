//! Stacks of small dense matrices addressed by a leading batch shape.
//!
//! The implicit operator, its parameters, the Lanczos outputs and the gradients are all
//! "batched": every quantity exists once per batch element (and, for the outputs, once per
//! probe vector). Rather than a general n-dimensional tensor, we keep each element as an
//! ordinary [`faer::Mat`] (or [`faer::Col`]) and record the leading shape alongside.
//! Elements are stored in row-major order over the leading shape, so the last leading axis
//! varies fastest.

use crate::error::DiagonalizationError;
use faer::{Col, Mat};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// The leading (batch) dimensions of a batched quantity.
///
/// An empty shape denotes a single, unbatched element.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchShape(Vec<usize>);

impl BatchShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// The shape of a single unbatched element.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of elements described by this shape. The empty shape holds one element.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Returns a new shape with `dim` prepended as the outermost axis.
    pub fn prepend(&self, dim: usize) -> Self {
        let mut dims = Vec::with_capacity(self.0.len() + 1);
        dims.push(dim);
        dims.extend_from_slice(&self.0);
        Self(dims)
    }

    /// Converts a multi-index into the flat (row-major) element index.
    pub fn flat_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.0.len() {
            return None;
        }
        let mut flat = 0;
        for (&i, &dim) in index.iter().zip(&self.0) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        Some(flat)
    }
}

impl From<Vec<usize>> for BatchShape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for BatchShape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

/// A batch of items sharing one leading shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    shape: BatchShape,
    items: Vec<T>,
}

/// A batch of dense matrices.
pub type MatBatch = Batch<Mat<f64>>;

/// A batch of column vectors (used for eigenvalues).
pub type ColBatch = Batch<Col<f64>>;

impl<T> Batch<T> {
    /// Creates a batch, checking that the number of items matches the shape.
    pub fn new(shape: BatchShape, items: Vec<T>) -> Result<Self, DiagonalizationError> {
        if shape.numel() != items.len() {
            return Err(DiagonalizationError::invalid_shape(
                "batch item count",
                shape.numel(),
                items.len(),
            ));
        }
        Ok(Self { shape, items })
    }

    /// Wraps a single unbatched item.
    pub fn single(item: T) -> Self {
        Self {
            shape: BatchShape::scalar(),
            items: vec![item],
        }
    }

    /// Builds a batch by calling `f` with every flat element index in order.
    pub fn from_fn(shape: BatchShape, f: impl FnMut(usize) -> T) -> Self {
        let items = (0..shape.numel()).map(f).collect();
        Self { shape, items }
    }

    pub fn shape(&self) -> &BatchShape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Element at a flat index.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Element at a multi-index over the leading shape.
    pub fn at(&self, index: &[usize]) -> Option<&T> {
        self.shape.flat_index(index).and_then(|i| self.items.get(i))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Applies `f` to every item, keeping the shape.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Batch<U> {
        Batch {
            shape: self.shape.clone(),
            items: self.items.iter().map(f).collect(),
        }
    }
}

impl MatBatch {
    /// The (rows, cols) of every element, or `None` when elements differ in size.
    pub fn uniform_dims(&self) -> Option<(usize, usize)> {
        let first = self.items.first()?;
        let dims = (first.nrows(), first.ncols());
        self.items
            .iter()
            .all(|m| (m.nrows(), m.ncols()) == dims)
            .then_some(dims)
    }
}

/// Runs `f` for every element index in `0..len`, either sequentially or on the `rayon`
/// thread pool, and collects the results in index order. The first error is returned.
pub(crate) fn map_elements<T, F>(
    len: usize,
    parallel: bool,
    f: F,
) -> Result<Vec<T>, DiagonalizationError>
where
    T: Send,
    F: Fn(usize) -> Result<T, DiagonalizationError> + Sync + Send,
{
    if parallel {
        (0..len).into_par_iter().map(f).collect()
    } else {
        (0..len).map(f).collect()
    }
}

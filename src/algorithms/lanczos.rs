//! Symmetric Lanczos tridiagonalization with full reorthogonalization.
//!
//! ** NOTE: We recommend using the high-level method [`crate::diagonalization::diagonalize`]
//! instead. This module is intended for use cases where direct access to the Lanczos basis
//! and the tridiagonal coefficients is required.
//!
//! [`lanczos_standard`] runs the recurrence for one batch element and one probe vector,
//! storing the whole basis `Q_0` (memory `O(nm)`), since the eigenvectors of the operator are
//! recovered as `Q_0 U`. [`lanczos_tridiag`] runs one independent recurrence per batch
//! element and per probe column.
//!
//! In exact arithmetic the three-term recurrence keeps the basis orthonormal. In floating
//! point it does not: once a Ritz value converges, the basis loses orthogonality and
//! spurious copies of converged eigenvalues appear. Every residual is therefore
//! re-orthogonalized against the full basis (two passes of classical Gram-Schmidt) unless
//! [`DiagonalizationConfig::reorthogonalize`] is switched off.

use super::{LanczosDecomposition, LanczosOutput};
use crate::{
    batch::{BatchShape, MatBatch, map_elements},
    config::DiagonalizationConfig,
    error::DiagonalizationError,
    operator::MatrixOperator,
};
use faer::{Mat, MatRef};
use rand::Rng;
use rand_distr::StandardNormal;

/// Number of classical Gram-Schmidt passes used for reorthogonalization ("twice is enough").
const REORTHOGONALIZATION_PASSES: usize = 2;

#[inline]
fn dot(a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> f64 {
    (0..a.nrows()).map(|i| a[(i, 0)] * b[(i, 0)]).sum()
}

/// `y -= a * x` for column vectors.
#[inline]
fn sub_scaled(y: &mut Mat<f64>, a: f64, x: MatRef<'_, f64>) {
    for i in 0..y.nrows() {
        y[(i, 0)] -= a * x[(i, 0)];
    }
}

/// Performs up to `max_iter` steps of the symmetric Lanczos process on batch element `batch`.
///
/// # Arguments
/// * `operator`: The implicit symmetric operator.
/// * `batch`: Flat index of the batch element to tridiagonalize.
/// * `probe`: The `n x 1` starting vector. It is normalized here and must not be zero.
/// * `max_iter`: The maximum number of iterations. Clamped to `n`.
/// * `config`: Breakdown tolerance and reorthogonalization switch.
///
/// # Returns
/// The basis `Q_0` (`n x m`) and the coefficients of `T_m`, where `m <= max_iter` is the
/// number of completed steps. The iteration stops early, without error, once the residual
/// norm drops to `breakdown_tolerance * ||A q_j||`: the Krylov subspace is then invariant.
pub fn lanczos_standard<O: MatrixOperator + ?Sized>(
    operator: &O,
    batch: usize,
    probe: MatRef<'_, f64>,
    max_iter: usize,
    config: &DiagonalizationConfig,
) -> Result<LanczosOutput, DiagonalizationError> {
    let n = operator.size();
    if probe.nrows() != n || probe.ncols() != 1 {
        return Err(DiagonalizationError::invalid_shape(
            "probe vector",
            (n, 1),
            (probe.nrows(), probe.ncols()),
        ));
    }
    if max_iter == 0 {
        return Err(DiagonalizationError::input("`max_iter` must be at least 1."));
    }
    let probe_norm = probe.norm_l2();
    if !(probe_norm.is_finite() && probe_norm > 0.0) {
        return Err(DiagonalizationError::input(
            "The probe vector must be a finite, non-zero vector.",
        ));
    }

    // No more than n orthonormal vectors exist; for n = 1 this is a single product.
    let k = max_iter.min(n);

    // Pre-allocate the basis matrix. Early termination is handled by slicing at the end.
    let mut v_k = Mat::<f64>::zeros(n, k);
    for i in 0..n {
        v_k[(i, 0)] = probe[(i, 0)] / probe_norm;
    }

    let mut alphas = Vec::with_capacity(k);
    let mut betas = Vec::with_capacity(k - 1);
    let mut steps_taken = 0;

    for j in 0..k {
        let v_j = v_k.as_ref().get(.., j..j + 1);
        let mut w = operator.apply(batch, v_j);
        if w.nrows() != n || w.ncols() != 1 {
            return Err(DiagonalizationError::invalid_shape(
                "operator output",
                (n, 1),
                (w.nrows(), w.ncols()),
            ));
        }
        let image_norm = w.norm_l2();

        // Three-term recurrence: w = A v_j - alpha_j v_j - beta_{j-1} v_{j-1}.
        let alpha = dot(v_j, w.as_ref());
        sub_scaled(&mut w, alpha, v_j);
        if j > 0 {
            sub_scaled(&mut w, betas[j - 1], v_k.as_ref().get(.., j - 1..j));
        }

        if config.reorthogonalize {
            let basis = v_k.as_ref().get(.., 0..j + 1);
            for _ in 0..REORTHOGONALIZATION_PASSES {
                let coefficients = basis.transpose() * &w;
                w = &w - &(basis * &coefficients);
            }
        }

        alphas.push(alpha);
        steps_taken += 1;

        if j + 1 == k {
            break;
        }

        let beta = w.norm_l2();
        if !beta.is_finite() {
            return Err(DiagonalizationError::input(format!(
                "The operator produced non-finite values at Lanczos step {j}."
            )));
        }
        log::trace!("Lanczos step {j}: alpha = {alpha:.6e}, beta = {beta:.6e}");

        // A zero (or numerically zero) beta indicates that breakdown has occurred.
        // The Krylov subspace is invariant, and the iteration must terminate.
        if beta <= config.breakdown_tolerance * image_norm {
            log::debug!(
                "Lanczos breakdown at step {j} (beta = {beta:.3e}); returning {steps_taken} of {k} columns."
            );
            break;
        }

        betas.push(beta);
        for i in 0..n {
            v_k[(i, j + 1)] = w[(i, 0)] / beta;
        }
    }

    let basis = if steps_taken == k {
        v_k
    } else {
        v_k.as_ref().get(.., 0..steps_taken).to_owned()
    };

    Ok(LanczosOutput {
        basis,
        decomposition: LanczosDecomposition {
            alphas,
            betas,
            steps_taken,
        },
    })
}

/// Runs an independent Lanczos process for every batch element and every probe column.
///
/// `probes` must have the operator's batch shape, and each element must be `n x p` with the
/// same `p >= 1`. The outputs are ordered probe-major: the output for probe `p` and flat
/// batch index `b` is at `p * batch_len + b`.
pub fn lanczos_tridiag<O: MatrixOperator + ?Sized>(
    operator: &O,
    probes: &MatBatch,
    max_iter: usize,
    config: &DiagonalizationConfig,
) -> Result<Vec<LanczosOutput>, DiagonalizationError> {
    let n = operator.size();
    if probes.shape() != operator.batch_shape() {
        return Err(DiagonalizationError::invalid_shape(
            "probe batch shape",
            operator.batch_shape().dims(),
            probes.shape().dims(),
        ));
    }
    let (rows, num_probes) = probes.uniform_dims().ok_or_else(|| {
        DiagonalizationError::invalid_shape("probe vectors", "equally sized blocks", "ragged blocks")
    })?;
    if rows != n || num_probes == 0 {
        return Err(DiagonalizationError::invalid_shape(
            "probe vectors",
            (n, "p >= 1"),
            (rows, num_probes),
        ));
    }

    let batch_len = probes.len();
    log::debug!(
        "Running Lanczos: n = {n}, max_iter = {max_iter}, {batch_len} batch element(s), {num_probes} probe(s)."
    );

    map_elements(num_probes * batch_len, config.parallel, |element| {
        let (p, b) = (element / batch_len, element % batch_len);
        let probe = probes.items()[b].as_ref().get(.., p..p + 1);
        lanczos_standard(operator, b, probe, max_iter, config)
    })
}

/// Draws `count` standard normal probe vectors of length `n` for every batch element.
pub fn random_probes<R: Rng>(
    n: usize,
    batch_shape: &BatchShape,
    count: usize,
    rng: &mut R,
) -> MatBatch {
    MatBatch::from_fn(batch_shape.clone(), |_| {
        Mat::from_fn(n, count, |_, _| rng.sample::<f64, _>(StandardNormal))
    })
}

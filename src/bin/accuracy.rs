//! Experiment Runner for Diagonalization Accuracy.
//!
//! This executable measures how the Lanczos diagonalization converges as the number of
//! iterations grows: the loss of orthogonality of the returned eigenvectors, the relative
//! reconstruction error of `Q diag(Λ) Q^T`, and the error of the extreme eigenvalues. The
//! analysis runs on dense symmetric matrices with a prescribed spectrum, so the exact
//! eigenvalues are known.

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use faer::{Mat, Side};
use lanczos_diagonalization::{
    DenseRepresentation, DiagonalizationConfig, MatBatch, MatrixShape, OperatorParameters,
    ProbeVectors, diagonalize,
};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use serde::Serialize;
use std::path::PathBuf;

/// Defines the spectral properties of the test matrix A.
#[derive(ValueEnum, Clone, Debug, Copy)]
enum ProblemScenario {
    /// Eigenvalues evenly spread over [1, 100].
    WellSeparated,
    /// Half of the spectrum packed into a narrow cluster near 1, the rest spread to 1000.
    Clustered,
    /// A positive semi-definite matrix of rank n / 4: most eigenvalues are exactly zero.
    LowRank,
}

/// Command-line arguments for the accuracy analysis runner.
#[derive(Parser, Debug)]
#[clap(
    name = "accuracy-runner",
    about = "Measures Lanczos diagonalization accuracy against the number of iterations."
)]
struct AccuracyArgs {
    /// The spectral scenario for the test problem.
    #[clap(long, value_enum)]
    scenario: ProblemScenario,
    /// Dimension of the test matrix.
    #[clap(long, default_value_t = 200)]
    n: usize,
    /// Minimum number of Lanczos iterations to test.
    #[clap(long, default_value_t = 10)]
    k_min: usize,
    /// Maximum number of Lanczos iterations to test.
    #[clap(long, default_value_t = 200)]
    k_max: usize,
    /// Step size for iterating k.
    #[clap(long, default_value_t = 10)]
    k_step: usize,
    /// Coefficient of the tridiagonal jitter.
    #[clap(long, default_value_t = 1e-6)]
    jitter: f64,
    /// Disable full reorthogonalization of the Lanczos basis.
    #[clap(long)]
    no_reorthogonalize: bool,
    /// Seed for the test matrix and the probe vector.
    #[clap(long, default_value_t = 42)]
    seed: u64,
    /// Path to the output CSV file where results will be written.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

/// A single row of the output CSV file.
#[derive(Debug, Serialize)]
struct AccuracyResult {
    /// The requested number of Lanczos iterations.
    max_iter: usize,
    /// The number of iterations actually completed.
    steps: usize,
    /// Orthogonality loss of the eigenvectors, ||I - Q^T Q||_F.
    ortho_loss: f64,
    /// Relative reconstruction error, ||A - Q diag(Λ) Q^T||_F / ||A||_F.
    reconstruction_error: f64,
    /// |λ_max(A) - max Λ|.
    max_eig_error: f64,
    /// |λ_min(A) - min Λ|.
    min_eig_error: f64,
}

fn spectrum(n: usize, scenario: ProblemScenario) -> Vec<f64> {
    let step = |lo: f64, hi: f64, count: usize, i: usize| {
        lo + (hi - lo) / (count.saturating_sub(1)).max(1) as f64 * i as f64
    };
    match scenario {
        ProblemScenario::WellSeparated => (0..n).map(|i| step(1.0, 100.0, n, i)).collect(),
        ProblemScenario::Clustered => {
            let mid = n / 2;
            (0..n)
                .map(|i| {
                    if i < mid {
                        step(1.0, 1.001, mid, i)
                    } else {
                        step(10.0, 1000.0, n - mid, i - mid)
                    }
                })
                .collect()
        }
        ProblemScenario::LowRank => {
            let rank = (n / 4).max(1);
            (0..n)
                .map(|i| if i < rank { step(1.0, 50.0, rank, i) } else { 0.0 })
                .collect()
        }
    }
}

/// Builds `A = V diag(eigs) V^T`, where `V` is the (random, orthogonal) eigenvector matrix
/// of a symmetrized Gaussian matrix.
fn create_problem(eigs: &[f64], rng: &mut StdRng) -> Result<Mat<f64>> {
    use rand::Rng;
    let n = eigs.len();
    let gaussian = Mat::from_fn(n, n, |_, _| rng.sample::<f64, _>(StandardNormal));
    let symmetric = Mat::from_fn(n, n, |i, j| gaussian[(i, j)] + gaussian[(j, i)]);
    let evd = symmetric
        .as_ref()
        .self_adjoint_eigen(Side::Lower)
        .map_err(|e| anyhow::anyhow!("EVD failed: {:?}", e))?;
    let v = evd.U();
    let scaled = Mat::from_fn(n, n, |i, j| v[(i, j)] * eigs[j]);
    let a = &scaled * v.transpose();
    // Symmetrize to remove rounding asymmetry.
    Ok(Mat::from_fn(n, n, |i, j| 0.5 * (a[(i, j)] + a[(j, i)])))
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .try_init()?;
    let args = AccuracyArgs::parse();
    ensure!(args.k_min >= 1, "--k-min must be at least 1");
    ensure!(args.k_step >= 1, "--k-step must be at least 1");
    log::info!(
        "Starting accuracy analysis for scenario {:?} with n = {}",
        args.scenario,
        args.n
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let eigs = spectrum(args.n, args.scenario);
    let true_max = eigs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let true_min = eigs.iter().copied().fold(f64::INFINITY, f64::min);
    let a = create_problem(&eigs, &mut rng)?;
    let a_norm = a.norm_l2();

    let parameters = OperatorParameters::new(vec![MatBatch::single(a.clone())]);
    let shape = MatrixShape::new(args.n);
    let config = DiagonalizationConfig::default()
        .with_tridiagonal_jitter(args.jitter)
        .with_reorthogonalize(!args.no_reorthogonalize);

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create output file {:?}", args.output))?;

    for k in (args.k_min..=args.k_max).step_by(args.k_step) {
        log::info!("Running for max_iter = {}...", k);
        // Same probe for every k: re-seed from the experiment seed.
        let mut probe_rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
        let (output, _state) = diagonalize(
            &DenseRepresentation,
            &parameters,
            &shape,
            k,
            ProbeVectors::default(),
            config.clone(),
            &mut probe_rng,
        )?;

        let q = &output.eigenvectors.items()[0];
        let lambda = &output.eigenvalues.items()[0];
        let steps = q.ncols();

        let identity = Mat::<f64>::identity(steps, steps);
        let ortho_loss = (&identity - q.transpose() * q).norm_l2();

        let reconstructed = output
            .reconstruct(0)
            .context("missing output element 0")?;
        let reconstruction_error = (&a - &reconstructed).norm_l2() / a_norm;

        let approx_max = (0..steps).map(|i| lambda[i]).fold(f64::NEG_INFINITY, f64::max);
        let approx_min = (0..steps).map(|i| lambda[i]).fold(f64::INFINITY, f64::min);

        writer.serialize(AccuracyResult {
            max_iter: k,
            steps,
            ortho_loss,
            reconstruction_error,
            max_eig_error: (true_max - approx_max).abs(),
            min_eig_error: (true_min - approx_min).abs(),
        })?;
    }

    writer.flush()?;
    log::info!(
        "Accuracy analysis complete. Results saved to {:?}.",
        &args.output
    );
    Ok(())
}

//! Admixture proportions by non-negative matrix factorisation.
//!
//! The individual allele frequencies `X` (`m x n`) are factorised as
//! `X ≈ Q Fᵗ`, with `Q` (`m x K`) holding row-stochastic admixture
//! proportions and `F` (`n x K`) ancestral allele frequencies. Updates are
//! multiplicative, first on mini-batches of sites visited in random order and
//! then on the full matrix. Each factor update repeats its multiplicative step
//! until the change drops to a tenth of the first step's change or a
//! dimension-dependent repetition count is reached.

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Axis, Zip};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::StructureError;
use crate::kernels::{frobenius, frobenius_serial, rmse};
use crate::likelihood::{log_likelihood, GenotypeLikelihoods};
use crate::linalg::invert;
use crate::parallel::RowPool;
use crate::progress::{log, LogLevel};

/// Factor entries are clipped to `[1e-4, 1 - 1e-4]` after every update.
pub const FACTOR_BOUND: f64 = 1e-4;

/// An inner repetition stops once its change is at most this fraction of
/// the first repetition's change.
const ACCELERATION_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct AdmixtureOptions {
    /// Number of ancestral components `K`.
    pub components: usize,
    /// Penalty added to the denominator of the `Q` update.
    pub alpha: f64,
    /// Cap on mini-batch iterations.
    pub max_iterations: usize,
    /// RMSD of `Q` between mini-batch iterations that ends that phase.
    pub tolerance: f64,
    /// Cap on full-data iterations.
    pub full_iterations: usize,
    /// RMSD of `Q` between full-data iterations that ends the run.
    pub full_tolerance: f64,
    pub seed: u64,
    /// Number of site mini-batches.
    pub batches: usize,
    pub threads: usize,
}

impl Default for AdmixtureOptions {
    fn default() -> Self {
        Self {
            components: 2,
            alpha: 0.0,
            max_iterations: 100,
            tolerance: 5e-5,
            full_iterations: 10,
            full_tolerance: 1e-5,
            seed: 0,
            batches: 5,
            threads: 1,
        }
    }
}

/// Result of [`estimate_admixture`].
#[derive(Debug, Clone)]
pub struct AdmixtureEstimate {
    /// `m x K` admixture proportions, rows sum to one.
    pub q: Array2<f64>,
    /// `n x K` ancestral allele frequencies in the input site order.
    pub f: Array2<f64>,
    pub stochastic_iterations: usize,
    pub stochastic_converged: bool,
    pub full_iterations: usize,
    /// Whether the full-data phase reached `full_tolerance`.
    pub converged: bool,
    /// `||X - Q Fᵗ||_F`.
    pub frobenius_error: f64,
    /// Log-likelihood of the genotype likelihoods under `Q Fᵗ`.
    pub log_likelihood: f64,
}

/// Estimates admixture proportions with a generator seeded from `options.seed`.
pub fn estimate_admixture(
    x: ArrayView2<'_, f32>,
    likelihoods: &GenotypeLikelihoods,
    options: &AdmixtureOptions,
) -> Result<AdmixtureEstimate, StructureError> {
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    estimate_admixture_with_rng(x, likelihoods, options, &mut rng)
}

/// Estimates admixture proportions drawing all randomness from `rng`.
///
/// `rng` is only used on the calling thread: once for the site permutation,
/// once for the initial `Q` and once per iteration for the batch order.
pub fn estimate_admixture_with_rng<R: Rng + ?Sized>(
    x: ArrayView2<'_, f32>,
    likelihoods: &GenotypeLikelihoods,
    options: &AdmixtureOptions,
    rng: &mut R,
) -> Result<AdmixtureEstimate, StructureError> {
    validate(x, likelihoods, options)?;
    let (m, n) = x.dim();
    let k = options.components;
    let mut blocks = batch_blocks(n, options.batches.min(n));
    let pool = RowPool::new(options.threads)?;

    log(
        LogLevel::Info,
        &format!(
            "Estimating admixture: {} individuals, {} sites, K={}, alpha={}, {} batches",
            m,
            n,
            k,
            options.alpha,
            blocks.len()
        ),
    );

    // Decorrelate neighbouring sites before batching.
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let shuffled = x.select(Axis(1), &order).mapv(f64::from);

    let mut q = Array2::from_shape_fn((m, k), |_| rng.gen::<f64>());
    normalize_rows(&mut q);
    let mut f = least_squares_frequencies(shuffled.view(), &q)?;

    let mut previous_q = q.clone();
    let mut stochastic_iterations = 0;
    let mut stochastic_converged = false;
    for iteration in 1..=options.max_iterations {
        blocks.shuffle(rng);
        for &(start, end) in &blocks {
            let x_block = shuffled.slice(s![.., start..end]);
            update_f(x_block, &q, f.slice_mut(s![start..end, ..]));
            update_q(x_block, f.slice(s![start..end, ..]), &mut q, options.alpha);
        }
        stochastic_iterations = iteration;
        let diff = rmse(q.view(), previous_q.view(), &pool);
        log(
            LogLevel::Info,
            &format!("ASG-MU ({}). Q-RMSD={:.6e}", iteration, diff),
        );
        if diff < options.tolerance {
            log(LogLevel::Info, "ASG-MU has converged. Running full iterations");
            stochastic_converged = true;
            break;
        }
        previous_q.assign(&q);
    }
    previous_q.assign(&q);

    // The penalty acted once per block above; keep its weight comparable.
    let full_alpha = options.alpha * blocks.len() as f64;
    let mut full_iterations = 0;
    let mut converged = false;
    for full in 1..=options.full_iterations {
        update_f(shuffled.view(), &q, f.view_mut());
        update_q(shuffled.view(), f.view(), &mut q, full_alpha);
        full_iterations = full;
        let diff = rmse(q.view(), previous_q.view(), &pool);
        log(
            LogLevel::Info,
            &format!(
                "Full-MU ({}). Q-RMSD={:.6e}",
                stochastic_iterations + full,
                diff
            ),
        );
        if diff < options.full_tolerance {
            log(LogLevel::Info, "Admixture estimation has converged");
            converged = true;
            break;
        }
        previous_q.assign(&q);
    }
    if !converged {
        log(
            LogLevel::Warning,
            &format!(
                "Admixture estimation did not reach Q-RMSD < {:e} within {} full iterations",
                options.full_tolerance, options.full_iterations
            ),
        );
    }

    // Back to the input site order.
    let mut inverse = vec![0usize; n];
    for (position, &site) in order.iter().enumerate() {
        inverse[site] = position;
    }
    let f = f.select(Axis(0), &inverse);

    let reconstruction = q.dot(&f.t());
    let frobenius_error = frobenius(x, reconstruction.view(), &pool);
    let log_likelihood = log_likelihood(likelihoods, reconstruction.view(), &pool);
    log(LogLevel::Info, &format!("Frobenius error: {:.6}", frobenius_error));
    log(LogLevel::Info, &format!("Log-likelihood: {:.6}", log_likelihood));

    Ok(AdmixtureEstimate {
        q,
        f,
        stochastic_iterations,
        stochastic_converged,
        full_iterations,
        converged,
        frobenius_error,
        log_likelihood,
    })
}

fn validate(
    x: ArrayView2<'_, f32>,
    likelihoods: &GenotypeLikelihoods,
    options: &AdmixtureOptions,
) -> Result<(), StructureError> {
    let (m, n) = x.dim();
    if m == 0 || n == 0 {
        return Err(StructureError::EmptyInput {
            what: "admixture input matrix",
            rows: m,
            cols: n,
        });
    }
    if likelihoods.individuals() != m || likelihoods.sites() != n {
        return Err(StructureError::ShapeMismatch {
            what: "genotype likelihoods",
            expected: (m, n),
            found: (likelihoods.individuals(), likelihoods.sites()),
        });
    }
    if options.components == 0 || options.components > m.min(n) {
        return Err(StructureError::InvalidRank {
            rank: options.components,
            bound: m.min(n) + 1,
        });
    }
    if !(options.alpha >= 0.0 && options.alpha.is_finite()) {
        return Err(StructureError::InvalidConfiguration(format!(
            "alpha must be a finite non-negative number, got {}",
            options.alpha
        )));
    }
    if options.batches == 0 {
        return Err(StructureError::InvalidConfiguration(
            "batch count must be at least 1".to_string(),
        ));
    }
    if x.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(StructureError::InvalidConfiguration(
            "admixture input must be finite and non-negative".to_string(),
        ));
    }
    Ok(())
}

/// Contiguous `[start, end)` site ranges of width `ceil(sites / batches)`.
/// The last range may be shorter, and there can be fewer than `batches`.
fn batch_blocks(sites: usize, batches: usize) -> Vec<(usize, usize)> {
    let width = sites.div_ceil(batches);
    (0..sites)
        .step_by(width)
        .map(|start| (start, (start + width).min(sites)))
        .collect()
}

/// Unconstrained least-squares `F = ((QᵗQ)⁻¹ Qᵗ X)ᵗ`, clipped into bounds.
fn least_squares_frequencies(x: ArrayView2<'_, f64>, q: &Array2<f64>) -> Result<Array2<f64>, StructureError> {
    let gram_inverse = invert(q.t().dot(q).view(), "QᵗQ of the initial admixture proportions")?;
    let fit = gram_inverse.dot(&q.t().dot(&x));
    Ok(fit.t().mapv(clip))
}

/// Multiplicative update of the frequency block `f` for sites `x_block`.
fn update_f(x_block: ArrayView2<'_, f64>, q: &Array2<f64>, mut f: ArrayViewMut2<'_, f64>) {
    let (m, sites) = x_block.dim();
    let k = q.ncols();
    let numerator = x_block.t().dot(q);
    let gram = q.t().dot(q);
    let repetitions = 2 * (1 + (m * sites + m * k) / (sites * k + sites));
    accelerate(&mut f, repetitions, |f| {
        let denominator = f.dot(&gram);
        multiplicative_step(f, &numerator, &denominator, 0.0);
    });
}

/// Multiplicative update of `q` against the frequency block `f`, keeping
/// rows on the simplex.
fn update_q(x_block: ArrayView2<'_, f64>, f: ArrayView2<'_, f64>, q: &mut Array2<f64>, alpha: f64) {
    let (m, sites) = x_block.dim();
    let k = q.ncols();
    let numerator = x_block.dot(&f);
    let gram = f.t().dot(&f);
    let repetitions = 2 * (1 + (m * sites + sites * k) / (m * k + m));
    accelerate(&mut q.view_mut(), repetitions, |q| {
        let denominator = q.dot(&gram);
        multiplicative_step(q, &numerator, &denominator, alpha);
        normalize_rows(q);
    });
}

/// Repeats `step` on `factor` until its Frobenius change falls to
/// [`ACCELERATION_RATIO`] of the first change. Returns the number of steps.
fn accelerate<F>(factor: &mut ArrayViewMut2<'_, f64>, repetitions: usize, mut step: F) -> usize
where
    F: FnMut(&mut ArrayViewMut2<'_, f64>),
{
    let mut first_change = 0.0;
    for inner in 0..repetitions {
        let before = factor.to_owned();
        step(factor);
        let change = frobenius_serial(factor.view(), before.view());
        if inner == 0 {
            first_change = change;
        } else if change <= ACCELERATION_RATIO * first_change {
            return inner + 1;
        }
    }
    repetitions
}

fn multiplicative_step<S>(
    factor: &mut ArrayViewMut2<'_, f64>,
    numerator: &Array2<f64>,
    denominator: &ndarray::ArrayBase<S, ndarray::Ix2>,
    alpha: f64,
) where
    S: ndarray::Data<Elem = f64>,
{
    Zip::from(factor)
        .and(numerator)
        .and(denominator)
        .for_each(|value, &a, &b| *value = clip(*value * a / (b + alpha)));
}

/// Clip into `[1e-4, 1 - 1e-4]`; NaN maps to the lower bound.
#[inline]
fn clip(value: f64) -> f64 {
    value.max(FACTOR_BOUND).min(1.0 - FACTOR_BOUND)
}

fn normalize_rows<S>(q: &mut ndarray::ArrayBase<S, ndarray::Ix2>)
where
    S: ndarray::DataMut<Elem = f64>,
{
    for mut row in q.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        row /= total;
    }
}

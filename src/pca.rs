// pca.rs

use ndarray::{s, Array1, Array2, ArrayView1, Axis};

use crate::error::StructureError;
use crate::kernels::rmse;
use crate::likelihood::{
    update_dosages, update_dosages_with_diagonal, FrequencyPrior, GenotypeLikelihoods, InbreedingModel,
};
use crate::linalg::{loadings, symmetric_eigen, truncated_reconstruction};
use crate::parallel::{rows_mut, RowPool};
use crate::progress::{log, LogLevel};

/// Individual allele frequencies are clipped to `[1e-4, 1 - 1e-4]`.
pub const INDIVIDUAL_FREQUENCY_BOUND: f32 = 1e-4;

/// Upper limit on the number of eigenpairs examined by the MAP test.
pub const MAP_MAX_COMPONENTS: usize = 20;

/// How many principal components model the individual allele frequencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSelection {
    /// Chosen by Velicer's MAP test on the initial covariance matrix.
    Automatic,
    /// A fixed count; must be at least 1 and below `min(m, n)`.
    Fixed(usize),
}

#[derive(Debug, Clone)]
pub struct CovarianceOptions {
    pub components: ComponentSelection,
    /// Refinement iterations after the first estimate. With 0, automatic
    /// selection returns the covariance built from the population
    /// frequencies alone, and a fixed count stops after the first estimate.
    pub max_iterations: usize,
    /// Stop once the RMSD between successive frequency matrices falls below this.
    pub tolerance: f64,
    /// Stop once the RMSD itself changes by at most this between iterations.
    pub plateau_tolerance: f64,
    pub threads: usize,
}

impl Default for CovarianceOptions {
    fn default() -> Self {
        Self {
            components: ComponentSelection::Automatic,
            max_iterations: 100,
            tolerance: 5e-5,
            plateau_tolerance: 5e-6,
            threads: 1,
        }
    }
}

/// Result of [`estimate_covariance`].
#[derive(Debug, Clone)]
pub struct CovarianceEstimate {
    /// `m x m` genetic covariance matrix.
    pub covariance: Array2<f64>,
    /// `m x n` individual allele frequencies, absent in covariance-only mode.
    pub individual_frequencies: Option<Array2<f32>>,
    /// Number of principal components used (0 when none were fitted).
    pub components: usize,
    /// `m x n` expected genotype dosages under the final model.
    pub dosages: Array2<f32>,
    /// Frequency estimates computed, the initial one included.
    pub iterations: usize,
    pub converged: bool,
    /// MAP statistic for 1, 2, ... components when selected automatically.
    pub map_scores: Option<Vec<f64>>,
}

/// Estimates the genetic covariance matrix and individual allele
/// frequencies from genotype likelihoods.
///
/// Individual frequencies are modelled as `(2f + low-rank correction) / 2`
/// where the correction is the truncated SVD of the centered expected
/// dosages. Dosages and frequencies are refined alternately until the RMSD
/// between successive frequency matrices drops below `tolerance`, or the
/// RMSD stops changing. Hitting `max_iterations` is not an error: the last
/// estimate is returned with `converged == false`.
///
/// # Arguments
/// * `likelihoods` - Genotype likelihoods of `m` individuals at `n` sites
/// * `population` - Population allele frequency per site, strictly inside (0, 1)
/// * `options` - Component selection, iteration cap, tolerances and threads
pub fn estimate_covariance(
    likelihoods: &GenotypeLikelihoods,
    population: ArrayView1<'_, f64>,
    options: &CovarianceOptions,
) -> Result<CovarianceEstimate, StructureError> {
    let m = likelihoods.individuals();
    let n = likelihoods.sites();
    validate_population(population, n)?;
    if let ComponentSelection::Fixed(e) = options.components {
        if e == 0 {
            return Err(StructureError::InvalidConfiguration(
                "a fixed component count must be at least 1; use automatic selection instead".to_string(),
            ));
        }
        if e >= m.min(n) {
            return Err(StructureError::InvalidRank {
                rank: e,
                bound: m.min(n),
            });
        }
    }
    let pool = RowPool::new(options.threads)?;

    log(
        LogLevel::Info,
        &format!(
            "Estimating covariance for {} individuals at {} sites using {} threads",
            m,
            n,
            pool.threads()
        ),
    );

    let mut dosages = Array2::<f32>::zeros((m, n));
    let mut diagonal = Array1::<f64>::zeros(m);
    let population_prior = FrequencyPrior::Population(population);

    let outbred = InbreedingModel::WithoutInbreeding;

    if options.max_iterations == 0 && options.components == ComponentSelection::Automatic {
        update_dosages_with_diagonal(
            likelihoods,
            population_prior,
            &outbred,
            population,
            &pool,
            &mut dosages,
            &mut diagonal,
        )?;
        let covariance = build_covariance(&dosages, &diagonal, population, &pool);
        log(
            LogLevel::Info,
            "Returning covariance from population allele frequencies only",
        );
        return Ok(CovarianceEstimate {
            covariance,
            individual_frequencies: None,
            components: 0,
            dosages,
            iterations: 0,
            converged: false,
            map_scores: None,
        });
    }

    let (components, map_scores) = match options.components {
        ComponentSelection::Fixed(e) => {
            log(
                LogLevel::Info,
                &format!("Using {} principal components (manually selected)", e),
            );
            update_dosages(likelihoods, population_prior, &outbred, &pool, &mut dosages)?;
            (e, None)
        }
        ComponentSelection::Automatic => {
            update_dosages_with_diagonal(
                likelihoods,
                population_prior,
                &outbred,
                population,
                &pool,
                &mut dosages,
                &mut diagonal,
            )?;
            let covariance = build_covariance(&dosages, &diagonal, population, &pool);
            let (selected, scores) = minimum_average_partial(&covariance)?;
            let bound = m.min(n);
            if bound < 2 {
                return Err(StructureError::InvalidRank { rank: selected, bound });
            }
            let e = selected.min(bound - 1);
            log(
                LogLevel::Info,
                &format!("Using {} principal components (MAP test)", e),
            );
            (e, Some(scores))
        }
    };

    let mut frequencies = estimate_individual_frequencies(&dosages, population, components, &pool)?;
    log(LogLevel::Info, "Individual allele frequencies estimated (1)");

    let mut iterations = 1;
    let mut converged = false;
    let mut previous_diff: Option<f64> = None;
    for iteration in 2..=options.max_iterations + 1 {
        update_dosages(
            likelihoods,
            FrequencyPrior::Individual(frequencies.view()),
            &outbred,
            &pool,
            &mut dosages,
        )?;
        let next = estimate_individual_frequencies(&dosages, population, components, &pool)?;
        let diff = rmse(next.view(), frequencies.view(), &pool);
        frequencies = next;
        iterations = iteration;
        log(
            LogLevel::Info,
            &format!("Individual allele frequencies estimated ({}). RMSD={:.6e}", iteration, diff),
        );

        if diff < options.tolerance {
            log(
                LogLevel::Info,
                "Estimation of individual allele frequencies has converged",
            );
            converged = true;
            break;
        }
        if let Some(previous) = previous_diff {
            let change = (diff - previous).abs();
            if change <= options.plateau_tolerance {
                log(
                    LogLevel::Info,
                    &format!(
                        "Estimation of individual allele frequencies has converged. Change in RMSD between iterations: {:.6e}",
                        change
                    ),
                );
                converged = true;
                break;
            }
        }
        previous_diff = Some(diff);
    }
    if !converged && options.max_iterations > 0 {
        log(
            LogLevel::Warning,
            &format!(
                "Individual allele frequencies did not converge within {} iterations",
                options.max_iterations
            ),
        );
    }

    update_dosages_with_diagonal(
        likelihoods,
        FrequencyPrior::Individual(frequencies.view()),
        &outbred,
        population,
        &pool,
        &mut dosages,
        &mut diagonal,
    )?;
    let covariance = build_covariance(&dosages, &diagonal, population, &pool);

    Ok(CovarianceEstimate {
        covariance,
        individual_frequencies: Some(frequencies),
        components,
        dosages,
        iterations,
        converged,
        map_scores,
    })
}

fn validate_population(population: ArrayView1<'_, f64>, sites: usize) -> Result<(), StructureError> {
    if population.len() != sites {
        return Err(StructureError::ShapeMismatch {
            what: "population allele frequencies",
            expected: (sites, 1),
            found: (population.len(), 1),
        });
    }
    match population
        .iter()
        .enumerate()
        .find(|(_, f)| !(**f > 0.0 && **f < 1.0))
    {
        Some((site, &value)) => Err(StructureError::PopulationFrequencyOutOfRange { site, value }),
        None => Ok(()),
    }
}

/// Covariance matrix from expected dosages.
///
/// Off-diagonal entries are cross-products of the standardised dosages
/// `(E[g] - 2f) / sqrt(2f(1 - f))` averaged over sites; the diagonal is
/// replaced by the bias-corrected `diagonal`.
pub fn build_covariance(
    dosages: &Array2<f32>,
    diagonal: &Array1<f64>,
    population: ArrayView1<'_, f64>,
    pool: &RowPool,
) -> Array2<f64> {
    let (m, n) = dosages.dim();
    let mut standardized = Array2::<f64>::zeros((m, n));
    pool.for_each_rows(rows_mut(&mut standardized), n, |range, block| {
        for (individual, row) in range.zip(block.chunks_mut(n)) {
            for (site, slot) in row.iter_mut().enumerate() {
                let f = population[site];
                *slot = (f64::from(dosages[[individual, site]]) - 2.0 * f) / (2.0 * f * (1.0 - f)).sqrt();
            }
        }
    });
    let mut covariance = standardized.dot(&standardized.t()) / n as f64;
    covariance.diag_mut().assign(diagonal);
    covariance
}

/// Individual allele frequencies from the rank-`rank` reconstruction of the
/// centered dosages, shifted back by `2f`, halved and clipped.
pub fn estimate_individual_frequencies(
    dosages: &Array2<f32>,
    population: ArrayView1<'_, f64>,
    rank: usize,
    pool: &RowPool,
) -> Result<Array2<f32>, StructureError> {
    let (m, n) = dosages.dim();
    let mut centered = Array2::<f64>::zeros((m, n));
    pool.for_each_rows(rows_mut(&mut centered), n, |range, block| {
        for (individual, row) in range.zip(block.chunks_mut(n)) {
            for (site, slot) in row.iter_mut().enumerate() {
                *slot = f64::from(dosages[[individual, site]]) - 2.0 * population[site];
            }
        }
    });

    let reconstructed = truncated_reconstruction(centered.view(), rank)?;

    let mut frequencies = Array2::<f32>::zeros((m, n));
    pool.for_each_rows(rows_mut(&mut frequencies), n, |range, block| {
        for (individual, row) in range.zip(block.chunks_mut(n)) {
            for (site, slot) in row.iter_mut().enumerate() {
                let value = ((reconstructed[[individual, site]] + 2.0 * population[site]) / 2.0) as f32;
                *slot = value
                    .max(INDIVIDUAL_FREQUENCY_BOUND)
                    .min(1.0 - INDIVIDUAL_FREQUENCY_BOUND);
            }
        }
    });
    Ok(frequencies)
}

/// Partial variances at or below this fraction of the largest variance in
/// the covariance matrix count as zero.
const DEGENERATE_VARIANCE: f64 = 1e-12;

/// Velicer's Minimum Average Partial test.
///
/// For every candidate count `k` the leading `k` components are partialled
/// out of `covariance` and the mean squared off-diagonal partial correlation
/// is recorded. Candidates whose partial variances are not all positive
/// score 1.0 and are only selected when no other candidate is valid.
/// Returns the count with the lowest score (at least 1) and the scores of
/// all candidates.
pub fn minimum_average_partial(covariance: &Array2<f64>) -> Result<(usize, Vec<f64>), StructureError> {
    let m = covariance.nrows();
    let candidates = MAP_MAX_COMPONENTS.min(m.saturating_sub(1));
    if candidates == 0 {
        return Err(StructureError::InvalidRank { rank: 1, bound: m });
    }
    let pairs = symmetric_eigen(covariance.view(), candidates)?;
    let load = loadings(&pairs);
    let floor = DEGENERATE_VARIANCE * covariance.diag().iter().fold(0.0f64, |a, &d| a.max(d.abs()));

    let mut scores: Vec<Option<f64>> = Vec::with_capacity(candidates);
    for k in 1..=candidates {
        let leading = load.slice(s![.., ..k]);
        let partial = covariance - &leading.dot(&leading.t());
        let variances = partial.diag().to_owned();
        if variances.iter().any(|&d| !(d > floor)) {
            scores.push(None);
            continue;
        }
        let scale = variances.mapv(|d| 1.0 / d.sqrt());
        let correlation = &partial * &scale.view().insert_axis(Axis(1)) * &scale.view().insert_axis(Axis(0));
        let total: f64 = correlation.iter().map(|r| r * r).sum();
        let score = (total - m as f64) / (m * (m - 1)) as f64;
        scores.push(score.is_finite().then_some(score));
    }

    let selected = lowest_score(&scores);
    Ok((selected, scores.into_iter().map(|s| s.unwrap_or(1.0)).collect()))
}

/// 1-based index of the smallest valid score, the first one on ties; 1 when
/// every candidate is degenerate.
fn lowest_score(scores: &[Option<f64>]) -> usize {
    scores
        .iter()
        .enumerate()
        .filter_map(|(k, score)| score.map(|s| (k, s)))
        .fold(None, |best: Option<(usize, f64)>, (k, s)| match best {
            Some((_, best_score)) if best_score <= s => best,
            _ => Some((k, s)),
        })
        .map_or(1, |(k, _)| k + 1)
}

//! Population allele frequencies from genotype likelihoods.

use ndarray::Array1;

use crate::error::StructureError;
use crate::kernels::rmse_vector;
use crate::likelihood::{expected_dosage, genotype_posterior, GenotypeLikelihoods};
use crate::parallel::{vector_mut, RowPool};
use crate::progress::{log, LogLevel};

/// Frequencies are kept this far away from 0 and 1.
pub const FREQUENCY_BOUND: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct FrequencyOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub threads: usize,
}

impl Default for FrequencyOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-4,
            threads: 1,
        }
    }
}

/// Maximum-likelihood population allele frequencies by EM.
///
/// Starting from 0.25 at every site, each step replaces `f_s` with half the
/// mean posterior dosage under Hardy-Weinberg proportions at the current
/// `f_s`. The result is clipped to `[1e-4, 1 - 1e-4]`, so it can be passed
/// straight to the covariance engine.
pub fn estimate_population_frequencies(
    likelihoods: &GenotypeLikelihoods,
    options: &FrequencyOptions,
) -> Result<Array1<f64>, StructureError> {
    let pool = RowPool::new(options.threads)?;
    let n = likelihoods.sites();
    let m = likelihoods.individuals();

    let mut frequencies = Array1::from_elem(n, 0.25);
    let mut next = Array1::zeros(n);
    for iteration in 1..=options.max_iterations {
        let current = frequencies.view();
        pool.for_each_rows(vector_mut(&mut next), 1, |range, out| {
            for (slot, site) in out.iter_mut().zip(range) {
                let total: f64 = (0..m)
                    .map(|i| {
                        expected_dosage(&genotype_posterior(
                            likelihoods.triplet(i, site),
                            current[site],
                            0.0,
                        ))
                    })
                    .sum();
                *slot = clip(total / (2 * m) as f64);
            }
        });
        let diff = rmse_vector(next.view(), frequencies.view());
        std::mem::swap(&mut frequencies, &mut next);
        log(
            LogLevel::Debug,
            &format!("Allele frequency EM ({}). RMSD={:.3e}", iteration, diff),
        );
        if diff < options.tolerance {
            log(
                LogLevel::Info,
                &format!("Allele frequency EM converged after {} iterations", iteration),
            );
            return Ok(frequencies);
        }
    }
    log(
        LogLevel::Warning,
        &format!(
            "Allele frequency EM did not converge within {} iterations",
            options.max_iterations
        ),
    );
    Ok(frequencies)
}

/// Half the mean expected dosage per site under a uniform genotype prior.
///
/// A one-pass estimate that needs no iteration; clipped like the EM result.
pub fn dosage_mean_frequencies(
    likelihoods: &GenotypeLikelihoods,
    threads: usize,
) -> Result<Array1<f64>, StructureError> {
    let pool = RowPool::new(threads)?;
    let n = likelihoods.sites();
    let m = likelihoods.individuals();
    let mut frequencies = Array1::zeros(n);
    pool.for_each_rows(vector_mut(&mut frequencies), 1, |range, out| {
        for (slot, site) in out.iter_mut().zip(range) {
            let total: f64 = (0..m)
                .map(|i| {
                    let like = likelihoods.triplet(i, site);
                    let sum = f64::from(like[0]) + f64::from(like[1]) + f64::from(like[2]);
                    if sum > 0.0 {
                        (f64::from(like[1]) + 2.0 * f64::from(like[2])) / sum
                    } else {
                        1.0
                    }
                })
                .sum();
            *slot = clip(total / (2 * m) as f64);
        }
    });
    Ok(frequencies)
}

#[inline]
fn clip(value: f64) -> f64 {
    value.max(FREQUENCY_BOUND).min(1.0 - FREQUENCY_BOUND)
}

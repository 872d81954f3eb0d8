//! Hard genotype calls from posterior genotype probabilities.

use ndarray::{Array2, ArrayView2};

use crate::error::StructureError;
use crate::likelihood::{genotype_posterior, GenotypeLikelihoods, InbreedingModel};
use crate::parallel::{rows_mut, RowPool};
use crate::progress::{log, LogLevel};

/// Marks a call whose best posterior probability is below the threshold.
pub const UNCALLED: u8 = 9;

/// Calls the most probable genotype of every individual at every site.
///
/// The prior is given by the individual allele frequencies, adjusted for
/// inbreeding when `inbreeding` carries coefficients. Calls whose posterior
/// probability is below `delta` are set to [`UNCALLED`].
///
/// # Arguments
/// * `likelihoods` - Genotype likelihoods of `m` individuals at `n` sites
/// * `frequencies` - `m x n` individual allele frequencies, strictly inside (0, 1)
/// * `inbreeding` - Per-individual inbreeding coefficients, or none
/// * `delta` - Minimum posterior probability of a call, in [0, 1]
/// * `threads` - Worker threads
pub fn call_genotypes(
    likelihoods: &GenotypeLikelihoods,
    frequencies: ArrayView2<'_, f32>,
    inbreeding: &InbreedingModel,
    delta: f64,
    threads: usize,
) -> Result<Array2<u8>, StructureError> {
    let m = likelihoods.individuals();
    let n = likelihoods.sites();
    if frequencies.dim() != (m, n) {
        return Err(StructureError::ShapeMismatch {
            what: "individual allele frequencies",
            expected: (m, n),
            found: frequencies.dim(),
        });
    }
    if let Some(((individual, site), &value)) = frequencies
        .indexed_iter()
        .find(|(_, f)| !(**f > 0.0 && **f < 1.0))
    {
        return Err(StructureError::IndividualFrequencyOutOfRange {
            individual,
            site,
            value,
        });
    }
    if !(0.0..=1.0).contains(&delta) {
        return Err(StructureError::InvalidConfiguration(format!(
            "call threshold {} must lie in [0, 1]",
            delta
        )));
    }
    inbreeding.validate(m)?;
    let pool = RowPool::new(threads)?;

    let mut calls = Array2::<u8>::zeros((m, n));
    pool.for_each_rows(rows_mut(&mut calls), n, |range, block| {
        for (individual, row) in range.zip(block.chunks_mut(n)) {
            let coefficient = inbreeding.coefficient(individual);
            for (site, slot) in row.iter_mut().enumerate() {
                let posterior = genotype_posterior(
                    likelihoods.triplet(individual, site),
                    f64::from(frequencies[[individual, site]]),
                    coefficient,
                );
                let mut best = 0;
                for g in 1..3 {
                    if posterior[g] > posterior[best] {
                        best = g;
                    }
                }
                *slot = if posterior[best] < delta {
                    UNCALLED
                } else {
                    best as u8
                };
            }
        }
    });

    let uncalled = calls.iter().filter(|&&g| g == UNCALLED).count();
    log(
        LogLevel::Info,
        &format!(
            "Called genotypes for {} individuals at {} sites ({} below threshold {})",
            m, n, uncalled, delta
        ),
    );
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_confident_calls_match_genotypes() {
        let genotypes = array![[0.0f32, 1.0, 2.0], [2.0, 2.0, 1.0]];
        let likelihoods = GenotypeLikelihoods::from_genotypes(genotypes.view(), 0.001, 2).unwrap();
        let frequencies = Array2::from_elem((2, 3), 0.5f32);
        let calls = call_genotypes(
            &likelihoods,
            frequencies.view(),
            &InbreedingModel::WithoutInbreeding,
            0.9,
            2,
        )
        .unwrap();
        assert_eq!(calls, genotypes.mapv(|g| g as u8));
    }

    #[test]
    fn test_uncertain_calls_are_marked() {
        let genotypes = array![[f32::NAN, 1.0]];
        let likelihoods = GenotypeLikelihoods::from_genotypes(genotypes.view(), 0.001, 1).unwrap();
        let frequencies = Array2::from_elem((1, 2), 0.5f32);
        let calls = call_genotypes(
            &likelihoods,
            frequencies.view(),
            &InbreedingModel::WithoutInbreeding,
            0.6,
            1,
        )
        .unwrap();
        assert_eq!(calls[[0, 0]], UNCALLED);
        assert_eq!(calls[[0, 1]], 1);
    }

    #[test]
    fn test_inbreeding_shifts_ambiguous_heterozygote() {
        // Equal likelihoods for all genotypes: the prior decides.
        let likelihoods = GenotypeLikelihoods::new(Array2::from_elem((3, 1), 1.0f32)).unwrap();
        let frequencies = Array2::from_elem((1, 1), 0.5f32);

        let outbred = call_genotypes(
            &likelihoods,
            frequencies.view(),
            &InbreedingModel::WithoutInbreeding,
            0.0,
            1,
        )
        .unwrap();
        assert_eq!(outbred[[0, 0]], 1);

        let inbred = call_genotypes(
            &likelihoods,
            frequencies.view(),
            &InbreedingModel::WithInbreeding(Array1::from_elem(1, 0.9)),
            0.0,
            1,
        )
        .unwrap();
        assert_ne!(inbred[[0, 0]], 1);
    }

    #[test]
    fn test_rejects_out_of_range_frequencies() {
        let likelihoods = GenotypeLikelihoods::new(Array2::from_elem((3, 2), 1.0f32)).unwrap();
        let frequencies = array![[0.5f32, 0.0]];
        assert!(matches!(
            call_genotypes(&likelihoods, frequencies.view(), &InbreedingModel::WithoutInbreeding, 0.0, 1),
            Err(StructureError::IndividualFrequencyOutOfRange { site: 1, .. })
        ));
    }
}

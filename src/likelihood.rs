//! Genotype likelihoods and the posterior genotype model.
//!
//! Likelihoods are stored as a `3m x n` matrix: rows `3i`, `3i + 1` and
//! `3i + 2` hold the likelihood of genotype 0, 1 and 2 for individual `i`.
//! Combined with an allele frequency prior (per site, or per individual and
//! site) they give posterior genotype probabilities, expected dosages and the
//! bias-corrected diagonal of the genetic covariance matrix.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::StructureError;
use crate::parallel::{rows_mut, vector_mut, RowPool};

/// Genotype likelihoods for `m` individuals at `n` sites.
#[derive(Debug, Clone)]
pub struct GenotypeLikelihoods {
    values: Array2<f32>,
}

impl GenotypeLikelihoods {
    /// Wraps a `3m x n` likelihood matrix.
    ///
    /// Rejects empty input, a row count that is not a multiple of three and
    /// negative or non-finite entries.
    pub fn new(values: Array2<f32>) -> Result<Self, StructureError> {
        let (rows, cols) = values.dim();
        if rows == 0 || cols == 0 {
            return Err(StructureError::EmptyInput {
                what: "genotype likelihood matrix",
                rows,
                cols,
            });
        }
        if rows % 3 != 0 {
            return Err(StructureError::MalformedLikelihoods(rows));
        }
        if let Some(((row, site), &value)) = values
            .indexed_iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(StructureError::InvalidLikelihood {
                individual: row / 3,
                site,
                value,
            });
        }
        Ok(Self { values })
    }

    /// Converts hard genotype calls into likelihoods.
    ///
    /// `genotypes` is `m x n` with values in {0, 1, 2} and NaN for missing
    /// calls. An observed genotype gets likelihood `1 - epsilon` and the two
    /// others `epsilon / 2`; a missing call gets a flat `1/3` triplet.
    pub fn from_genotypes(
        genotypes: ArrayView2<'_, f32>,
        epsilon: f32,
        threads: usize,
    ) -> Result<Self, StructureError> {
        let (m, n) = genotypes.dim();
        if m == 0 || n == 0 {
            return Err(StructureError::EmptyInput {
                what: "genotype matrix",
                rows: m,
                cols: n,
            });
        }
        if !(0.0..1.0).contains(&epsilon) {
            return Err(StructureError::InvalidConfiguration(format!(
                "genotype error rate {} must lie in [0, 1)",
                epsilon
            )));
        }
        if let Some(((individual, site), &value)) = genotypes
            .indexed_iter()
            .find(|(_, g)| !g.is_nan() && !(**g == 0.0 || **g == 1.0 || **g == 2.0))
        {
            return Err(StructureError::InvalidGenotype {
                individual,
                site,
                value,
            });
        }

        let pool = RowPool::new(threads)?;
        let mut values = Array2::<f32>::zeros((3 * m, n));
        pool.for_each_rows(rows_mut(&mut values), 3 * n, |range, block| {
            for (individual, triplet_rows) in range.zip(block.chunks_mut(3 * n)) {
                for site in 0..n {
                    let g = genotypes[[individual, site]];
                    for class in 0..3 {
                        triplet_rows[class * n + site] = if g.is_nan() {
                            1.0 / 3.0
                        } else if g as usize == class {
                            1.0 - epsilon
                        } else {
                            epsilon / 2.0
                        };
                    }
                }
            }
        });
        Ok(Self { values })
    }

    pub fn individuals(&self) -> usize {
        self.values.nrows() / 3
    }

    pub fn sites(&self) -> usize {
        self.values.ncols()
    }

    /// Likelihoods of genotypes 0, 1 and 2 for one individual at one site.
    #[inline]
    pub fn triplet(&self, individual: usize, site: usize) -> [f32; 3] {
        [
            self.values[[3 * individual, site]],
            self.values[[3 * individual + 1, site]],
            self.values[[3 * individual + 2, site]],
        ]
    }
}

/// Per-individual inbreeding, chosen once at the call boundary.
#[derive(Debug, Clone)]
pub enum InbreedingModel {
    WithoutInbreeding,
    WithInbreeding(Array1<f64>),
}

impl InbreedingModel {
    pub fn validate(&self, individuals: usize) -> Result<(), StructureError> {
        if let InbreedingModel::WithInbreeding(coefficients) = self {
            if coefficients.len() != individuals {
                return Err(StructureError::ShapeMismatch {
                    what: "inbreeding coefficients",
                    expected: (individuals, 1),
                    found: (coefficients.len(), 1),
                });
            }
            if let Some((individual, &value)) = coefficients
                .iter()
                .enumerate()
                .find(|(_, f)| !(0.0..=1.0).contains(*f))
            {
                return Err(StructureError::InbreedingOutOfRange { individual, value });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn coefficient(&self, individual: usize) -> f64 {
        match self {
            InbreedingModel::WithoutInbreeding => 0.0,
            InbreedingModel::WithInbreeding(coefficients) => coefficients[individual],
        }
    }
}

/// Allele frequency prior feeding the posterior genotype model.
#[derive(Debug, Clone, Copy)]
pub enum FrequencyPrior<'a> {
    /// One frequency per site, shared by all individuals.
    Population(ArrayView1<'a, f64>),
    /// One frequency per individual and site.
    Individual(ArrayView2<'a, f32>),
}

impl FrequencyPrior<'_> {
    #[inline]
    fn at(&self, individual: usize, site: usize) -> f64 {
        match self {
            FrequencyPrior::Population(f) => f[site],
            FrequencyPrior::Individual(f) => f64::from(f[[individual, site]]),
        }
    }
}

/// Genotype probabilities under Hardy-Weinberg proportions with inbreeding
/// coefficient `inbreeding` (0 gives plain Hardy-Weinberg).
#[inline]
pub fn genotype_prior(p: f64, inbreeding: f64) -> [f64; 3] {
    let het = p * (1.0 - p);
    [
        (1.0 - p) * (1.0 - p) + het * inbreeding,
        2.0 * het * (1.0 - inbreeding),
        p * p + het * inbreeding,
    ]
}

/// Normalised posterior genotype probabilities.
///
/// If every weight vanishes (all three likelihoods zero) the prior is
/// returned unchanged.
#[inline]
pub fn genotype_posterior(likelihood: [f32; 3], p: f64, inbreeding: f64) -> [f64; 3] {
    let prior = genotype_prior(p, inbreeding);
    let weights = [
        f64::from(likelihood[0]) * prior[0],
        f64::from(likelihood[1]) * prior[1],
        f64::from(likelihood[2]) * prior[2],
    ];
    let total = weights[0] + weights[1] + weights[2];
    if total > 0.0 && total.is_finite() {
        [weights[0] / total, weights[1] / total, weights[2] / total]
    } else {
        prior
    }
}

#[inline]
pub fn expected_dosage(posterior: &[f64; 3]) -> f64 {
    posterior[1] + 2.0 * posterior[2]
}

/// Recomputes the expected genotype dosages of every individual.
///
/// `inbreeding` adjusts each individual's genotype prior; pass
/// [`InbreedingModel::WithoutInbreeding`] for plain Hardy-Weinberg.
pub fn update_dosages(
    likelihoods: &GenotypeLikelihoods,
    prior: FrequencyPrior<'_>,
    inbreeding: &InbreedingModel,
    pool: &RowPool,
    dosages: &mut Array2<f32>,
) -> Result<(), StructureError> {
    let n = likelihoods.sites();
    inbreeding.validate(likelihoods.individuals())?;
    assert_eq!(dosages.dim(), (likelihoods.individuals(), n));
    pool.for_each_rows(rows_mut(dosages), n, |range, block| {
        for (individual, row) in range.zip(block.chunks_mut(n)) {
            let coefficient = inbreeding.coefficient(individual);
            for (site, slot) in row.iter_mut().enumerate() {
                let posterior = genotype_posterior(
                    likelihoods.triplet(individual, site),
                    prior.at(individual, site),
                    coefficient,
                );
                *slot = expected_dosage(&posterior) as f32;
            }
        }
    });
    Ok(())
}

/// Recomputes the expected dosages together with the covariance diagonal.
///
/// The diagonal entry of individual `i` is the site average of
/// `E[(g - 2f)^2] / (2f(1 - f))` under the posterior, with `f` the
/// population frequency. `population` must lie strictly inside (0, 1).
pub fn update_dosages_with_diagonal(
    likelihoods: &GenotypeLikelihoods,
    prior: FrequencyPrior<'_>,
    inbreeding: &InbreedingModel,
    population: ArrayView1<'_, f64>,
    pool: &RowPool,
    dosages: &mut Array2<f32>,
    diagonal: &mut Array1<f64>,
) -> Result<(), StructureError> {
    let n = likelihoods.sites();
    inbreeding.validate(likelihoods.individuals())?;
    assert_eq!(dosages.dim(), (likelihoods.individuals(), n));
    assert_eq!(diagonal.len(), likelihoods.individuals());
    assert_eq!(population.len(), n);
    pool.for_each_rows_zip(
        rows_mut(dosages),
        n,
        vector_mut(diagonal),
        1,
        |range, block, diag| {
            for ((individual, row), out) in range.zip(block.chunks_mut(n)).zip(diag.iter_mut()) {
                let coefficient = inbreeding.coefficient(individual);
                let mut total = 0.0;
                for (site, slot) in row.iter_mut().enumerate() {
                    let posterior = genotype_posterior(
                        likelihoods.triplet(individual, site),
                        prior.at(individual, site),
                        coefficient,
                    );
                    *slot = expected_dosage(&posterior) as f32;

                    let f = population[site];
                    let mean = 2.0 * f;
                    let second_moment: f64 = posterior
                        .iter()
                        .enumerate()
                        .map(|(g, p)| (g as f64 - mean) * (g as f64 - mean) * p)
                        .sum();
                    total += second_moment / (2.0 * f * (1.0 - f));
                }
                *out = total / n as f64;
            }
        },
    );
    Ok(())
}

/// Log-likelihood of the genotype likelihoods under per-individual
/// frequencies `frequencies` (`m x n`, entries in (0, 1)).
pub fn log_likelihood(
    likelihoods: &GenotypeLikelihoods,
    frequencies: ArrayView2<'_, f64>,
    pool: &RowPool,
) -> f64 {
    let n = likelihoods.sites();
    assert_eq!(frequencies.dim(), (likelihoods.individuals(), n));
    pool.sum_rows(likelihoods.individuals(), |individual| {
        (0..n)
            .map(|site| {
                let prior = genotype_prior(frequencies[[individual, site]], 0.0);
                let like = likelihoods.triplet(individual, site);
                (f64::from(like[0]) * prior[0]
                    + f64::from(like[1]) * prior[1]
                    + f64::from(like[2]) * prior[2])
                    .ln()
            })
            .sum()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_row_count_must_be_multiple_of_three() {
        let err = GenotypeLikelihoods::new(Array2::from_elem((4, 5), 0.5)).unwrap_err();
        assert!(matches!(err, StructureError::MalformedLikelihoods(4)));
    }

    #[test]
    fn test_empty_likelihoods_rejected() {
        assert!(matches!(
            GenotypeLikelihoods::new(Array2::zeros((0, 5))),
            Err(StructureError::EmptyInput { .. })
        ));
        assert!(matches!(
            GenotypeLikelihoods::new(Array2::zeros((6, 0))),
            Err(StructureError::EmptyInput { .. })
        ));
    }

    #[test]
    fn test_negative_likelihood_rejected() {
        let mut values = Array2::from_elem((6, 2), 0.3f32);
        values[[4, 1]] = -0.1;
        match GenotypeLikelihoods::new(values) {
            Err(StructureError::InvalidLikelihood { individual, site, .. }) => {
                assert_eq!((individual, site), (1, 1));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_prior_sums_to_one() {
        for &p in &[1e-4, 0.1, 0.5, 0.77, 1.0 - 1e-4] {
            for &inbreeding in &[0.0, 0.25, 1.0] {
                let prior = genotype_prior(p, inbreeding);
                assert!((prior.iter().sum::<f64>() - 1.0).abs() < 1e-12);
                assert!(prior.iter().all(|&v| v >= 0.0));
            }
        }
    }

    #[test]
    fn test_full_inbreeding_removes_heterozygotes() {
        let prior = genotype_prior(0.3, 1.0);
        assert_eq!(prior[1], 0.0);
        assert!((prior[0] - 0.7).abs() < 1e-12);
        assert!((prior[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_posterior_and_dosage() {
        let posterior = genotype_posterior([0.0, 0.0, 1.0], 0.4, 0.0);
        assert!((expected_dosage(&posterior) - 2.0).abs() < 1e-12);

        // flat likelihoods return the prior
        let posterior = genotype_posterior([1.0, 1.0, 1.0], 0.4, 0.0);
        assert!((expected_dosage(&posterior) - 0.8).abs() < 1e-12);

        // vanishing likelihoods fall back to the prior
        let posterior = genotype_posterior([0.0, 0.0, 0.0], 0.4, 0.0);
        assert!((expected_dosage(&posterior) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_from_genotypes() {
        let genotypes = array![[0.0f32, 2.0, f32::NAN], [1.0, 1.0, 0.0]];
        let likelihoods = GenotypeLikelihoods::from_genotypes(genotypes.view(), 0.01, 2).unwrap();
        assert_eq!(likelihoods.individuals(), 2);
        assert_eq!(likelihoods.sites(), 3);
        let close = |actual: [f32; 3], expected: [f32; 3]| {
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 1e-6, "{:?} != {:?}", actual, expected);
            }
        };
        close(likelihoods.triplet(0, 0), [0.99, 0.005, 0.005]);
        close(likelihoods.triplet(0, 1), [0.005, 0.005, 0.99]);
        close(likelihoods.triplet(0, 2), [1.0 / 3.0; 3]);
        close(likelihoods.triplet(1, 0), [0.005, 0.99, 0.005]);
    }

    #[test]
    fn test_from_genotypes_rejects_bad_values() {
        let genotypes = array![[0.0f32, 3.0]];
        assert!(matches!(
            GenotypeLikelihoods::from_genotypes(genotypes.view(), 0.01, 1),
            Err(StructureError::InvalidGenotype { site: 1, .. })
        ));
    }

    #[test]
    fn test_dosages_in_range_and_diagonal_for_certain_genotypes() {
        let genotypes = array![[0.0f32, 1.0, 2.0, 1.0], [2.0, 1.0, 0.0, 0.0]];
        let likelihoods = GenotypeLikelihoods::from_genotypes(genotypes.view(), 1e-6, 1).unwrap();
        let population = array![0.5, 0.5, 0.5, 0.25];
        let pool = RowPool::new(2).unwrap();
        let mut dosages = Array2::zeros((2, 4));
        let mut diagonal = Array1::zeros(2);
        update_dosages_with_diagonal(
            &likelihoods,
            FrequencyPrior::Population(population.view()),
            &InbreedingModel::WithoutInbreeding,
            population.view(),
            &pool,
            &mut dosages,
            &mut diagonal,
        )
        .unwrap();
        for (d, g) in dosages.iter().zip(genotypes.iter()) {
            assert!((0.0..=2.0).contains(d));
            assert!((d - g).abs() < 1e-3);
        }
        for individual in 0..2 {
            let expected: f64 = (0..4)
                .map(|s| {
                    let f = population[s];
                    let g = f64::from(genotypes[[individual, s]]);
                    (g - 2.0 * f).powi(2) / (2.0 * f * (1.0 - f))
                })
                .sum::<f64>()
                / 4.0;
            assert!((diagonal[individual] - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn test_individual_prior_matches_population_prior() {
        let likelihoods = GenotypeLikelihoods::new(array![
            [0.2f32, 0.9],
            [0.5, 0.05],
            [0.3, 0.05],
            [0.1, 0.4],
            [0.6, 0.4],
            [0.3, 0.2]
        ])
        .unwrap();
        let population = array![0.3, 0.6];
        let individual = array![[0.3f32, 0.6], [0.3, 0.6]];
        let pool = RowPool::new(1).unwrap();
        let mut a = Array2::zeros((2, 2));
        let mut b = Array2::zeros((2, 2));
        let outbred = InbreedingModel::WithoutInbreeding;
        update_dosages(&likelihoods, FrequencyPrior::Population(population.view()), &outbred, &pool, &mut a).unwrap();
        update_dosages(&likelihoods, FrequencyPrior::Individual(individual.view()), &outbred, &pool, &mut b).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_inbreeding_pulls_dosages_toward_homozygotes() {
        // Flat likelihoods: the dosage follows the prior alone.
        let likelihoods = GenotypeLikelihoods::new(Array2::from_elem((6, 1), 1.0f32)).unwrap();
        let population = array![0.5];
        let pool = RowPool::new(2).unwrap();
        let prior = FrequencyPrior::Population(population.view());

        let mut outbred = Array2::zeros((2, 1));
        let mut outbred_diagonal = Array1::zeros(2);
        update_dosages_with_diagonal(
            &likelihoods,
            prior,
            &InbreedingModel::WithoutInbreeding,
            population.view(),
            &pool,
            &mut outbred,
            &mut outbred_diagonal,
        )
        .unwrap();

        let mut inbred = Array2::zeros((2, 1));
        let mut inbred_diagonal = Array1::zeros(2);
        update_dosages_with_diagonal(
            &likelihoods,
            prior,
            &InbreedingModel::WithInbreeding(array![0.0, 1.0]),
            population.view(),
            &pool,
            &mut inbred,
            &mut inbred_diagonal,
        )
        .unwrap();

        // Mean dosage is unchanged at p = 0.5, but the variance doubles.
        assert!((inbred[[1, 0]] - 1.0).abs() < 1e-6);
        assert!((outbred_diagonal[0] - 1.0).abs() < 1e-9);
        assert!((inbred_diagonal[0] - outbred_diagonal[0]).abs() < 1e-12);
        assert!((inbred_diagonal[1] - 2.0).abs() < 1e-9);

        // With genotype evidence for a heterozygote, inbreeding moves the
        // posterior mass onto the homozygotes.
        let het = GenotypeLikelihoods::new(array![[0.3f32], [0.4], [0.3], [0.3], [0.4], [0.3]]).unwrap();
        let skewed = array![0.8];
        let mut plain = Array2::zeros((2, 1));
        update_dosages(
            &het,
            FrequencyPrior::Population(skewed.view()),
            &InbreedingModel::WithoutInbreeding,
            &pool,
            &mut plain,
        )
        .unwrap();
        let mut adjusted = Array2::zeros((2, 1));
        update_dosages(
            &het,
            FrequencyPrior::Population(skewed.view()),
            &InbreedingModel::WithInbreeding(array![0.0, 0.9]),
            &pool,
            &mut adjusted,
        )
        .unwrap();
        assert!((adjusted[[0, 0]] - plain[[0, 0]]).abs() < 1e-6);
        assert!(adjusted[[1, 0]] > plain[[1, 0]]);
    }

    #[test]
    fn test_dosage_update_rejects_bad_inbreeding() {
        let likelihoods = GenotypeLikelihoods::new(Array2::from_elem((6, 2), 1.0f32)).unwrap();
        let population = array![0.4, 0.6];
        let pool = RowPool::new(1).unwrap();
        let mut dosages = Array2::zeros((2, 2));
        assert!(matches!(
            update_dosages(
                &likelihoods,
                FrequencyPrior::Population(population.view()),
                &InbreedingModel::WithInbreeding(array![0.2]),
                &pool,
                &mut dosages,
            ),
            Err(StructureError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_log_likelihood_of_flat_likelihoods_is_zero() {
        let likelihoods = GenotypeLikelihoods::new(Array2::from_elem((6, 3), 1.0f32)).unwrap();
        let frequencies = Array2::from_elem((2, 3), 0.3);
        let pool = RowPool::new(2).unwrap();
        assert!(log_likelihood(&likelihoods, frequencies.view(), &pool).abs() < 1e-12);
    }

    #[test]
    fn test_inbreeding_validation() {
        let model = InbreedingModel::WithInbreeding(array![0.1, 1.2]);
        assert!(matches!(
            model.validate(2),
            Err(StructureError::InbreedingOutOfRange { individual: 1, .. })
        ));
        assert!(matches!(
            model.validate(3),
            Err(StructureError::ShapeMismatch { .. })
        ));
        assert!(InbreedingModel::WithoutInbreeding.validate(5).is_ok());
    }
}

//! Simulated admixed populations with genotype likelihoods.
//!
//! Used by the demo binary and the scenario tests: ancestral frequencies are
//! drawn uniformly, admixture proportions from a symmetric Dirichlet, and
//! genotypes from a binomial with the individual's admixed frequency.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Dirichlet, Distribution, Uniform};

use crate::error::StructureError;
use crate::likelihood::GenotypeLikelihoods;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub individuals: usize,
    pub sites: usize,
    pub populations: usize,
    /// Dirichlet concentration of the admixture proportions; small values
    /// give mostly unadmixed individuals.
    pub concentration: f64,
    /// Range of the ancestral allele frequencies.
    pub frequency_range: (f64, f64),
    /// Probability that a genotype is missing.
    pub missing_rate: f64,
    /// Genotype error rate used to build the likelihoods.
    pub error_rate: f32,
    pub threads: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            individuals: 100,
            sites: 2000,
            populations: 3,
            concentration: 0.5,
            frequency_range: (0.05, 0.95),
            missing_rate: 0.0,
            error_rate: 0.01,
            threads: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedPopulation {
    /// `m x K` true admixture proportions.
    pub q: Array2<f64>,
    /// `n x K` true ancestral allele frequencies.
    pub f: Array2<f64>,
    /// `m x n` genotypes, NaN where missing.
    pub genotypes: Array2<f32>,
    pub likelihoods: GenotypeLikelihoods,
}

impl SimulatedPopulation {
    /// `m x n` true individual allele frequencies `Q Fᵗ`.
    pub fn individual_frequencies(&self) -> Array2<f64> {
        self.q.dot(&self.f.t())
    }

    /// Per-site sample allele frequency over the observed genotypes.
    pub fn sample_frequencies(&self) -> Array1<f64> {
        let (m, n) = self.genotypes.dim();
        Array1::from_shape_fn(n, |site| {
            let observed: Vec<f64> = (0..m)
                .map(|i| self.genotypes[[i, site]])
                .filter(|g| !g.is_nan())
                .map(f64::from)
                .collect();
            if observed.is_empty() {
                0.5
            } else {
                observed.iter().sum::<f64>() / (2 * observed.len()) as f64
            }
        })
    }
}

/// Draws a population from `config` using `rng`.
pub fn simulate_population<R: Rng + ?Sized>(
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<SimulatedPopulation, StructureError> {
    let SimulationConfig {
        individuals: m,
        sites: n,
        populations: k,
        ..
    } = *config;
    if m == 0 || n == 0 || k == 0 {
        return Err(StructureError::InvalidConfiguration(format!(
            "simulation needs at least one individual, site and population (got {}, {}, {})",
            m, n, k
        )));
    }
    let (low, high) = config.frequency_range;
    if !(0.0 < low && low < high && high < 1.0) {
        return Err(StructureError::InvalidConfiguration(format!(
            "frequency range ({}, {}) must be an interval inside (0, 1)",
            low, high
        )));
    }
    if !(0.0..1.0).contains(&config.missing_rate) {
        return Err(StructureError::InvalidConfiguration(format!(
            "missing rate {} must lie in [0, 1)",
            config.missing_rate
        )));
    }

    let q = if k == 1 {
        Array2::ones((m, 1))
    } else {
        let dirichlet = Dirichlet::new_with_size(config.concentration, k).map_err(|e| {
            StructureError::InvalidConfiguration(format!("invalid Dirichlet concentration: {}", e))
        })?;
        let mut q = Array2::zeros((m, k));
        for mut row in q.rows_mut() {
            let draw: Vec<f64> = dirichlet.sample(rng);
            for (slot, value) in row.iter_mut().zip(draw) {
                *slot = value;
            }
        }
        q
    };

    let uniform = Uniform::new(low, high);
    let f = Array2::from_shape_fn((n, k), |_| uniform.sample(rng));

    let individual = q.dot(&f.t());
    let genotypes = Array2::from_shape_fn((m, n), |(i, s)| {
        if config.missing_rate > 0.0 && rng.gen::<f64>() < config.missing_rate {
            return f32::NAN;
        }
        let p = individual[[i, s]];
        let alleles = (rng.gen::<f64>() < p) as u8 + (rng.gen::<f64>() < p) as u8;
        f32::from(alleles)
    });
    let likelihoods = GenotypeLikelihoods::from_genotypes(genotypes.view(), config.error_rate, config.threads)?;

    Ok(SimulatedPopulation {
        q,
        f,
        genotypes,
        likelihoods,
    })
}

//! Population structure from genotype likelihoods.
//!
//! Estimates an individual covariance matrix and individual allele
//! frequencies by iterative low-rank refinement of posterior dosages, calls
//! genotypes from those frequencies, and factorises them into admixture
//! proportions and ancestral frequencies.

// Module declarations
pub mod admixture;
pub mod calling;
pub mod error;
pub mod frequency;
pub mod kernels;
pub mod likelihood;
pub mod linalg;
pub mod parallel;
pub mod pca;
pub mod progress;
pub mod simulate;

#[cfg(test)]
mod tests;

pub use admixture::{estimate_admixture, estimate_admixture_with_rng, AdmixtureEstimate, AdmixtureOptions};
pub use calling::{call_genotypes, UNCALLED};
pub use error::StructureError;
pub use frequency::{dosage_mean_frequencies, estimate_population_frequencies, FrequencyOptions};
pub use likelihood::{FrequencyPrior, GenotypeLikelihoods, InbreedingModel};
pub use pca::{
    estimate_covariance, minimum_average_partial, ComponentSelection, CovarianceEstimate, CovarianceOptions,
};
pub use simulate::{simulate_population, SimulatedPopulation, SimulationConfig};

use thiserror::Error;

/// Errors raised by the estimation engines.
///
/// Every variant is a rejected call: the engines validate their inputs
/// before any work is dispatched, so an error never comes with a partial
/// result.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("Empty input: {what} has shape {rows}x{cols}")]
    EmptyInput {
        what: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("Genotype likelihood matrix has {0} rows, which is not a multiple of 3")]
    MalformedLikelihoods(usize),

    #[error("Invalid genotype likelihood {value} for individual {individual} at site {site}")]
    InvalidLikelihood {
        individual: usize,
        site: usize,
        value: f32,
    },

    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Population allele frequency {value} at site {site} is outside (0, 1)")]
    PopulationFrequencyOutOfRange { site: usize, value: f64 },

    #[error("Individual allele frequency {value} for individual {individual} at site {site} is outside (0, 1)")]
    IndividualFrequencyOutOfRange {
        individual: usize,
        site: usize,
        value: f32,
    },

    #[error("Inbreeding coefficient {value} for individual {individual} is outside [0, 1]")]
    InbreedingOutOfRange { individual: usize, value: f64 },

    #[error("Invalid genotype {value} for individual {individual} at site {site}")]
    InvalidGenotype {
        individual: usize,
        site: usize,
        value: f32,
    },

    #[error("Invalid rank {rank}: must be at least 1 and below {bound}")]
    InvalidRank { rank: usize, bound: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Matrix is singular: {0}")]
    SingularMatrix(&'static str),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

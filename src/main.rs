use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, LevelFilter};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use glstruct::kernels::rmse_vector;
use glstruct::progress::{create_spinner, display_status_box, StatusBox};
use glstruct::{
    call_genotypes, estimate_admixture, estimate_covariance, estimate_population_frequencies,
    simulate_population, AdmixtureOptions, ComponentSelection, CovarianceOptions, FrequencyOptions,
    InbreedingModel, SimulationConfig, UNCALLED,
};

/// Simulates an admixed population and runs the full inference pipeline on it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value_t = 100)]
    individuals: usize,

    #[arg(long, default_value_t = 2000)]
    sites: usize,

    /// Number of simulated ancestral populations (also K for admixture)
    #[arg(long, default_value_t = 3)]
    populations: usize,

    /// Principal components for the covariance model; 0 selects them with the MAP test
    #[arg(short = 'e', long, default_value_t = 0)]
    components: usize,

    #[arg(long, default_value_t = 0.01)]
    error_rate: f32,

    #[arg(long, default_value_t = 0.0)]
    missing_rate: f64,

    /// Dirichlet concentration of the simulated admixture proportions
    #[arg(long, default_value_t = 0.5)]
    concentration: f64,

    /// Sparseness penalty on the admixture proportions
    #[arg(long, default_value_t = 0.0)]
    alpha: f64,

    #[arg(long, default_value_t = 5)]
    batches: usize,

    /// Minimum posterior probability of a genotype call
    #[arg(long, default_value_t = 0.0)]
    call_threshold: f64,

    #[arg(long, default_value_t = 100)]
    max_iterations: usize,

    #[arg(long, default_value_t = 5e-5)]
    tolerance: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(short, long, default_value_t = num_cpus::get())]
    threads: usize,
}

fn main() -> Result<()> {
    Builder::new().filter_level(LevelFilter::Info).init();
    let args = Args::parse();

    println!("{}", "Starting population structure analysis...".green());
    info!("Threads: {}", args.threads);

    let spinner = create_spinner("Simulating genotype likelihoods");
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let simulated = simulate_population(
        &SimulationConfig {
            individuals: args.individuals,
            sites: args.sites,
            populations: args.populations,
            concentration: args.concentration,
            missing_rate: args.missing_rate,
            error_rate: args.error_rate,
            threads: args.threads,
            ..Default::default()
        },
        &mut rng,
    )
    .context("simulating population")?;
    spinner.finish_and_clear();

    let spinner = create_spinner("Estimating population allele frequencies");
    let population = estimate_population_frequencies(
        &simulated.likelihoods,
        &FrequencyOptions {
            threads: args.threads,
            ..Default::default()
        },
    )
    .context("estimating population allele frequencies")?;
    spinner.finish_and_clear();
    let frequency_error = rmse_vector(population.view(), simulated.sample_frequencies().view());

    let spinner = create_spinner("Estimating covariance matrix");
    let components = match args.components {
        0 => ComponentSelection::Automatic,
        e => ComponentSelection::Fixed(e),
    };
    let covariance = estimate_covariance(
        &simulated.likelihoods,
        population.view(),
        &CovarianceOptions {
            components,
            max_iterations: args.max_iterations,
            tolerance: args.tolerance,
            threads: args.threads,
            ..Default::default()
        },
    )
    .context("estimating covariance matrix")?;
    spinner.finish_and_clear();

    display_status_box(StatusBox {
        title: "Covariance".to_string(),
        stats: vec![
            ("Individuals".to_string(), args.individuals.to_string()),
            ("Sites".to_string(), args.sites.to_string()),
            (
                "Frequency RMSD vs sample".to_string(),
                format!("{:.4}", frequency_error),
            ),
            ("Components".to_string(), covariance.components.to_string()),
            ("Iterations".to_string(), covariance.iterations.to_string()),
            ("Converged".to_string(), covariance.converged.to_string()),
            (
                "Mean diagonal".to_string(),
                format!("{:.4}", covariance.covariance.diag().mean().unwrap_or(0.0)),
            ),
        ],
    });

    // Covariance-only mode leaves no individual frequencies to factorise.
    let Some(frequencies) = covariance.individual_frequencies else {
        println!("{}", "No individual allele frequencies estimated; stopping.".yellow());
        return Ok(());
    };

    let spinner = create_spinner("Calling genotypes");
    let calls = call_genotypes(
        &simulated.likelihoods,
        frequencies.view(),
        &InbreedingModel::WithoutInbreeding,
        args.call_threshold,
        args.threads,
    )
    .context("calling genotypes")?;
    spinner.finish_and_clear();
    let called: Vec<(f32, u8)> = simulated
        .genotypes
        .iter()
        .zip(calls.iter())
        .filter(|(g, c)| !g.is_nan() && **c != UNCALLED)
        .map(|(&g, &c)| (g, c))
        .collect();
    let concordant = called.iter().filter(|(g, c)| *g as u8 == *c).count();

    let spinner = create_spinner("Estimating admixture proportions");
    let admixture = estimate_admixture(
        frequencies.view(),
        &simulated.likelihoods,
        &AdmixtureOptions {
            components: args.populations,
            alpha: args.alpha,
            seed: args.seed,
            batches: args.batches,
            threads: args.threads,
            ..Default::default()
        },
    )
    .context("estimating admixture proportions")?;
    spinner.finish_and_clear();

    display_status_box(StatusBox {
        title: "Genotypes and admixture".to_string(),
        stats: vec![
            ("Called genotypes".to_string(), called.len().to_string()),
            (
                "Call concordance".to_string(),
                format!(
                    "{:.2}%",
                    100.0 * concordant as f64 / called.len().max(1) as f64
                ),
            ),
            ("K".to_string(), args.populations.to_string()),
            (
                "Iterations".to_string(),
                format!(
                    "{} batch + {} full",
                    admixture.stochastic_iterations, admixture.full_iterations
                ),
            ),
            ("Converged".to_string(), admixture.converged.to_string()),
            (
                "Frobenius error".to_string(),
                format!("{:.4}", admixture.frobenius_error),
            ),
            (
                "Log-likelihood".to_string(),
                format!("{:.4}", admixture.log_likelihood),
            ),
        ],
    });

    println!("{}", "Analysis complete.".green());
    Ok(())
}

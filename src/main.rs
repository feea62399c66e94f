use anyhow::anyhow;
use clap::{Parser, Subcommand};
use mimic::{
    config::EngineConfig, engine::EvasionEngine, logging, sim, sim::SimOptions,
    snapshot::ScoreSnapshot, PerformanceMode,
};
use std::path::{Path, PathBuf};

/// MIMIC adaptive evasion engine
#[derive(Parser)]
#[command(name = "mimic")]
#[command(about = "Adaptive DPI evasion strategy engine with online learning")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated adaptation session against the loaded catalog
    Run {
        /// Path to the catalog configuration file
        #[arg(long, default_value = "config/catalog.yml")]
        config: PathBuf,

        /// Number of connection attempts to simulate
        #[arg(long, default_value_t = 200)]
        connections: usize,

        /// Performance mode override: speed, balanced, quality
        #[arg(long)]
        mode: Option<String>,

        /// Fixed RNG seed for a reproducible adversary
        #[arg(long)]
        seed: Option<u64>,

        /// Write the final scoreboard snapshot to this path
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
    },
    /// Print the loaded strategy and detection catalog
    Catalog {
        /// Path to the catalog configuration file
        #[arg(long, default_value = "config/catalog.yml")]
        config: PathBuf,
    },
    /// Print a saved scoreboard snapshot
    Snapshot {
        /// Path to the snapshot file
        #[arg(long, default_value = "snapshots/scores.yml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        Some(Commands::Run { config, .. }) => config.clone(),
        Some(Commands::Catalog { config }) => config.clone(),
        _ => PathBuf::from("config/catalog.yml"),
    };

    let config = EngineConfig::load(&config_path).await?;

    logging::init_logging(
        &config.engine.log_level,
        config.engine.log_to_file,
        config.engine.log_file_path.as_deref(),
    )?;

    match cli.command {
        None | Some(Commands::Catalog { .. }) => {
            print_catalog(&config)?;
        }
        Some(Commands::Run { connections, mode, seed, snapshot_out, .. }) => {
            let engine = EvasionEngine::new(&config)?;

            if let Some(mode) = mode {
                let mode: PerformanceMode =
                    mode.parse().map_err(|e| anyhow!("{}", e))?;
                engine.set_mode(mode);
            }

            // Warm-start from the configured snapshot when one exists.
            if let Some(path) = &config.engine.snapshot_path {
                if Path::new(path).exists() {
                    let snapshot = ScoreSnapshot::load(path).await?;
                    engine.warm_start(&snapshot);
                }
            }

            let options = SimOptions { connections, seed, pace: true };
            let report = sim::run_session(&engine, &options).await;

            println!("Session complete ({} mode)", engine.mode());
            println!(
                "  attempts={} success={} blocked={} degraded={} timed_out={} fallbacks={}",
                report.attempts,
                report.successes,
                report.blocked,
                report.degraded,
                report.timed_out,
                report.direct_fallbacks
            );
            println!(
                "  success_rate={:.1}% mean_layers={:.2}",
                report.success_rate() * 100.0,
                report.mean_layers
            );
            if let Some(rate) = engine.recent_block_rate() {
                println!("  recent_block_rate={:.1}%", rate * 100.0);
            }
            if let Some(latency) = engine.recent_mean_latency() {
                println!("  recent_mean_latency={}ms", latency.as_millis());
            }

            if let Some(path) = snapshot_out {
                engine.snapshot().save(&path).await?;
                println!("Snapshot written to {}", path.display());
            }
        }
        Some(Commands::Snapshot { path }) => {
            let snapshot = ScoreSnapshot::load(&path).await?;
            println!("Snapshot taken at {}", snapshot.taken_at);
            println!("{:<26} {:<10} {:>9} {:>8} {}", "ID", "KIND", "ESTIMATE", "SAMPLES", "LAST UPDATED");
            for entry in &snapshot.entries {
                println!(
                    "{:<26} {:<10} {:>9.4} {:>8} {}",
                    entry.id,
                    format!("{:?}", entry.kind).to_lowercase(),
                    entry.current_estimate,
                    entry.sample_count,
                    entry
                        .last_updated
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    Ok(())
}

fn print_catalog(config: &EngineConfig) -> anyhow::Result<()> {
    config.validate()?;

    println!("Strategies ({}):", config.strategies.len());
    println!(
        "  {:<24} {:<14} {:>6} {:>6} {:<14} {}",
        "ID", "CATEGORY", "PRIOR", "COST", "GROUP", "ENABLED"
    );
    for strategy in &config.strategies {
        println!(
            "  {:<24} {:<14} {:>6.2} {:>6.1} {:<14} {}",
            strategy.id,
            strategy.category,
            strategy.baseline_prior,
            strategy.performance_cost,
            strategy.exclusion_group.as_deref().unwrap_or("-"),
            strategy.enabled
        );
    }

    println!("Detection methods ({}):", config.detection_methods.len());
    println!("  {:<24} {:<14} {:>10} {}", "ID", "CATEGORY", "PREVALENCE", "COUNTERED BY");
    for method in &config.detection_methods {
        println!(
            "  {:<24} {:<14} {:>10.2} {}",
            method.id,
            method.category,
            method.baseline_prevalence,
            if method.countered_by.is_empty() {
                "-".to_string()
            } else {
                method.countered_by.join(", ")
            }
        );
    }

    Ok(())
}

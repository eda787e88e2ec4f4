use anyhow::Context;
use clap::{Parser, Subcommand};
use mt_engine::{ProgressEvent, ProgressReporter, SessionConfig};
use mt_types::TuneError;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mt-tune",
    version,
    about = "Search-driven tuning of allocator build constants"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a tuning session
    Run {
        /// Session configuration (JSON)
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Also write the final report to this file
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
        /// Override the iteration budget
        #[arg(long)]
        iterations: Option<usize>,
        /// Override the strategy seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Validate a configuration and print the declared space
    Check {
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            report,
            iterations,
            seed,
        } => cmd_run(config, report, iterations, seed).await,
        Command::Check { config } => cmd_check(config),
    }
}

async fn cmd_run(
    path: PathBuf,
    report_path: Option<PathBuf>,
    iterations: Option<usize>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = load(&path)?;
    if let Some(n) = iterations {
        config = config.with_max_iterations(n);
    }
    if let Some(seed) = seed {
        config = config.with_seed(seed);
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let printer = std::thread::spawn(move || {
        for event in rx {
            if let ProgressEvent::NewBest {
                number,
                assignment,
                score,
            } = event
            {
                eprintln!("best so far (trial {number}): {assignment}  score {score}");
            }
        }
    });

    let mut session = config
        .build_session()
        .map_err(abort)?
        .with_progress(ProgressReporter::new(tx));
    let outcome = session.run().await;
    // Dropping the session closes the channel and ends the printer.
    drop(session);
    let _ = printer.join();

    let report = match outcome {
        Ok(report) => report,
        Err(e) => return Err(abort(e)),
    };

    let json = report.to_json()?;
    println!("{json}");
    if let Some(out) = report_path {
        std::fs::write(&out, &json)
            .with_context(|| format!("cannot write report '{}'", out.display()))?;
    }
    match &report.best {
        Some(best) => eprintln!(
            "best candidate: {}  score {}  ({})",
            best.assignment, best.score, best.verdict
        ),
        None => eprintln!("no candidate was evaluated"),
    }
    Ok(())
}

fn cmd_check(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    let space = config.build_space().map_err(abort)?;
    println!("{}: {} parameters", config.name, space.len());
    for param in space.parameters() {
        println!("  {:<24} {}", param.name, param.domain);
    }
    match space.grid_size() {
        Some(size) => println!("grid size: {size}"),
        None => println!("grid size: exceeds u128"),
    }
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<SessionConfig> {
    SessionConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("{} (config '{}')", e.abort_message(), path.display()))
}

fn abort(e: TuneError) -> anyhow::Error {
    anyhow::anyhow!(e.abort_message())
}

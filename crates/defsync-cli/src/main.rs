use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use defsync_storage::{ManifestError, ManifestStore};
use defsync_sync::{run_detect, DetectConfig, DriftStatus, FixtureOverride};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "defsync")]
#[command(about = "Detect and reconcile drift between imported definitions and their upstream")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify upstream drift and write a report. Exits 0, 1 or 2.
    Detect(DetectArgs),
    /// Check the manifest against its schema. Exits 0 or 2.
    Validate(ValidateArgs),
}

#[derive(Debug, Default, Args)]
struct DetectArgs {
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long)]
    sources_file: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Serve this local directory as the upstream tree instead of GitHub.
    #[arg(long)]
    fixture_dir: Option<PathBuf>,
    /// Restrict `--fixture-dir` to one source id.
    #[arg(long, requires = "fixture_dir")]
    fixture_source: Option<String>,
    /// Print the full report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = DetectConfig::from_env();
    let result = match cli.command.unwrap_or(Commands::Detect(DetectArgs::default())) {
        Commands::Detect(args) => detect(config, args).await,
        Commands::Validate(args) => validate(config, args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("defsync failed: {err:#}");
            ExitCode::from(DriftStatus::Error.exit_code() as u8)
        }
    }
}

async fn detect(mut config: DetectConfig, args: DetectArgs) -> Result<u8> {
    if let Some(path) = args.manifest {
        config.manifest_path = path;
    }
    if let Some(path) = args.sources_file {
        config.sources_file = Some(path);
    }
    if let Some(path) = args.reports_dir {
        config.reports_dir = path;
    }
    let fixture = args.fixture_dir.map(|dir| FixtureOverride {
        dir,
        source_id: args.fixture_source,
    });

    let (report, dir) = run_detect(&config, fixture.as_ref()).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let s = &report.summary;
        println!(
            "drift {:?}: run_id={} changed={} new={} deleted={} skipped={} errors={} conflicts={} reports={}",
            report.status,
            report.run_id,
            s.hash_changes.len(),
            s.new_upstream.len(),
            s.deletions.len(),
            s.skipped.len(),
            s.errors.len(),
            report.conflicts().count(),
            dir.display()
        );
    }
    Ok(report.exit_code as u8)
}

async fn validate(config: DetectConfig, args: ValidateArgs) -> Result<u8> {
    let path = args.manifest.unwrap_or(config.manifest_path);
    match ManifestStore::new(&path).read_checked().await {
        Ok(manifest) => {
            println!(
                "{}: valid ({} sources, {} definitions)",
                path.display(),
                manifest.sources.len(),
                manifest.definitions.len()
            );
            Ok(0)
        }
        Err(ManifestError::Validation { problems, .. }) => {
            println!("{}: {} problem(s)", path.display(), problems.len());
            for problem in problems {
                println!("- {problem}");
            }
            Ok(2)
        }
        Err(err) => {
            println!("{}: {err}", path.display());
            Ok(2)
        }
    }
}

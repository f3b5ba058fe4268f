use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use patchplot::analysis::batch::{self, Outcome};
use patchplot::analysis::plot::RenderOptions;
use patchplot::analysis::recording::{self, RECORDING_EXTENSION};

/// Protocol-dispatched analysis and figure rendering for electrophysiology
/// recordings.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Recording file (`.ephys`) or a folder of recordings. With no path,
    /// a built-in synthetic recording is generated and analyzed.
    path: Option<PathBuf>,

    /// Do not write figure files.
    #[arg(long)]
    no_save: bool,

    /// Open each persisted figure with the platform viewer.
    #[arg(long)]
    show: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let options = RenderOptions {
        save: !cli.no_save,
        show: cli.show,
    };
    match run(cli, options) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, options: RenderOptions) -> Result<ExitCode> {
    let Some(path) = cli.path else {
        return smoke_test(options);
    };

    if path.is_dir() {
        let outcomes = batch::analyze_folder(&path, &options)
            .with_context(|| format!("analyzing folder {}", path.display()))?;
        let failed = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::Failed(_)))
            .count();
        for (file, outcome) in &outcomes {
            println!("{}: {}", file.display(), outcome.label());
        }
        println!("{} recordings, {} failed", outcomes.len(), failed);
        return Ok(if failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    if !path.exists() {
        println!("{} does not exist", path.display());
        return Ok(ExitCode::FAILURE);
    }
    if path
        .extension()
        .map(|ext| ext != RECORDING_EXTENSION)
        .unwrap_or(true)
    {
        println!(
            "{} needs to be a .{RECORDING_EXTENSION} recording",
            path.display()
        );
        return Ok(ExitCode::FAILURE);
    }
    match batch::analyze_one(&path, &options) {
        Outcome::Failed(reason) => {
            println!("{}: error ({reason})", path.display());
            Ok(ExitCode::FAILURE)
        }
        outcome => {
            println!("{}: {}", path.display(), outcome.label());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Zero-argument invocation: generate and analyze a synthetic recording.
fn smoke_test(options: RenderOptions) -> Result<ExitCode> {
    info!("no path given; generating a synthetic demo recording");
    let dir = std::env::temp_dir().join("patchplot-demo");
    let path = recording::write_demo_recording(&dir)
        .with_context(|| format!("writing demo recording under {}", dir.display()))?;
    let outcome = batch::analyze_one(&path, &options);
    println!("{}: {}", path.display(), outcome.label());
    if let Outcome::Success(artifacts) = &outcome {
        for artifact in artifacts {
            println!("  {}", artifact.display());
        }
    }
    Ok(match outcome {
        Outcome::Failed(_) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

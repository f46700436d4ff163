mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jake_lib::execute::{ExecuteConfig, TargetLoad};

use crate::output::OutputFormat;

/// jake - Load-adaptive build orchestrator
#[derive(Parser)]
#[command(name = "jake")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Directory holding jake.toml
  #[arg(long, global = true, env = "JAKE_PROJECT_ROOT", default_value = ".")]
  project_root: PathBuf,

  /// Target load: an absolute CPU count ("4") or a multiple of available CPUs ("x1.5")
  #[arg(long, global = true, env = "JAKE_LOAD", allow_hyphen_values = true)]
  load: Option<TargetLoad>,

  /// Longest pause between two scheduling decisions
  #[arg(long, global = true, value_parser = humantime::parse_duration, default_value = "50ms")]
  poll_interval: Duration,

  /// Output format
  #[arg(long, global = true, value_enum, default_value_t)]
  format: OutputFormat,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run every build declared in the project
  Build,

  /// Write the declared build graph in Graphviz DOT format
  Graph {
    /// File to write (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      output::print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn run(cli: Cli) -> Result<()> {
  let root = dunce::canonicalize(&cli.project_root)
    .with_context(|| format!("Failed to resolve project root: {}", cli.project_root.display()))?;

  match cli.command {
    Commands::Build => {
      let config = ExecuteConfig {
        target_load: cli.load.unwrap_or_default(),
        poll_interval: cli.poll_interval,
        ..Default::default()
      };
      cmd::cmd_build(&root, config, cli.format)
    }
    Commands::Graph { output } => cmd::cmd_graph(&root, output.as_deref()),
  }
}

mod cmd;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use strata_lib::compile::CompileError;
use tracing_subscriber::EnvFilter;

use crate::cmd::{CompileArgs, PlanArgs, cmd_compile, cmd_plan};
use crate::output::print_error;

/// Compile filesystem image layers
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Verbose logging; show the full stderr of nested builds
  #[arg(long, global = true)]
  debug: bool,

  /// Already running inside the build appliance
  #[arg(long, global = true, hide = true)]
  is_nested: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build one layer into a sealed subvolume and print its descriptor
  Compile(CompileArgs),

  /// Show the phases and dependency batches a compile would run
  Plan(PlanArgs),
}

fn init_logging(debug: bool) {
  let default = if debug { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

/// Exit status for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
  let code = err.downcast_ref::<CompileError>().map_or(1, CompileError::exit_code);
  u8::try_from(code).unwrap_or(1)
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.debug);

  let result = match cli.command {
    Commands::Compile(args) => cmd_compile(args, cli.debug, cli.is_nested),
    Commands::Plan(args) => cmd_plan(args),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::from(exit_code(&err))
    }
  }
}

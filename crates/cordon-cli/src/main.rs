//! Cordon command-line tool
//!
//! Validates, inspects and runs sandboxed program blobs outside of a host
//! application.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "cordon")]
#[command(about = "Validate, inspect and run Cordon sandbox programs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every class of a blob against a policy without running it
    Check {
        /// Program blob
        blob: PathBuf,
        /// Configuration file with policy profiles
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Profile to check against (every type is allowed when omitted)
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Print the decoded wire tree of a blob as JSON
    Dump {
        /// Program blob
        blob: PathBuf,
        /// Single-line output
        #[arg(long)]
        compact: bool,
    },

    /// Load a blob and invoke one static method
    Run {
        /// Program blob
        blob: PathBuf,
        /// Declaring class
        #[arg(long)]
        class: String,
        /// Static method name
        #[arg(long)]
        method: String,
        /// Configuration file with options and policy profiles
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Profile to load with (every type is allowed when omitted)
        #[arg(short, long)]
        profile: Option<String>,
        /// Arguments: integers, floats, `true`/`false`, or strings
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,cordon_core=info"));
    fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { blob, config, profile } => {
            let ok = commands::check::execute(&blob, config.as_deref(), profile.as_deref())?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Dump { blob, compact } => commands::dump::execute(&blob, compact)?,
        Commands::Run {
            blob,
            class,
            method,
            config,
            profile,
            args,
        } => commands::run::execute(&blob, &class, &method, config.as_deref(), profile.as_deref(), &args)?,
    }
    Ok(())
}

//! Rewind command-line driver
//!
//! Reads classes in the JSON interchange format, runs the resumable-method
//! transform over them and prints analysis and disassembly listings.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "rewind")]
#[command(about = "Resumable-method lowering for Rewind bytecode", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform every method of a class
    Transform {
        /// Class file (JSON)
        input: PathBuf,
        /// Write the transformed class here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Transform options (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Skip re-analysis of the emitted methods
        #[arg(long)]
        no_verify: bool,
    },

    /// Print the reconstructed frames and suspension points of a method
    Analyze {
        /// Class file (JSON)
        input: PathBuf,
        /// Method name
        method: String,
        /// Transform options (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print a class listing
    Disasm {
        /// Class file (JSON)
        input: PathBuf,
        /// Transform before printing
        #[arg(short, long)]
        transformed: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Transform {
            input,
            output,
            config,
            no_verify,
        } => commands::transform::execute(&input, output.as_deref(), config.as_deref(), no_verify),
        Commands::Analyze {
            input,
            method,
            config,
        } => commands::analyze::execute(&input, &method, config.as_deref()),
        Commands::Disasm { input, transformed } => commands::disasm::execute(&input, transformed),
    }
}

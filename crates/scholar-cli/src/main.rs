//! Scholar CLI - per-user code execution service.

mod colors;
mod run;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scholar")]
#[command(about = "Per-user Python code execution service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP execution server
    Serve(serve::ServeArgs),

    /// Execute a file in a fresh local kernel
    Run {
        /// Path to the source file, or `-` for stdin
        file: String,

        /// Python interpreter to use
        #[arg(long)]
        python: Option<PathBuf>,

        /// Execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => serve::execute(args).await?,

        Commands::Run {
            file,
            python,
            timeout,
        } => {
            // Kernel IPC blocks; keep it off the runtime.
            tokio::task::spawn_blocking(move || run::execute(&file, python, timeout)).await??;
        }
    }

    Ok(())
}

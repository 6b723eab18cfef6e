// Copyright 2026 Labelscan Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use labelscan::{cli, config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "labelscan",
    about = "Energy-label compliance scanner for marketplace product pages",
    version
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = config::DEFAULT_HTTP_PORT)]
        port: u16,
    },
    /// Analyze a single product-page URL
    Analyze {
        /// Product-page URL on a supported marketplace domain
        url: String,
    },
    /// Scan a newline-delimited list of URLs
    Batch {
        /// File with one URL per line ('#' starts a comment)
        file: PathBuf,
    },
    /// Check environment and effective configuration
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    cli::init_tracing(args.verbose);

    let result = match args.command {
        Commands::Serve { port } => cli::serve::run(port).await,
        Commands::Analyze { url } => cli::analyze::run(&url, args.json).await,
        Commands::Batch { file } => cli::batch::run(&file, args.json).await,
        Commands::Doctor => cli::doctor::run().await,
    };

    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    result
}

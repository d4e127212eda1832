//! CLI entry point for offline Unigraph tooling.
//!
//! Reads JSON from a file or stdin, writes JSON to stdout. Logs go to
//! stderr so output stays pipeable.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use unigraph_cli::commands;
use unigraph_core::ClientConfig;

#[derive(Parser)]
#[command(name = "unigraph")]
#[command(about = "Pad, unpad and inspect Unigraph object-graph data")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Package descriptor(s) whose schemas should be loaded.
    #[arg(short, long = "package", global = true)]
    packages: Vec<PathBuf>,

    /// Config file prefix (default: unigraph).
    #[arg(short, long, default_value = "unigraph", global = true)]
    config: String,

    /// Pretty-print output.
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Pad a plain JSON value into wire form.
    Pad {
        /// Input file (default: stdin).
        input: Option<PathBuf>,
        /// Schema to pad against.
        #[arg(short, long)]
        schema: Option<String>,
    },
    /// Unpad a wire entity (or a list of them) into plain JSON.
    Unpad {
        /// Input file (default: stdin).
        input: Option<PathBuf>,
        /// Keep hidden entities and array entries.
        #[arg(long)]
        show_hidden: bool,
    },
    /// Decode a batch of wire entities and report the malformed ones.
    Check {
        /// Input file (default: stdin).
        input: Option<PathBuf>,
    },
    /// Install a package descriptor into a scratch catalog and validate it.
    InspectPackage {
        /// Package descriptor file.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config)?;

    let packages = cli
        .packages
        .iter()
        .map(|p| commands::read_package(p.as_path()))
        .collect::<Result<Vec<_>, _>>()?;
    let catalog = commands::load_catalog(&packages);
    tracing::debug!(schemas = catalog.len(), packages = packages.len(), "Catalog loaded");

    let output = match cli.command {
        Command::Pad { ref input, ref schema } => {
            let plain = commands::read_json(input.as_deref())?;
            commands::pad(&catalog, &plain, schema.as_deref())?
        }
        Command::Unpad {
            ref input,
            show_hidden,
        } => {
            let wire = commands::read_json(input.as_deref())?;
            let show_hidden = show_hidden || config.show_hidden;
            commands::unpad(&catalog, &wire, show_hidden)?
        }
        Command::Check { ref input } => {
            let wire = commands::read_json(input.as_deref())?;
            serde_json::to_value(commands::check(&catalog, &wire))?
        }
        Command::InspectPackage { ref path } => {
            let descriptor = commands::read_package(path)?;
            serde_json::to_value(commands::inspect_package(&descriptor).await?)?
        }
    };

    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(())
}

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_client::Client;
use kestrel_core::ClientConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "Kestrel — client for a replicated coordination cluster",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Client configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Node address to connect to; repeat for several. Overrides the
    /// addresses in --config.
    #[arg(short, long = "addr", global = true)]
    addrs: Vec<String>,

    /// Cluster name
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the body and revision of a file
    Get {
        path: String,
        /// Read as of this revision instead of the latest
        #[arg(long)]
        rev: Option<i64>,
    },
    /// Write a file if its revision matches
    Set {
        path: String,
        /// Expected current revision (0 to create)
        rev: i64,
        value: String,
    },
    /// Delete a file if its revision matches
    Del { path: String, rev: i64 },
    /// Print the length and revision of a file or directory
    Stat {
        path: String,
        #[arg(long)]
        rev: Option<i64>,
    },
    /// Print the current revision of the store
    Rev,
    /// Round-trip a no-op through the cluster
    Nop,
    /// Stream changes under a glob until interrupted
    Watch {
        glob: String,
        /// First revision to report (default: the next one)
        #[arg(long)]
        from: Option<i64>,
    },
    /// List files matching a glob
    Walk {
        glob: String,
        #[arg(long)]
        rev: Option<i64>,
        #[arg(long)]
        offset: Option<i32>,
        #[arg(long)]
        limit: Option<i32>,
    },
    /// List the entries of a directory
    Getdir {
        path: String,
        #[arg(long, default_value = "0")]
        offset: i32,
        #[arg(long, default_value = "-1")]
        limit: i32,
        #[arg(long)]
        rev: Option<i64>,
    },
    /// List cluster nodes and their addresses
    Members,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kestrel=info".parse()?)
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let client = Client::new(&config)?;
    let format = cli.format;

    match cli.command {
        Commands::Get { path, rev } => commands::kv::get(&client, &path, rev, format).await,
        Commands::Set { path, rev, value } => {
            commands::kv::set(&client, &path, rev, &value, format).await
        }
        Commands::Del { path, rev } => commands::kv::del(&client, &path, rev).await,
        Commands::Stat { path, rev } => commands::kv::stat(&client, &path, rev, format).await,
        Commands::Rev => commands::kv::rev(&client, format).await,
        Commands::Nop => commands::kv::nop(&client).await,
        Commands::Watch { glob, from } => commands::stream::watch(&client, &glob, from, format).await,
        Commands::Walk { glob, rev, offset, limit } => {
            commands::stream::walk(&client, &glob, rev, offset, limit, format).await
        }
        Commands::Getdir { path, offset, limit, rev } => {
            commands::stream::getdir(&client, &path, offset, limit, rev, format).await
        }
        Commands::Members => commands::stream::members(&client, &config, format).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if !cli.addrs.is_empty() {
        config.cluster.addrs = cli.addrs.clone();
    }
    if let Some(name) = &cli.name {
        config.cluster.name = name.clone();
    }
    if config.cluster.addrs.is_empty() {
        bail!("no cluster address given; use --addr or --config");
    }
    Ok(config)
}

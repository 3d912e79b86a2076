use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use preview_engine::config::EngineConfig;
use preview_engine::preview::executor::{Executor, ExecutorSettings};
use preview_engine::preview::server;
use preview_engine::preview::system::System;

#[derive(Parser)]
#[command(name = "preview-engine")]
#[command(version, about = "Live preview orchestration for GitHub repositories")]
pub struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control API and supervise preview runs
    Serve {
        #[command(flatten)]
        config: EngineConfig,
    },
    /// Install and build a local Node project the way real mode does
    SelfTest {
        /// Application directory containing package.json
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn self_test(dir: PathBuf) -> Result<()> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    let executor = Executor::new(System::real(), ExecutorSettings::default());
    let outcome = executor
        .run_build_node_direct(&dir)
        .await
        .with_context(|| format!("Build failed in {}", dir.display()))?;
    println!("Build succeeded: {}", outcome.command);
    if !outcome.output.trim().is_empty() {
        println!("{}", outcome.output.trim_end());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Serve { config } => server::start_server(config).await?,
        Commands::SelfTest { dir } => self_test(dir).await?,
    }
    Ok(())
}

//! Sandbox broker server binary.
//!
//! Loads the YAML configuration, connects to the local Docker daemon, removes
//! containers left behind by a previous run and serves `POST /sandbox` until
//! Ctrl+C or SIGTERM, stopping every sandbox on the way out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use mcpbox_core::discovery::{GitHubReadmeSource, OpenAiOracle};
use mcpbox_core::lifecycle::{ContainerRuntime, DockerRuntime};
use mcpbox_core::{ConfigLoader, SandboxService};
use mcpbox_server::{shutdown_signal, SandboxServer, ServerConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about = "mcpbox - run MCP tool servers in disposable containers")]
struct Cli {
    #[clap(long, short, default_value = "mcpbox.yaml", help = "Configuration file (defaults apply when it does not exist)")]
    config: PathBuf,

    #[clap(long, help = "Override server.bind_addr")]
    bind_addr: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Override docker.base_image")]
    base_image: Option<String>,

    #[clap(long, help = "Override limits.max_sandboxes")]
    max_sandboxes: Option<usize>,

    #[clap(long, help = "Do not remove leftover sandbox containers at startup")]
    no_sweep: bool,

    #[clap(long, help = "Also remove unused sandbox images during the startup sweep")]
    prune_images: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(log_level_filter).init();

    log::info!("Loading configuration from: {}", cli.config.display());
    let mut config = ConfigLoader::from_file_or_default(&cli.config).await?;

    if let Some(bind_addr) = cli.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    if let Some(base_image) = cli.base_image {
        config.docker.base_image = base_image;
    }
    if let Some(max) = cli.max_sandboxes {
        config.limits.max_sandboxes = Some(max);
    }
    if cli.no_sweep {
        config.docker.sweep_orphans_on_boot = false;
    }
    if cli.prune_images {
        config.docker.prune_images_on_sweep = true;
    }
    config.validate()?;

    let runtime = Arc::new(DockerRuntime::connect().context("Failed to connect to Docker")?);
    if !runtime.is_available().await {
        log::warn!("Docker daemon is not reachable; START requests will fail until it is");
    }
    if config.oracle.api_key.is_none() {
        log::warn!("No oracle API key configured; DISCOVER requests will fail");
    }

    let oracle = Arc::new(OpenAiOracle::from_settings(&config.oracle)?);
    let readme = Arc::new(GitHubReadmeSource::from_settings(&config.readme)?);
    let service = Arc::new(SandboxService::new(&config, oracle, readme, runtime));

    if config.docker.sweep_orphans_on_boot {
        service.sweep_orphans().await;
    }

    let server_config = ServerConfig::from_settings(&config.server)?;
    log::info!("Starting mcpbox server on {}...", server_config.bind_addr);
    let server = SandboxServer::with_config(service, server_config);

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    log::info!("mcpbox server shut down gracefully.");
    Ok(())
}

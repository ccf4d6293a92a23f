use anyhow::Context;
use clap::{Parser, Subcommand};
use cms_kernel::config::{self, CliOverrides, Config};
use cms_kernel::state::{Kernel, Stores};
use cms_kernel::store::FileStore;
use cms_kernel::{commands, logging, web};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cms-kernel")]
#[command(about = "Plugin kernel for the content-management backend", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Port to listen on, overriding the configuration
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Directory scanned for plugin manifests
    #[arg(long, value_name = "DIR", global = true)]
    plugins_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the kernel (default)
    Run,

    /// Validate configuration, store and plugin manifests, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = CliOverrides {
        port: args.port,
        plugins_dir: args.plugins_dir.clone(),
        debug: args.debug,
    };
    let config = overrides.apply(load_config(args.config.as_deref()).await?);

    let _guard = logging::init(&config.logging)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            commands::run_config_check(config).await?;
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let loaded = match path {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    };
    // Logging isn't initialized yet
    loaded.map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::Error::from(e)
    })
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting CMS kernel");
    info!("Store: {}", config.store.path.display());

    let store = Arc::new(FileStore::new(&config.store.path));
    let kernel = Kernel::bootstrap(config, Stores::shared(store))
        .await
        .context("Kernel bootstrap failed")?;

    let endpoints = kernel.start_plugins();
    let (pipeline, registration_errors) = web::build_pipeline(&kernel, &endpoints);
    for e in &registration_errors {
        warn!("Not registered: {}", e);
    }

    let refreshers = kernel.spawn_refreshers();

    let server = tokio::spawn(web::start_server(kernel.clone(), Arc::new(pipeline)));

    shutdown_signal().await;
    info!("Received shutdown signal");

    kernel.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Web server error: {}", e),
        Err(e) => error!("Web server task failed: {}", e),
    }
    for handle in refreshers {
        if let Err(e) = handle.await {
            error!("Refresh task failed: {}", e);
        }
    }

    info!("CMS kernel stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

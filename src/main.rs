use clap::Parser;
use servegate::config::Config;
use servegate::server::Gateway;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "servegate")]
#[command(about = "Host-name-aware reverse proxy that starts backends on demand")]
struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("servegate=info".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %args.config.display(), "Configuration loaded");

    // Relative serve_files paths and child processes resolve against workdir.
    if let Some(workdir) = &config.workdir {
        info!(workdir = %workdir.display(), "Changing directory");
        std::env::set_current_dir(workdir).map_err(|e| {
            error!(workdir = %workdir.display(), error = %e, "Failed to change to workdir");
            anyhow::anyhow!("changing to workdir {}: {}", workdir.display(), e)
        })?;
    }

    let gateway = Gateway::new(config)?;

    gateway.start().await.map_err(|e| {
        error!(error = %e, "Failed to autostart services");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.run(shutdown_rx).await {
                error!(error = %e, "Server error");
                std::process::exit(1);
            }
        })
    };

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    gateway.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}

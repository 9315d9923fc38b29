mod api;
mod config;
mod logging;

use anyhow::Context;
use clap::Parser;
use config::{default_config_toml, resolve_config_path, user_config_path, Settings};
use liblinkcheck::{FileStore, LinkService, Prober};
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lacd")]
#[command(about = "Link availability checker: queued DNS + HTTP reachability checks over HTTP", long_about = None)]
struct Args {
    /// Config file (default: ./config.toml, then the per-user config dir)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to --config (or the per-user path) and exit
    #[arg(long)]
    write_default_config: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", default_config_toml());
        return Ok(());
    }

    if args.write_default_config {
        let path = args
            .config
            .or_else(user_config_path)
            .context("could not determine config path")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, default_config_toml())
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Default config written to: {}", path.display());
        return Ok(());
    }

    let path = resolve_config_path(args.config)
        .context("no config file found; try --write-default-config")?;
    let settings = Settings::load(&path).context("invalid configuration")?;
    logging::init(&settings.log)?;
    info!(config = %path.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(settings))
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let store = FileStore::open(&settings.store_path)
        .await
        .context("failed to open link store")?;
    let prober = Prober::with_config(settings.probe.clone()).context("failed to build http client")?;
    let service = LinkService::start(
        prober,
        store,
        settings.fan_out.clone(),
        settings.queue.clone(),
    )
    .await;

    let stop = CancellationToken::new();
    let state = api::AppState::new(
        service.clone(),
        settings.api.password.clone(),
        stop.clone(),
        settings.queue.batch_timeout,
    );
    let app = api::router(state, &settings.api.base_path);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!(%addr, base_path = %settings.api.base_path, "web server started");

    // Drain the queue before the listener stops accepting, so waiting
    // callers still get their answer or a 503.
    let shutdown_timeout = settings.shutdown_timeout;
    let drained = async move {
        tokio::select! {
            _ = wait_for_signal() => info!("shutdown signal received"),
            _ = stop.cancelled() => {}
        }
        if let Err(e) = service.shutdown(shutdown_timeout).await {
            error!(error = %e, "queue shutdown incomplete");
        }
        info!("stopping web server");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(drained)
        .await
        .context("web server failed")?;

    info!("stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

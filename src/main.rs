//! tailwatch - Tailwind CSS watcher relay
//!
//! Runs the Tailwind CLI in watch mode next to a web project and relays its
//! output to connected browsers over WebSocket, so pages can swap in the
//! rebuilt stylesheet without a reload.

use clap::Parser as ClapParser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tailwatch::{
    api,
    config::{Config, ConfigError, Environment},
    connection::ConnectionRegistry,
    hub::BroadcastHub,
    shutdown::ShutdownCoordinator,
    supervisor::{Invocation, ProcessSupervisor, ProjectLayout, SupervisorError},
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the HTTP server may take to drain after the coordinator finishes.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// tailwatch - Tailwind CSS watcher relay
#[derive(ClapParser, Debug)]
#[command(name = "tailwatch", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file, relative to the content root
    #[arg(long, default_value = "tailwatch.toml")]
    config: PathBuf,

    /// Project directory holding the stylesheet sources and `wwwroot/`
    #[arg(long, default_value = ".")]
    content_root: PathBuf,

    /// Address to bind the HTTP/WebSocket server (overrides `[server] bind`)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Execution environment; selects whether the watcher runs
    #[arg(long, env = "TAILWATCH_ENV", value_enum, default_value_t = Environment::Development)]
    env: Environment,

    /// Program used to launch the Tailwind CLI (overrides `[server] runner`)
    #[arg(long)]
    runner: Option<String>,
}

#[derive(Error, Debug)]
pub enum TailwatchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), TailwatchError> {
    let cli = Cli::parse();
    init_tracing();
    run(cli).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tailwatch=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<(), TailwatchError> {
    let layout = ProjectLayout::resolve(&cli.content_root)?;
    let config_path = layout.content_root().join(&cli.config);
    let mut config = Config::load(&config_path)?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(runner) = cli.runner {
        config.server.runner = runner;
    }

    tracing::info!(
        content_root = %layout.content_root().display(),
        env = %cli.env,
        "tailwatch starting"
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    let registry = ConnectionRegistry::new();
    let hub = BroadcastHub::with_send_timeout(registry.clone(), config.server.send_timeout());
    let mut coordinator = ShutdownCoordinator::new(registry)
        .with_close_timeout(config.server.close_timeout());

    let mut state = api::AppState::new(
        hub.clone(),
        coordinator.token(),
        config.tailwindcss.artifact_name(),
    );

    if config.tailwindcss.enabled_for(cli.env) {
        let invocation = Invocation::tailwind(&config.server.runner, &config.tailwindcss, &layout);
        let supervisor = ProcessSupervisor::new(invocation, hub)
            .with_grace_period(config.server.grace_period());
        let handle = supervisor.start(coordinator.token().child_token())?;
        state = state.with_watcher(handle.subscribe_state());
        coordinator.set_supervisor(handle);
    } else {
        tracing::info!(env = %cli.env, "tailwind watcher skipped");
    }

    let app = api::router(
        state,
        api::RouterConfig {
            static_dir: Some(layout.output_dir()),
        },
    );

    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    serve_until_shutdown(wait_for_signal(), coordinator, http_handle, server_shutdown_tx).await?;

    tracing::info!("tailwatch exiting");
    Ok(())
}

/// Wait for `signal` (or the server dying), then run the coordinator and stop
/// the server. The coordinator runs on every path out of here.
async fn serve_until_shutdown<S>(
    signal: S,
    coordinator: ShutdownCoordinator,
    mut http_handle: JoinHandle<std::io::Result<()>>,
    server_shutdown_tx: oneshot::Sender<()>,
) -> Result<(), TailwatchError>
where
    S: Future<Output = Result<(), TailwatchError>>,
{
    tokio::select! {
        result = signal => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to install signal handlers");
                coordinator.shutdown().await;
                let _ = server_shutdown_tx.send(());
                return Err(e);
            }
        }
        result = &mut http_handle => {
            // The server stopped on its own; still release the watcher.
            tracing::error!("HTTP server exited unexpectedly");
            coordinator.shutdown().await;
            return Ok(result??);
        }
    }

    let report = coordinator.shutdown().await;
    tracing::info!(
        watcher = ?report.watcher,
        connections = report.connections_closed,
        "relay stopped"
    );

    let _ = server_shutdown_tx.send(());
    match tokio::time::timeout(SERVER_STOP_TIMEOUT, http_handle).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("HTTP server did not stop in time"),
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere).
async fn wait_for_signal() -> Result<(), TailwatchError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received Ctrl+C");
        Ok(())
    }
}

//! fleetd - control plane for fleets of telemetry collector agents.
//!
//! Startup wiring: load the YAML server configuration, open the registry,
//! build the resolver, start Git synchronization (when a remote is
//! configured), and serve two listeners: the admin HTTP API and the OpAMP
//! WebSocket endpoint. The Git commit-transition callback reloads the
//! configuration store and fans the change out to every live session.
//!
//! Shutdown: SIGINT/SIGTERM cancel the root token, which stops the sync
//! loop and both servers; draining is bounded by a deadline after which
//! the process exits anyway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fleetd_core::gitsync::GitSyncer;
use fleetd_core::registry::Registry;
use fleetd_core::registry::sqlite::SqliteRegistry;
use fleetd_core::resolve::{ConfigValidator, Resolver};
use fleetd_core::store::ConfigStore;

use fleetd_daemon::config::{LoggingSection, ServerConfig};
use fleetd_daemon::http::{self, AppState};
use fleetd_daemon::opamp::OpampServer;

/// Time allowed for in-flight work to drain before the process exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// fleetd - control plane for telemetry agent fleets
#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file
    #[arg(short, long, default_value = "fleetd.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args.config).context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!(
        http_addr = %config.server.http_addr,
        opamp_addr = %config.server.opamp_addr,
        git = config.git_enabled(),
        "starting fleetd"
    );

    if let Some(parent) = config.storage.sqlite.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let registry: Arc<dyn Registry> = Arc::new(
        SqliteRegistry::open(&config.storage.sqlite.path).context("failed to open registry")?,
    );

    let validator = config
        .validation
        .enabled
        .then(|| ConfigValidator::new(config.validation.strict_otel_schema));
    let resolver = Arc::new(Resolver::new(Arc::new(ConfigStore::new()), validator));
    let opamp = OpampServer::new(Arc::clone(&registry), Arc::clone(&resolver));

    let syncer = if config.git_enabled() {
        let syncer = GitSyncer::new(config.syncer_config());

        // Commit transitions reload the store, then fan out. Reload
        // strictly precedes the pushes.
        let callback_resolver = Arc::clone(&resolver);
        let callback_opamp = Arc::clone(&opamp);
        let local_path = config.git.local_path.clone();
        syncer.on_sync(Arc::new(move |commit| {
            let resolver = Arc::clone(&callback_resolver);
            let opamp = Arc::clone(&callback_opamp);
            let local_path = local_path.clone();
            tokio::spawn(async move {
                info!(commit = %commit, "reloading configuration after sync");
                if let Err(err) = resolver.reload(&local_path) {
                    error!(error = %err, "config reload failed, previous snapshot stays active");
                    return;
                }
                let notified = opamp.push_to_all().await;
                info!(notified, "configuration fan-out complete");
            });
        }));

        let commit = syncer.start().await.context("initial git sync failed")?;
        info!(commit = %commit, "git sync started");
        if let Err(err) = resolver.reload(&config.git.local_path) {
            warn!(error = %err, "initial config load failed");
        }
        Some(syncer)
    } else {
        info!(path = %config.git.local_path.display(), "no git remote, loading local configs");
        if let Err(err) = resolver.reload(&config.git.local_path) {
            warn!(error = %err, "local config load failed");
        }
        None
    };

    let shutdown = CancellationToken::new();

    let app_state = AppState {
        registry,
        resolver,
        syncer: syncer.clone(),
        opamp: Arc::clone(&opamp),
        webhook_secret: config.git.webhook_secret.clone(),
    };
    if app_state.webhook_secret.is_some() {
        info!(path = "/webhook/git", "git webhook endpoint enabled");
    }

    let admin_listener = TcpListener::bind(&config.server.http_addr)
        .await
        .with_context(|| format!("failed to bind admin api on {}", config.server.http_addr))?;
    let opamp_listener = TcpListener::bind(&config.server.opamp_addr)
        .await
        .with_context(|| format!("failed to bind agent endpoint on {}", config.server.opamp_addr))?;

    let admin_task = tokio::spawn(serve(
        admin_listener,
        http::router(app_state),
        shutdown.clone(),
        "admin api",
    ));
    let opamp_task = tokio::spawn(serve(
        opamp_listener,
        opamp.router(),
        shutdown.clone(),
        "agent endpoint",
    ));

    wait_for_shutdown_signal().await;
    info!("shutting down");

    shutdown.cancel();
    if let Some(syncer) = &syncer {
        syncer.stop();
    }

    let drain = async {
        let _ = admin_task.await;
        let _ = opamp_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!(deadline = ?SHUTDOWN_DEADLINE, "shutdown deadline exceeded, forcing exit");
    }
    info!("shutdown complete");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
    name: &'static str,
) {
    info!(addr = ?listener.local_addr().ok(), "{name} listening");
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;
    if let Err(err) = result {
        error!(error = %err, "{name} server error");
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "failed to register SIGINT handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

fn init_tracing(logging: &LoggingSection) {
    let filter =
        EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

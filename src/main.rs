use std::process::ExitCode;
use std::sync::Arc;

mod api;
mod cli;
mod config;
mod docker;
mod registry;
mod relay;
mod watcher;

use config::AgentConfig;
use relay::CoreClient;
use watcher::{DockerInspector, EventEnricher, EventFilter, EventWatcher};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = match AgentConfig::try_init() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Fail fast when the Docker daemon is unreachable; everything this
    // agent does goes through it.
    if let Err(e) = docker::get_docker().ping().await {
        log::error!("Docker daemon is not reachable: {e}");
        return ExitCode::FAILURE;
    }

    let sink = match CoreClient::new(&config.core, config.core_timeout()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("Unable to build core client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let watcher = EventWatcher::spawn(
        config.watcher.command.clone(),
        EventFilter::new(config.watcher.ignored_actions.clone()),
        EventEnricher::new(Arc::new(DockerInspector)),
        sink,
    );
    watcher.start().await;

    let state = Arc::new(api::AppState {
        watcher: watcher.clone(),
        auth: api::auth::AuthConfig {
            secret: config.agent.secret.clone(),
            replay_window: config.replay_window(),
        },
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Unable to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("Management API listening on {addr}");
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let serve_result = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
    watcher.shutdown().await;

    if let Err(e) = serve_result {
        log::error!("API server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("Unable to register the SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    log::info!("Shutdown signal received");
}

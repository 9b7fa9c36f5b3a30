use maxq_engine::{
    reconcile_on_startup, FlowExecutor, ProcessRegistry, RunController, Scheduler,
};
use maxq_server::api;
use maxq_server::config::ServerConfig;
use maxq_server::state::AppState;
use maxq_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!("Loaded configuration");

    // Open the store and apply migrations
    let store = Store::open(&config.data_dir)
        .await
        .expect("failed to open store");

    // Clear phantom state from a previous process before admitting traffic
    let summary = reconcile_on_startup(&store, Duration::from_millis(config.abort_grace_ms))
        .await
        .expect("startup reconciliation failed");
    if summary.runs_failed > 0 {
        tracing::warn!(
            runs_failed = summary.runs_failed,
            processes_killed = summary.processes_killed,
            "recovered from an unclean shutdown"
        );
    }

    let registry = ProcessRegistry::new();
    let flow = Arc::new(FlowExecutor::new(
        config.flows_root.clone(),
        config.api_base(),
        config.max_log_capture,
        registry.clone(),
    ));

    let controller = Arc::new(RunController::new(
        store.clone(),
        registry.clone(),
        flow.clone(),
        config.controller_config(),
    ));

    let scheduler = Scheduler::new(store.clone(), registry, flow, config.scheduler_config());
    let scheduler_handle = scheduler.start();

    let state = AppState::new(store.clone(), controller);
    let app = api::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("shutting down");
    scheduler_handle.stop().await;
    store.close().await;
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

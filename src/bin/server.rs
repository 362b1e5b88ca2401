//! Engine server binary: wires the database, scheduler, periodic drivers,
//! and the HTTP control surface together.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zoneforge::handlers;
use zoneforge::tasks::periodic;
use zoneforge::web;
use zoneforge::{database, EngineConfig, EngineResult, SystemContext, TaskEngine};

#[tokio::main]
async fn main() -> EngineResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::load()?;
    let bind_address = config.bind_address.clone();

    let pool = database::connect(&config.database_url).await?;
    database::migrate(&pool).await?;

    let context = SystemContext::new(pool, config)?;
    let registry = handlers::builtin_registry()?;

    let engine = TaskEngine::new(context.clone(), registry);
    let handle = engine.handle();

    // The scheduler performs the recovery sweep before its first claim;
    // drivers start after their own grace periods.
    let scheduler = tokio::spawn(engine.run());
    tokio::spawn(periodic::run_discovery_driver(handle.clone()));
    tokio::spawn(periodic::run_retention_driver(handle.clone()));

    let app = web::router(web::AppState::new(context, handle.clone()));
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    handle.shutdown();
    if let Err(e) = scheduler.await {
        error!(error = %e, "scheduler task join failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await
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

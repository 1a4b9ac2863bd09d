mod config;
mod handlers;
mod state;

use crate::config::MasterConfig;
use crate::state::AppState;
use anyhow::Context;
use common::Coordinator;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskdb_master=debug,axum=info,tower_http=info")),
        )
        .init();

    let cfg = MasterConfig::from_env()?;
    info!(
        "abriendo {} registros (backend={:?}, match={:?})",
        cfg.dirs.len(),
        cfg.store.backend,
        cfg.store.match_kind
    );
    let coordinator = Coordinator::open(&cfg.dirs, &cfg.store).context("abriendo registros")?;
    let state = AppState::new(coordinator, cfg.passwd.clone());

    // router HTTP
    let app = handlers::build_router(state.clone());

    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("master escuchando en {}", listener.local_addr()?);
    if cfg.passwd.is_some() {
        info!("api protegida con contraseña");
    }

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("servidor HTTP terminó con error: {}", e);
    }

    // reconciliación final de cada registro
    match state.coordinator.lock() {
        Ok(mut coord) => coord.close()?,
        Err(_) => error!("lock del coordinador envenenado, se omite clean final"),
    }
    info!("master detenido");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                error!("no se pudo instalar SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("señal de parada recibida");
}

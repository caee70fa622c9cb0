//! groundstation binary: wires the database, background loops and HTTP server.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use groundstation::config::{parse_args, Backend, Config};
use groundstation::db::{Database, MemoryDatabase, SqliteDatabase};
use groundstation::monitor::{LivenessMonitor, MonitorConfig, PingProber};
use groundstation::retention::{spawn_retention, RetentionConfig};
use groundstation::server::{self, AppState};
use groundstation::tunnel::Tunnel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args()) {
        Ok(a) => a,
        Err(msg) => {
            println!("{msg}");
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = Config::load(args.config.as_deref()).context("loading configuration")?;
    cfg.apply_env(|k| std::env::var(k).ok());
    let addr = cfg.bind_addr(args.port)?;

    let db: Arc<dyn Database> = match cfg.database.backend {
        Backend::Memory => {
            info!("using in-memory database");
            Arc::new(MemoryDatabase::new())
        }
        Backend::Sqlite => {
            info!(path = %cfg.database.path.display(), "opening sqlite database");
            Arc::new(
                SqliteDatabase::open(&cfg.database.path)
                    .await
                    .with_context(|| format!("opening {}", cfg.database.path.display()))?,
            )
        }
    };
    let tunnel = Arc::new(Tunnel::new(cfg.tunnel.clone()));
    let cancel = CancellationToken::new();

    let mut loops = vec![spawn_retention(
        db.clone(),
        RetentionConfig::from(&cfg.retention),
        cancel.clone(),
    )];
    if cfg.monitor.enabled {
        let prober = PingProber {
            count: cfg.monitor.ping_count,
            timeout: std::time::Duration::from_secs(cfg.monitor.ping_timeout_secs),
        };
        let monitor = LivenessMonitor::new(
            db.clone(),
            Arc::new(prober),
            tunnel.clone(),
            MonitorConfig::from(&cfg.monitor),
        );
        loops.push(monitor.spawn(cancel.clone()));
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let state = AppState {
        db,
        tunnel,
        admin_token: cfg.server.admin_token.clone(),
    };
    server::serve(listener, state, cancel.clone()).await?;

    cancel.cancel();
    for handle in loops {
        let _ = handle.await;
    }
    info!("groundstation stopped");
    Ok(())
}

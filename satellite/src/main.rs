//! satellite: reports heartbeats and GPU telemetry to a groundstation.

mod client;
mod config;
mod gpu;
mod procs;
mod types;

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::{Client, SubmitError};
use crate::config::{parse_args, SatelliteConfig};
use crate::gpu::GpuSampler;
use crate::types::{HeartbeatPayload, TelemetryPayload};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn send_heartbeat(client: &Client, hostname: &str) -> Result<(), SubmitError> {
    client
        .heartbeat(&HeartbeatPayload {
            hostname: hostname.to_string(),
            timestamp: Utc::now(),
        })
        .await
}

async fn send_stats(
    client: &Client,
    sampler: &mut GpuSampler,
    hostname: &str,
) -> Result<usize, SubmitError> {
    let (information, stats) = sampler.collect();
    let n = stats.len();
    client
        .submit(&TelemetryPayload {
            hostname: hostname.to_string(),
            information,
            stats,
        })
        .await?;
    Ok(n)
}

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

    let cfg = SatelliteConfig::load(&args.config)?;
    let hostname = cfg.hostname();
    let client = Client::new(&cfg.groundstation_url, REQUEST_TIMEOUT)
        .context("building http client")?;
    let mut sampler = GpuSampler::new();

    if args.once {
        send_heartbeat(&client, &hostname).await.context("heartbeat")?;
        let n = send_stats(&client, &mut sampler, &hostname)
            .await
            .context("telemetry")?;
        info!(gpus = n, "reported once");
        return Ok(());
    }

    info!(
        host = %hostname,
        url = %cfg.groundstation_url,
        "satellite started"
    );
    let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(cfg.stats_interval());
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Both intervals fire immediately; the heartbeat goes first so the
    // machine exists before its first telemetry arrives.
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = heartbeat.tick() => match send_heartbeat(&client, &hostname).await {
                Ok(()) => debug!("heartbeat sent"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            },
            _ = stats.tick() => match send_stats(&client, &mut sampler, &hostname).await {
                Ok(n) => debug!(gpus = n, "telemetry sent"),
                Err(e) => warn!(error = %e, "telemetry dropped"),
            },
        }
    }
    info!("satellite stopped");
    Ok(())
}

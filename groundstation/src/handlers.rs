//! Ingestion: maps satellite submissions onto database calls.

use crate::db::Database;
use crate::error::Result;
use crate::types::{HeartbeatPayload, TelemetryPayload};

pub async fn heartbeat(db: &dyn Database, payload: &HeartbeatPayload) -> Result<()> {
    db.update_last_seen(&payload.hostname, payload.timestamp).await
}

/// Registers every GPU context, then appends every sample. The first error
/// wins; anything already written stays written.
pub async fn submit_telemetry(db: &dyn Database, payload: &TelemetryPayload) -> Result<()> {
    for info in &payload.information {
        db.update_gpu_context(&payload.hostname, info).await?;
    }
    for sample in &payload.stats {
        db.append_data_point(sample).await?;
    }
    Ok(())
}

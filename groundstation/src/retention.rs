//! Background retention loop: downsample aging samples, then prune expired ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub interval: Duration,
    /// Samples older than this are averaged together per GPU.
    pub downsample_after: Duration,
    /// Samples older than this are deleted outright.
    pub delete_after: Duration,
}

/// `now - age`, or `None` if that is not representable.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

/// One retention pass. Returns how many samples were pruned.
pub async fn run_once(db: &dyn Database, cfg: &RetentionConfig, now: DateTime<Utc>) -> Result<u64> {
    if let Some(at) = cutoff(now, cfg.downsample_after) {
        db.downsample(at).await?;
    }
    match cutoff(now, cfg.delete_after) {
        Some(at) => db.prune(at).await,
        None => Ok(0),
    }
}

// A failed pass is logged and retried on the next tick; overrunning ticks are skipped.
pub fn spawn_retention(
    db: Arc<dyn Database>,
    cfg: RetentionConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?cfg.interval, "retention loop started");
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match run_once(db.as_ref(), &cfg, Utc::now()).await {
                Ok(pruned) => debug!(pruned, "retention pass complete"),
                Err(e) => error!(error = %e, "retention pass failed"),
            }
        }
        info!("retention loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::types::fixtures::{at, gt1030, sample};

    const DAY: u64 = 86_400;

    fn cfg() -> RetentionConfig {
        RetentionConfig {
            interval: Duration::from_millis(10),
            downsample_after: Duration::from_secs(7 * DAY),
            delete_after: Duration::from_secs(30 * DAY),
        }
    }

    async fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.update_last_seen("elk", at(0)).await.unwrap();
        db.update_gpu_context("elk", &gt1030("g1")).await.unwrap();
        db
    }

    #[tokio::test]
    async fn pass_downsamples_then_prunes() {
        let db = seeded().await;
        let now = at(100 * DAY as i64);
        for age_days in [60, 10, 9, 1] {
            let s = sample("g1", now - chrono::Duration::days(age_days));
            db.append_data_point(&s).await.unwrap();
        }
        // 60, 10 and 9 merge into one sample stamped 60 days ago, which prune drops
        let pruned = run_once(&db, &cfg(), now).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(db.prune(now + chrono::Duration::days(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pass_prunes_after_merge_window() {
        let db = seeded().await;
        let now = at(100 * DAY as i64);
        for age_days in [10, 9, 1] {
            let s = sample("g1", now - chrono::Duration::days(age_days));
            db.append_data_point(&s).await.unwrap();
        }
        assert_eq!(run_once(&db, &cfg(), now).await.unwrap(), 0);
        // merged + recent remain
        assert_eq!(db.prune(now + chrono::Duration::days(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unrepresentable_cutoff_is_skipped() {
        assert!(cutoff(at(0), Duration::from_secs(u64::MAX)).is_none());
        let db = seeded().await;
        let huge = RetentionConfig {
            interval: Duration::from_secs(1),
            downsample_after: Duration::from_secs(u64::MAX),
            delete_after: Duration::from_secs(u64::MAX),
        };
        assert_eq!(run_once(&db, &huge, at(0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let db: Arc<dyn Database> = Arc::new(seeded().await);
        let cancel = CancellationToken::new();
        let handle = spawn_retention(db, cfg(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();
    }
}

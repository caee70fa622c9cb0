//! Liveness monitor.
//!
//! Every tick reads last-seen times and pings each machine that has been
//! silent for longer than the death threshold. A host that answers the ping
//! has a running OS but a dead satellite, so the satellite is restarted over
//! the provisioning tunnel. A host that does not answer is left for a human.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::tunnel::TunnelError;

#[async_trait]
pub trait Prober: Send + Sync {
    /// True if `host` answered before the probe deadline.
    async fn probe(&self, host: &str) -> bool;
}

#[async_trait]
pub trait Recovery: Send + Sync {
    async fn restart(&self, host: &str) -> std::result::Result<(), TunnelError>;
}

/// ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProber {
    pub count: u32,
    pub timeout: Duration,
}

impl PingProber {
    fn deadline(&self) -> Duration {
        self.timeout * self.count.max(1) + Duration::from_secs(1)
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, host: &str) -> bool {
        if host.is_empty() || host.starts_with('-') {
            return false;
        }
        let wait = self.timeout.as_secs().max(1);
        let child = Command::new("ping")
            .arg("-c")
            .arg(self.count.max(1).to_string())
            .arg("-W")
            .arg(wait.to_string())
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(self.deadline(), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(host, error = %e, "failed to run ping");
                false
            }
            Err(_) => {
                debug!(host, "ping deadline exceeded");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Silence longer than this marks a machine as possibly dead.
    pub death_threshold: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub stale: Vec<String>,
    pub restarted: Vec<String>,
    pub unreachable: Vec<String>,
    pub failed: Vec<String>,
}

enum Outcome {
    Restarted,
    Unreachable,
    Failed,
}

pub struct LivenessMonitor {
    db: Arc<dyn Database>,
    prober: Arc<dyn Prober>,
    recovery: Arc<dyn Recovery>,
    cfg: MonitorConfig,
}

impl LivenessMonitor {
    pub fn new(
        db: Arc<dyn Database>,
        prober: Arc<dyn Prober>,
        recovery: Arc<dyn Recovery>,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            db,
            prober,
            recovery,
            cfg,
        }
    }

    async fn recover(&self, host: &str) -> Outcome {
        if !self.prober.probe(host).await {
            info!(host, "silent machine does not answer ping; leaving it alone");
            return Outcome::Unreachable;
        }
        info!(host, "machine answers ping but satellite is silent; restarting");
        match self.recovery.restart(host).await {
            Ok(()) => Outcome::Restarted,
            Err(e) => {
                warn!(host, error = %e, "satellite restart failed");
                Outcome::Failed
            }
        }
    }

    /// Inspect every machine once. Probes and restarts run concurrently.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let seen = self.db.last_seen().await?;
        let mut report = TickReport::default();
        let Ok(threshold) = chrono::Duration::from_std(self.cfg.death_threshold) else {
            return Ok(report);
        };
        report.stale = seen
            .into_iter()
            .filter(|m| now - m.last_seen > threshold)
            .map(|m| m.hostname)
            .collect();

        let outcomes = join_all(report.stale.iter().map(|host| self.recover(host))).await;
        for (host, outcome) in report.stale.iter().zip(outcomes) {
            let bucket = match outcome {
                Outcome::Restarted => &mut report.restarted,
                Outcome::Unreachable => &mut report.unreachable,
                Outcome::Failed => &mut report.failed,
            };
            bucket.push(host.clone());
        }
        Ok(report)
    }

    // A failed tick is logged and the loop carries on; the next tick retries.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval = ?self.cfg.interval,
                threshold = ?self.cfg.death_threshold,
                "liveness monitor started"
            );
            let mut ticker = tokio::time::interval(self.cfg.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.tick(Utc::now()).await {
                    Ok(report) if !report.stale.is_empty() => info!(
                        stale = report.stale.len(),
                        restarted = report.restarted.len(),
                        unreachable = report.unreachable.len(),
                        failed = report.failed.len(),
                        "liveness tick"
                    ),
                    Ok(_) => debug!("liveness tick: all machines reporting"),
                    Err(e) => error!(error = %e, "liveness tick failed"),
                }
            }
            info!("liveness monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDatabase, SqliteDatabase};
    use crate::tunnel::ShellError;
    use crate::types::fixtures::at;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    struct FakeProber {
        alive: HashSet<String>,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, host: &str) -> bool {
            self.alive.contains(host)
        }
    }

    #[derive(Default)]
    struct FakeRecovery {
        broken: HashSet<String>,
        restarted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Recovery for FakeRecovery {
        async fn restart(&self, host: &str) -> std::result::Result<(), TunnelError> {
            if self.broken.contains(host) {
                return Err(TunnelError::Step {
                    op: "restart",
                    host: host.to_string(),
                    step: "launch satellite",
                    source: ShellError::Remote {
                        command: "nohup".into(),
                        status: Some(255),
                        stderr: "connection refused".into(),
                    },
                });
            }
            self.restarted.lock().await.push(host.to_string());
            Ok(())
        }
    }

    fn set(hosts: &[&str]) -> HashSet<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    fn cfg() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(10),
            death_threshold: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn restarts_only_silent_hosts_that_answer_ping() {
        let db = MemoryDatabase::new();
        for host in ["fresh", "crashed", "offline", "stubborn"] {
            let t = if host == "fresh" { at(990) } else { at(100) };
            db.update_last_seen(host, t).await.unwrap();
        }
        let recovery = Arc::new(FakeRecovery {
            broken: set(&["stubborn"]),
            ..Default::default()
        });
        let monitor = LivenessMonitor::new(
            Arc::new(db),
            Arc::new(FakeProber {
                alive: set(&["fresh", "crashed", "stubborn"]),
            }),
            recovery.clone(),
            cfg(),
        );

        let report = monitor.tick(at(1_000)).await.unwrap();
        assert_eq!(report.stale, vec!["crashed", "offline", "stubborn"]);
        assert_eq!(report.restarted, vec!["crashed"]);
        assert_eq!(report.unreachable, vec!["offline"]);
        assert_eq!(report.failed, vec!["stubborn"]);
        assert_eq!(*recovery.restarted.lock().await, vec!["crashed".to_string()]);
    }

    #[tokio::test]
    async fn threshold_is_exclusive() {
        let db = MemoryDatabase::new();
        db.update_last_seen("edge", at(940)).await.unwrap();
        let monitor = LivenessMonitor::new(
            Arc::new(db),
            Arc::new(FakeProber { alive: set(&["edge"]) }),
            Arc::new(FakeRecovery::default()),
            cfg(),
        );
        assert!(monitor.tick(at(1_000)).await.unwrap().stale.is_empty());
        assert_eq!(monitor.tick(at(1_001)).await.unwrap().stale, vec!["edge"]);
    }

    #[tokio::test]
    async fn storage_failure_does_not_stop_the_loop() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.destroy().await.unwrap();
        let monitor = LivenessMonitor::new(
            Arc::new(db),
            Arc::new(FakeProber { alive: set(&[]) }),
            Arc::new(FakeRecovery::default()),
            cfg(),
        );
        assert!(monitor.tick(at(0)).await.is_err());

        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn ping_rejects_option_like_hosts() {
        let prober = PingProber {
            count: 1,
            timeout: Duration::from_secs(1),
        };
        assert!(!prober.probe("-f").await);
        assert!(!prober.probe("").await);
    }
}

//! Many satellites reporting at once must all be accepted.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use groundstation::db::{Database, MemoryDatabase, SqliteDatabase};
use groundstation::server::{serve, AppState};
use groundstation::tunnel::{Tunnel, TunnelConfig};
use groundstation::types::{HeartbeatPayload, MachineLastSeen};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn fire_heartbeats(db: Arc<dyn Database>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    let state = AppState {
        db,
        tunnel: Arc::new(Tunnel::new(TunnelConfig::default())),
        admin_token: None,
    };
    let server = tokio::spawn(serve(listener, state, cancel.clone()));

    let client = reqwest::Client::new();
    let hosts: Vec<String> = (0..100).map(|i| format!("ws{:02}", i % 37)).collect();
    let mut tasks = Vec::new();
    for host in hosts.clone() {
        let client = client.clone();
        let url = format!("{base}/api/heartbeat");
        tasks.push(tokio::spawn(async move {
            let hb = HeartbeatPayload {
                hostname: host,
                timestamp: Utc::now(),
            };
            client.post(url).json(&hb).send().await.map(|r| r.status())
        }));
    }
    for t in tasks {
        let status = t.await.unwrap().unwrap();
        assert!(status.is_success(), "heartbeat rejected: {status}");
    }

    let seen: Vec<MachineLastSeen> = client
        .get(format!("{base}/api/lastseen"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reported: BTreeSet<String> = seen.into_iter().map(|m| m.hostname).collect();
    let expected: BTreeSet<String> = hosts.into_iter().collect();
    assert_eq!(reported, expected);

    cancel.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_heartbeats_memory() {
    fire_heartbeats(Arc::new(MemoryDatabase::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_heartbeats_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteDatabase::open(dir.path().join("gs.db")).await.unwrap();
    fire_heartbeats(Arc::new(db)).await;
}

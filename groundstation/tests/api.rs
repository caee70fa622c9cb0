//! Ingestion and admin routes exercised over real HTTP.

use std::sync::Arc;

use chrono::Utc;
use groundstation::db::MemoryDatabase;
use groundstation::server::{serve, AppState};
use groundstation::tunnel::{Tunnel, TunnelConfig};
use groundstation::types::{GpuInfo, GpuStatSample, HeartbeatPayload, TelemetryPayload};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "let-me-in";

struct Server {
    base: String,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl Server {
    async fn start(admin_token: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = AppState {
            db: Arc::new(MemoryDatabase::new()),
            tunnel: Arc::new(Tunnel::new(TunnelConfig::default())),
            admin_token: admin_token.map(String::from),
        };
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, state, cancel.clone()));
        Self {
            base,
            cancel,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn admin(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http.request(method, self.url(path)).bearer_auth(TOKEN)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn telemetry(host: &str, uuid: &str) -> TelemetryPayload {
    TelemetryPayload {
        hostname: host.into(),
        information: vec![GpuInfo {
            uuid: uuid.into(),
            gpu_name: "GT1030".into(),
            gpu_brand: "NVidia".into(),
            driver_ver: "1.0".into(),
            memory_total: 4,
        }],
        stats: vec![GpuStatSample {
            uuid: uuid.into(),
            memory_util: 25.4,
            gpu_util: 63.5,
            memory_used: 1024,
            fan_speed: 0.0,
            gpu_temp: 50.0,
            memory_temp: 0.0,
            graphics_voltage: 0.0,
            power_draw: 30.0,
            graphics_clock: 1500,
            max_graphics_clock: 1900,
            memory_clock: 3000,
            max_memory_clock: 3500,
            time: Utc::now(),
            processes: vec![],
        }],
    }
}

#[tokio::test]
async fn satellite_reports_show_up_in_latest() {
    let srv = Server::start(Some(TOKEN)).await;
    let hb = HeartbeatPayload {
        hostname: "elk".into(),
        timestamp: Utc::now(),
    };
    let r = srv.http.post(srv.url("/api/heartbeat")).json(&hb).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    let r = srv
        .http
        .post(srv.url("/api/stats"))
        .json(&telemetry("elk", "g1"))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::OK);

    let groups: Value = srv
        .admin(reqwest::Method::GET, "/api/latest")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(groups[0]["name"], "Shared");
    let ws = &groups[0]["workstations"][0];
    assert_eq!(ws["name"], "elk");
    assert_eq!(ws["gpus"][0]["gpu_name"], "GT1030");
    assert_eq!(ws["gpus"][0]["gpu_util"], 63.5);
    assert_eq!(ws["gpus"][0]["in_use"], false);
    assert_eq!(ws["gpus"][0]["user"], "");
}

#[tokio::test]
async fn telemetry_for_unknown_machine_is_not_found() {
    let srv = Server::start(None).await;
    let r = srv
        .http
        .post(srv.url("/api/stats"))
        .json(&telemetry("ghost", "g9"))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
    let body: Value = r.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let srv = Server::start(Some(TOKEN)).await;
    let r = srv.http.get(srv.url("/api/lastseen")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::UNAUTHORIZED);
    let r = srv
        .http
        .get(srv.url("/api/lastseen"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::UNAUTHORIZED);
    let r = srv.admin(reqwest::Method::GET, "/api/lastseen").send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
}

#[tokio::test]
async fn machine_and_file_admin() {
    let srv = Server::start(Some(TOKEN)).await;
    let r = srv
        .admin(reqwest::Method::POST, "/api/machines")
        .json(&json!({ "hostname": "elk", "group": "Lab" }))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::CREATED);
    let r = srv
        .admin(reqwest::Method::PATCH, "/api/machines")
        .json(&json!({ "hostname": "elk", "cpu": "Ryzen 7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::OK);

    // "aGVsbG8=" is base64 for "hello"
    let r = srv
        .admin(reqwest::Method::POST, "/api/files")
        .json(&json!({
            "hostname": "elk",
            "filename": "notes.txt",
            "mime": "text/plain",
            "payload": "aGVsbG8=",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::CREATED);

    let listing: Value = srv
        .admin(reqwest::Method::GET, "/api/files/elk")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing, json!([{ "filename": "notes.txt", "mime": "text/plain" }]));

    let r = srv
        .admin(reqwest::Method::GET, "/api/files/elk/notes.txt")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    assert_eq!(r.headers()["content-type"], "text/plain");
    assert_eq!(r.bytes().await.unwrap().as_ref(), b"hello");

    let r = srv
        .admin(reqwest::Method::POST, "/api/files")
        .json(&json!({
            "hostname": "nobody",
            "filename": "a",
            "mime": "text/plain",
            "payload": "",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);

    let r = srv
        .admin(reqwest::Method::DELETE, "/api/machines")
        .json(&json!({ "hostname": "elk" }))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    let r = srv
        .admin(reqwest::Method::GET, "/api/files/elk/notes.txt")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn provisioning_without_credentials_is_a_bad_request() {
    let srv = Server::start(None).await;
    for path in ["/api/onboard", "/api/deboard", "/api/satellite/restart", "/api/satellite/stop"] {
        let r = srv
            .http
            .post(srv.url(path))
            .json(&json!({ "hostname": "elk" }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

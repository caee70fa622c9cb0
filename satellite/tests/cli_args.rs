//! CLI arg handling for the satellite binary.
use assert_cmd::Command;

#[test]
fn help_prints_usage() {
    let out = Command::new(env!("CARGO_BIN_EXE_satellite"))
        .arg("--help")
        .output()
        .expect("run satellite");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("--config"));
    assert!(text.contains("--once"));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::new(env!("CARGO_BIN_EXE_satellite"))
        .arg("-c")
        .arg(dir.path().join("satellite.toml"))
        .assert()
        .failure();
}

#[test]
fn once_against_an_unreachable_groundstation_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("satellite.toml");
    // port 9 (discard) on loopback is not expected to accept HTTP
    std::fs::write(
        &cfg,
        "hostname = \"elk\"\ngroundstation_url = \"http://127.0.0.1:9/\"\n",
    )
    .unwrap();
    Command::new(env!("CARGO_BIN_EXE_satellite"))
        .arg("--config")
        .arg(&cfg)
        .arg("--once")
        .env("SATELLITE_GPU", "0")
        .assert()
        .failure();
}

//! Groundstation configuration: one TOML file, environment overrides, and a
//! couple of command-line flags.
//!
//! Stored under the XDG config dir by default:
//! `$XDG_CONFIG_HOME/groundstation/config.toml` (fallback `~/.config/groundstation/config.toml`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::monitor::MonitorConfig;
use crate::retention::RetentionConfig;
use crate::tunnel::TunnelConfig;

const DAY: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("bad bind address {0:?}")]
    Bind(String),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub retention: RetentionSection,
    pub monitor: MonitorSection,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// When set, admin routes require `Authorization: Bearer <token>`.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: PathBuf::from("groundstation.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionSection {
    pub interval_secs: u64,
    pub downsample_after_secs: u64,
    pub delete_after_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            downsample_after_secs: 7 * DAY,
            delete_after_secs: 365 * DAY,
        }
    }
}

impl From<&RetentionSection> for RetentionConfig {
    fn from(s: &RetentionSection) -> Self {
        RetentionConfig {
            interval: Duration::from_secs(s.interval_secs.max(1)),
            downsample_after: Duration::from_secs(s.downsample_after_secs),
            delete_after: Duration::from_secs(s.delete_after_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub death_threshold_secs: u64,
    pub ping_count: u32,
    pub ping_timeout_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            death_threshold_secs: 300,
            ping_count: 1,
            ping_timeout_secs: 3,
        }
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(s: &MonitorSection) -> Self {
        MonitorConfig {
            interval: Duration::from_secs(s.interval_secs.max(1)),
            death_threshold: Duration::from_secs(s.death_threshold_secs),
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("groundstation")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("groundstation")
    }
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Config {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit` (which must exist), or the default path if present,
    /// or built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text, &path),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Apply `GROUNDSTATION_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("GROUNDSTATION_BIND") {
            self.server.bind = bind;
        }
        if let Some(token) = lookup("GROUNDSTATION_ADMIN_TOKEN") {
            self.server.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(db) = lookup("GROUNDSTATION_DATABASE") {
            if db == ":memory:" {
                self.database.backend = Backend::Memory;
            } else {
                self.database.backend = Backend::Sqlite;
                self.database.path = PathBuf::from(db);
            }
        }
    }

    pub fn bind_addr(&self, port: Option<u16>) -> Result<SocketAddr, ConfigError> {
        let mut addr: SocketAddr = self
            .server
            .bind
            .parse()
            .map_err(|_| ConfigError::Bind(self.server.bind.clone()))?;
        if let Some(p) = port {
            addr.set_port(p);
        }
        Ok(addr)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
}

/// `Err` carries the text to print (usage or a complaint about the arguments).
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "groundstation".into());
    let usage = format!("Usage: {prog} [--config PATH|-c PATH] [--port PORT|-p PORT]");
    let mut parsed = ParsedArgs::default();
    let parse_port = |v: Option<String>| -> Result<u16, String> {
        v.as_deref()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("Invalid port. {usage}"))
    };

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(usage.clone()),
            "--config" | "-c" => match it.next() {
                Some(p) => parsed.config = Some(PathBuf::from(p)),
                None => return Err(format!("Missing config path. {usage}")),
            },
            "--port" | "-p" => parsed.port = Some(parse_port(it.next())?),
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        parsed.config = Some(PathBuf::from(v));
                    }
                }
            }
            _ if arg.starts_with("--port=") => {
                parsed.port = Some(parse_port(arg.split_once('=').map(|(_, v)| v.to_string()))?);
            }
            _ => return Err(format!("Unexpected argument {arg:?}. {usage}")),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("groundstation")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = Config::from_toml("", Path::new("x.toml")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.database.backend, Backend::Sqlite);
        assert!(cfg.monitor.enabled);
    }

    #[test]
    fn sections_override_defaults_field_by_field() {
        let text = r#"
            [server]
            admin_token = "s3cret"

            [database]
            backend = "memory"

            [monitor]
            death_threshold_secs = 90
            ping_timeout_secs = 2

            [tunnel]
            login = "ops"
            port = 2222
        "#;
        let cfg = Config::from_toml(text, Path::new("x.toml")).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.server.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(cfg.database.backend, Backend::Memory);
        assert_eq!(cfg.monitor.death_threshold_secs, 90);
        assert_eq!(cfg.monitor.interval_secs, 60);
        assert_eq!(cfg.tunnel.login.as_deref(), Some("ops"));
        assert_eq!(cfg.tunnel.port, 2222);
        assert_eq!(cfg.tunnel.install_dir, "satellite-{login}");

        let m = MonitorConfig::from(&cfg.monitor);
        assert_eq!(m.death_threshold, Duration::from_secs(90));
    }

    #[test]
    fn malformed_file_names_its_path() {
        let err = Config::from_toml("[server", Path::new("/etc/gs.toml")).unwrap_err();
        assert!(err.to_string().contains("/etc/gs.toml"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));

        let present = dir.path().join("gs.toml");
        std::fs::write(&present, "[retention]\ninterval_secs = 5\n").unwrap();
        let cfg = Config::load(Some(&present)).unwrap();
        assert_eq!(RetentionConfig::from(&cfg.retention).interval, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GROUNDSTATION_BIND", "127.0.0.1:9000"),
            ("GROUNDSTATION_ADMIN_TOKEN", "tok"),
            ("GROUNDSTATION_DATABASE", ":memory:"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.server.admin_token.as_deref(), Some("tok"));
        assert_eq!(cfg.database.backend, Backend::Memory);

        cfg.apply_env(|k| (k == "GROUNDSTATION_DATABASE").then(|| "/var/lib/gs.db".into()));
        assert_eq!(cfg.database.backend, Backend::Sqlite);
        assert_eq!(cfg.database.path, PathBuf::from("/var/lib/gs.db"));
    }

    #[test]
    fn port_flag_replaces_bind_port() {
        let cfg = Config::default();
        assert_eq!(cfg.bind_addr(None).unwrap().port(), 8080);
        assert_eq!(cfg.bind_addr(Some(9001)).unwrap().port(), 9001);

        let mut bad = Config::default();
        bad.server.bind = "nowhere".into();
        assert!(matches!(bad.bind_addr(None), Err(ConfigError::Bind(_))));
    }

    #[test]
    fn args_long_short_and_assign() {
        assert_eq!(
            parse_args(args(&["--config", "/a.toml", "-p", "9002"])).unwrap(),
            ParsedArgs {
                config: Some("/a.toml".into()),
                port: Some(9002)
            }
        );
        assert_eq!(
            parse_args(args(&["-c", "/b.toml", "--port=9003"])).unwrap(),
            ParsedArgs {
                config: Some("/b.toml".into()),
                port: Some(9003)
            }
        );
        assert_eq!(parse_args(args(&[])).unwrap(), ParsedArgs::default());
        assert!(parse_args(args(&["--help"])).unwrap_err().starts_with("Usage:"));
        assert!(parse_args(args(&["--port", "http"])).is_err());
        assert!(parse_args(args(&["stray"])).is_err());
    }
}

//! Satellite settings. The groundstation writes `satellite.toml` next to the
//! binary when it onboards a machine; the same file can be written by hand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SatelliteConfig {
    /// Name reported to the groundstation; defaults to the OS hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    pub groundstation_url: Url,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stats")]
    pub stats_interval_secs: u64,
}

fn default_heartbeat() -> u64 {
    30
}
fn default_stats() -> u64 {
    60
}

impl SatelliteConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".into())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedArgs {
    pub config: PathBuf,
    pub once: bool,
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "satellite".into());
    let usage = format!("Usage: {prog} [--config PATH|-c PATH] [--once]");
    let mut config = PathBuf::from("satellite.toml");
    let mut once = false;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(usage),
            "--config" | "-c" => match it.next() {
                Some(p) => config = PathBuf::from(p),
                None => return Err(format!("Missing config path. {usage}")),
            },
            "--once" => once = true,
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    config = PathBuf::from(v);
                }
            }
            _ => return Err(format!("Unexpected argument {arg:?}. {usage}")),
        }
    }
    Ok(ParsedArgs { config, once })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_file_the_groundstation_writes() {
        let text = r#"
            hostname = "elk"
            groundstation_url = "http://ground:8080"
            heartbeat_interval_secs = 15
            stats_interval_secs = 45
        "#;
        let cfg = SatelliteConfig::parse(text).unwrap();
        assert_eq!(cfg.hostname(), "elk");
        assert_eq!(cfg.groundstation_url.as_str(), "http://ground:8080/");
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(cfg.stats_interval(), Duration::from_secs(45));
    }

    #[test]
    fn intervals_default_and_hostname_falls_back() {
        let cfg =
            SatelliteConfig::parse("groundstation_url = \"http://g\"\nhostname = \"\"").unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.stats_interval_secs, 60);
        assert!(!cfg.hostname().is_empty());
    }

    #[test]
    fn url_is_required() {
        assert!(SatelliteConfig::parse("hostname = \"elk\"").is_err());
        assert!(SatelliteConfig::parse("groundstation_url = \"not a url\"").is_err());
    }

    #[test]
    fn args() {
        let a = |v: &[&str]| {
            parse_args(std::iter::once("satellite").chain(v.iter().copied()).map(String::from))
        };
        assert_eq!(
            a(&[]).unwrap(),
            ParsedArgs {
                config: "satellite.toml".into(),
                once: false
            }
        );
        assert_eq!(
            a(&["-c", "/opt/s.toml", "--once"]).unwrap(),
            ParsedArgs {
                config: "/opt/s.toml".into(),
                once: true
            }
        );
        assert_eq!(a(&["--config=/x.toml"]).unwrap().config, PathBuf::from("/x.toml"));
        assert!(a(&["--help"]).unwrap_err().starts_with("Usage:"));
        assert!(a(&["--bogus"]).is_err());
    }
}

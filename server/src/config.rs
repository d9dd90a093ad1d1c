use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use jigboard_core::codec::WireFormat;
use serde::Deserialize;
use thiserror::Error;

use crate::service::{NamePolicy, ServiceOptions, DEFAULT_MAX_NAME_LEN};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:7777";
pub const DEFAULT_DISCOVERY_PORT: u16 = jigboard_core::discovery::DEFAULT_DISCOVERY_PORT;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Parser)]
#[command(name = "jigboard-server", version, about = "Shared jigsaw puzzle server")]
pub struct Args {
    /// TOML file with server settings; flags override it.
    #[arg(long, env = "JIGBOARD_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "JIGBOARD_LISTEN")]
    pub listen: Option<SocketAddr>,
    /// Call framing on every channel: json-lines or length-prefixed.
    #[arg(long, env = "JIGBOARD_WIRE")]
    pub wire: Option<WireFormat>,
    /// Do not accept calls on stdin/stdout.
    #[arg(long, env = "JIGBOARD_NO_STDIO")]
    pub no_stdio: bool,
    /// UDP port for discovery; 0 turns it off.
    #[arg(long, env = "JIGBOARD_DISCOVERY_PORT")]
    pub discovery_port: Option<u16>,
    /// Also broadcast the announcement every this many milliseconds; 0 turns it off.
    #[arg(long, env = "JIGBOARD_ANNOUNCE_EVERY_MS")]
    pub announce_every_ms: Option<u64>,
    /// Where periodic announcements go; the broadcast address on the discovery port by default.
    #[arg(long, env = "JIGBOARD_ANNOUNCE_TO")]
    pub announce_to: Option<SocketAddr>,
    #[arg(long, env = "JIGBOARD_SERVERNAME")]
    pub servername: Option<String>,
    /// Puzzle folder to load at startup.
    #[arg(long, env = "JIGBOARD_PUZZLE")]
    pub puzzle: Option<PathBuf>,
    #[arg(long, env = "JIGBOARD_LOG")]
    pub log: Option<String>,
    #[arg(long, env = "JIGBOARD_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    #[arg(long, value_enum, env = "JIGBOARD_NAME_POLICY")]
    pub name_policy: Option<NamePolicy>,
    #[arg(long, env = "JIGBOARD_MAX_NAME_LEN")]
    pub max_name_len: Option<usize>,
    #[arg(long, env = "JIGBOARD_SEED")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listen: SocketAddr,
    pub wire: WireFormat,
    pub stdio: bool,
    pub discovery_port: u16,
    pub announce_every_ms: u64,
    pub announce_to: Option<SocketAddr>,
    pub servername: String,
    pub puzzle: Option<PathBuf>,
    pub log: String,
    pub log_file: Option<PathBuf>,
    pub name_policy: NamePolicy,
    pub max_name_len: usize,
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7777)),
            wire: WireFormat::JsonLines,
            stdio: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_every_ms: 0,
            announce_to: None,
            servername: default_servername(),
            puzzle: None,
            log: DEFAULT_LOG_FILTER.to_string(),
            log_file: None,
            name_policy: NamePolicy::Any,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            seed: None,
        }
    }
}

fn default_servername() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "jigboard".to_string())
}

impl Settings {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// File (if any) first, then flags and environment on top.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let mut settings = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply(args);
        Ok(settings)
    }

    pub fn apply(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(wire) = args.wire {
            self.wire = wire;
        }
        if args.no_stdio {
            self.stdio = false;
        }
        if let Some(port) = args.discovery_port {
            self.discovery_port = port;
        }
        if let Some(every) = args.announce_every_ms {
            self.announce_every_ms = every;
        }
        if let Some(target) = args.announce_to {
            self.announce_to = Some(target);
        }
        if let Some(name) = &args.servername {
            self.servername = name.clone();
        }
        if let Some(puzzle) = &args.puzzle {
            self.puzzle = Some(puzzle.clone());
        }
        if let Some(log) = &args.log {
            self.log = log.clone();
        }
        if let Some(log_file) = &args.log_file {
            self.log_file = Some(log_file.clone());
        }
        if let Some(policy) = args.name_policy {
            self.name_policy = policy;
        }
        if let Some(max) = args.max_name_len {
            self.max_name_len = max;
        }
        if let Some(seed) = args.seed {
            self.seed = Some(seed);
        }
    }

    /// Interval and target of unsolicited announcements, if enabled.
    pub fn periodic_announcement(&self) -> Option<(Duration, SocketAddr)> {
        if self.announce_every_ms == 0 || self.discovery_port == 0 {
            return None;
        }
        let target = self
            .announce_to
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port)));
        Some((Duration::from_millis(self.announce_every_ms), target))
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            name_policy: self.name_policy,
            max_name_len: self.max_name_len,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.listen, DEFAULT_LISTEN.parse().unwrap());
        assert!(settings.stdio);
        assert_eq!(settings.discovery_port, 7778);
        assert_eq!(settings.max_name_len, 32);
        assert_eq!(settings.name_policy, NamePolicy::Any);
        assert_eq!(settings.wire, WireFormat::JsonLines);
    }

    #[test]
    fn flags_override_file() {
        let file = Settings::from_toml(
            r#"
listen = "127.0.0.1:9000"
discovery_port = 0
name_policy = "unique"
servername = "attic"
wire = "length-prefixed"
"#,
            Path::new("jigboard.toml"),
        )
        .unwrap();
        assert_eq!(file.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(file.name_policy, NamePolicy::Unique);
        assert_eq!(file.wire, WireFormat::LengthPrefixed);
        assert!(file.stdio);

        let args = Args::try_parse_from([
            "jigboard-server",
            "--no-stdio",
            "--servername",
            "den",
            "--max-name-len",
            "8",
            "--wire",
            "json-lines",
        ])
        .unwrap();
        let mut settings = file.clone();
        settings.apply(&args);
        assert!(!settings.stdio);
        assert_eq!(settings.servername, "den");
        assert_eq!(settings.max_name_len, 8);
        assert_eq!(settings.wire, WireFormat::JsonLines);
        assert_eq!(settings.discovery_port, 0);
    }

    #[test]
    fn periodic_announcements_are_opt_in() {
        let mut settings = Settings::default();
        assert_eq!(settings.periodic_announcement(), None);

        let args = Args::try_parse_from(["jigboard-server", "--announce-every-ms", "2000"]).unwrap();
        settings.apply(&args);
        assert_eq!(
            settings.periodic_announcement(),
            Some((Duration::from_secs(2), "255.255.255.255:7778".parse().unwrap()))
        );

        let file = Settings::from_toml(
            "announce_every_ms = 500\nannounce_to = \"192.168.1.255:9000\"\n",
            Path::new("jigboard.toml"),
        )
        .unwrap();
        assert_eq!(
            file.periodic_announcement(),
            Some((Duration::from_millis(500), "192.168.1.255:9000".parse().unwrap()))
        );

        settings.discovery_port = 0;
        assert_eq!(settings.periodic_announcement(), None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Settings::from_toml("colour = \"red\"", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

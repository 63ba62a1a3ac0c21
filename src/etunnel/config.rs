use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::etunnel::{
    acceptor::{AcceptorOptions, DEFAULT_BACKLOG},
    net,
    relay::{DEFAULT_CHUNK_SIZE, DEFAULT_ECHO_LIMIT, DEFAULT_POLL_INTERVAL, RelayOptions},
};

const CONFIG_CANDIDATES: [&str; 3] = ["etunnel.toml", "etunnel.yaml", "etunnel.yml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    Missing(&'static str),

    #[error("{flag}: expected address:port, got {value:?}")]
    BadEndpoint { flag: &'static str, value: String },

    #[error("{flag}: resolve {value:?}: {source}")]
    Resolve {
        flag: &'static str,
        value: String,
        #[source]
        source: std::io::Error,
    },

    #[error("-b: invalid bind address {0:?}")]
    BadBindAddress(String),

    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unsupported config extension {0:?} (expected .toml or .yaml/.yml)")]
    Extension(String),

    #[error("{key}: invalid duration {value:?}: {source}")]
    Duration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ConfigError {
    /// Errors that should be reported with the usage line.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ConfigError::Missing(_) | ConfigError::BadEndpoint { .. } | ConfigError::BadBindAddress(_)
        )
    }
}

/// Values given on the command line. Each one overrides the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub from: Option<String>,
    pub to: Option<String>,
    pub bind: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub bind_addr: Option<IpAddr>,
    pub backlog: u32,
    pub dial_timeout: Duration,
    pub chunk_size: usize,
    pub echo_limit: usize,
    pub poll_interval: Duration,
    pub debug: bool,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

impl Config {
    pub fn acceptor_options(&self) -> AcceptorOptions {
        AcceptorOptions {
            listen_addr: self.listen_addr,
            upstream_addr: self.upstream_addr,
            bind_addr: self.bind_addr,
            backlog: self.backlog,
            dial_timeout: self.dial_timeout,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            chunk_size: self.chunk_size,
            poll_interval: self.poll_interval,
            echo_limit: self.debug.then_some(self.echo_limit),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    from: Option<String>,
    to: Option<String>,
    bind: Option<String>,
    #[serde(default)]
    debug: bool,
    backlog: Option<u32>,
    dial_timeout: Option<String>,
    chunk_size: Option<usize>,
    echo_limit: Option<usize>,
    poll_interval: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Loads the config file (if any) and applies command-line overrides.
///
/// With no explicit path, `etunnel.toml`, `etunnel.yaml` and `etunnel.yml`
/// are tried in the working directory. Having none of them is fine.
pub fn load(explicit_path: Option<&Path>, overrides: &Overrides) -> Result<Config, ConfigError> {
    let path = match explicit_path {
        Some(p) => Some(p.to_path_buf()),
        None => discover_config_path(Path::new(".")),
    };

    let fc = match &path {
        Some(p) => load_file(p)?,
        None => FileConfig::default(),
    };

    Config::from_parts(fc, overrides)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext.as_str() {
        "toml" => toml::from_str(&data).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(&data).map_err(|e| parse_err(e.to_string())),
        _ => Err(ConfigError::Extension(ext)),
    }
}

fn endpoint(flag: &'static str, value: Option<String>) -> Result<SocketAddr, ConfigError> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(flag))?;

    let normalized = net::normalize_bind_addr(&value);
    if net::split_host_port(&normalized).is_none() {
        return Err(ConfigError::BadEndpoint { flag, value });
    }

    net::resolve_endpoint(&value).map_err(|source| ConfigError::Resolve {
        flag,
        value,
        source,
    })
}

fn duration(key: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => humantime::parse_duration(&v).map_err(|source| ConfigError::Duration {
            key,
            value: v,
            source,
        }),
    }
}

impl Config {
    fn from_parts(fc: FileConfig, cli: &Overrides) -> Result<Config, ConfigError> {
        let listen_addr = endpoint("-f", cli.from.clone().or(fc.from))?;
        let upstream_addr = endpoint("-t", cli.to.clone().or(fc.to))?;

        let bind_addr = match cli.bind.clone().or(fc.bind) {
            Some(b) if !b.trim().is_empty() => {
                Some(net::parse_bind_ip(&b).ok_or(ConfigError::BadBindAddress(b))?)
            }
            _ => None,
        };

        let debug = cli.debug || fc.debug;

        let mut cfg = Config {
            listen_addr,
            upstream_addr,
            bind_addr,
            backlog: fc.backlog.unwrap_or(DEFAULT_BACKLOG),
            dial_timeout: duration("dial_timeout", fc.dial_timeout, Duration::ZERO)?,
            chunk_size: fc.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            echo_limit: fc.echo_limit.unwrap_or(DEFAULT_ECHO_LIMIT),
            poll_interval: duration("poll_interval", fc.poll_interval, DEFAULT_POLL_INTERVAL)?,
            debug,
            logging: LoggingConfig::default(),
        };

        if cfg.backlog == 0 {
            return Err(ConfigError::Zero("backlog"));
        }
        if cfg.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk_size"));
        }
        if cfg.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }
        if debug {
            cfg.logging.level = "debug".into();
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "etunnel_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn cli(from: &str, to: &str) -> Overrides {
        Overrides {
            from: Some(from.into()),
            to: Some(to.into()),
            ..Default::default()
        }
    }

    #[test]
    fn cli_only_uses_defaults() {
        let cfg = Config::from_parts(FileConfig::default(), &cli("127.0.0.1:9000", "127.0.0.1:9001"))
            .expect("config");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.upstream_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(cfg.bind_addr, None);
        assert_eq!(cfg.backlog, 32);
        assert_eq!(cfg.chunk_size, 65536);
        assert_eq!(cfg.poll_interval, Duration::from_millis(1));
        assert!(!cfg.debug);
        assert_eq!(cfg.relay_options().echo_limit, None);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn missing_port_is_usage_error() {
        let err = Config::from_parts(FileConfig::default(), &cli("127.0.0.1", "127.0.0.1:9001"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BadEndpoint { flag: "-f", .. }));
        assert!(err.is_usage());

        let err = Config::from_parts(FileConfig::default(), &cli("127.0.0.1:9000", "127.0.0.1"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BadEndpoint { flag: "-t", .. }));
    }

    #[test]
    fn missing_destination_is_usage_error() {
        let o = Overrides {
            from: Some("127.0.0.1:9000".into()),
            ..Default::default()
        };
        let err = Config::from_parts(FileConfig::default(), &o).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("-t")));
        assert!(err.is_usage());
    }

    #[test]
    fn port_only_listen_means_all_interfaces() {
        let cfg = Config::from_parts(FileConfig::default(), &cli(":9000", "127.0.0.1:9001"))
            .expect("config");
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn bind_and_debug_flags() {
        let mut o = cli("127.0.0.1:9000", "127.0.0.1:9001");
        o.bind = Some("127.0.0.2".into());
        o.debug = true;
        let cfg = Config::from_parts(FileConfig::default(), &o).expect("config");
        assert_eq!(cfg.bind_addr, Some("127.0.0.2".parse().unwrap()));
        assert_eq!(cfg.relay_options().echo_limit, Some(1024));
        assert_eq!(cfg.logging.level, "debug");

        o.bind = Some("nope".into());
        let err = Config::from_parts(FileConfig::default(), &o).unwrap_err();
        assert!(matches!(err, ConfigError::BadBindAddress(_)));
    }

    #[test]
    fn toml_file_with_cli_override() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("etunnel.toml");

        let toml = r#"
from = "127.0.0.1:7000"
to = "127.0.0.1:7001"
backlog = 64
chunk_size = 4096
poll_interval = "10ms"
dial_timeout = "3s"

[logging]
level = "warn"
format = "json"
output = "stdout"
"#;
        std::fs::write(&cfg_path, toml).expect("write");

        let o = Overrides {
            to: Some("127.0.0.1:8001".into()),
            ..Default::default()
        };
        let cfg = load(Some(cfg_path.as_path()), &o).expect("load");
        assert_eq!(cfg.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(cfg.upstream_addr, "127.0.0.1:8001".parse().unwrap());
        assert_eq!(cfg.backlog, 64);
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.output, "stdout");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_file() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("etunnel.yaml");

        let yaml = r#"
from: ":7100"
to: "127.0.0.1:7101"
bind: "127.0.0.1"
debug: true
echo_limit: 16
"#;
        std::fs::write(&cfg_path, yaml).expect("write");

        let cfg = load(Some(cfg_path.as_path()), &Overrides::default()).expect("load");
        assert_eq!(cfg.listen_addr, "0.0.0.0:7100".parse().unwrap());
        assert_eq!(cfg.bind_addr, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(cfg.relay_options().echo_limit, Some(16));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("etunnel.toml");

        std::fs::write(&cfg_path, "from = \"127.0.0.1:1\"\nlisten = \"x\"\n").expect("write");
        let err = load(Some(cfg_path.as_path()), &Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("listen"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_values_rejected() {
        let dir = temp_dir("bad_values");

        let p = dir.join("a.toml");
        std::fs::write(&p, "poll_interval = \"soon\"\n").expect("write");
        let err = load(Some(p.as_path()), &cli("127.0.0.1:1", "127.0.0.1:2")).unwrap_err();
        assert!(matches!(err, ConfigError::Duration { key: "poll_interval", .. }));

        let p = dir.join("b.toml");
        std::fs::write(&p, "backlog = 0\n").expect("write");
        let err = load(Some(p.as_path()), &cli("127.0.0.1:1", "127.0.0.1:2")).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("backlog")));

        let p = dir.join("c.ini");
        std::fs::write(&p, "").expect("write");
        let err = load(Some(p.as_path()), &cli("127.0.0.1:1", "127.0.0.1:2")).unwrap_err();
        assert!(matches!(err, ConfigError::Extension(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn discovery_prefers_toml() {
        let dir = temp_dir("discover");
        assert_eq!(discover_config_path(&dir), None);

        std::fs::write(dir.join("etunnel.yml"), "").expect("write");
        assert_eq!(discover_config_path(&dir), Some(dir.join("etunnel.yml")));

        std::fs::write(dir.join("etunnel.toml"), "").expect("write");
        assert_eq!(discover_config_path(&dir), Some(dir.join("etunnel.toml")));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Relay configuration.
//!
//! Loaded from YAML (default `~/.simrelay/config.yaml`). Every field has a
//! default, so an empty file or a missing default file yields a usable
//! configuration.
//!
//! ```yaml
//! worker:
//!   program: python3
//!   args: ["-u", "Main.py"]
//!   working_dir: /srv/simulation
//! bus:
//!   url: mqtt://localhost:1883
//!   results_topic: simulation/results
//! artifact:
//!   path: /srv/simulation/data/data.json
//! http:
//!   bind: 0.0.0.0:3001
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::logging::simrelay_home;

/// Default results topic.
pub const DEFAULT_RESULTS_TOPIC: &str = "simulation/results";

/// Default control topic.
pub const DEFAULT_CONTROL_TOPIC: &str = "simulation/control";

/// Default topic for control acknowledgements.
pub const DEFAULT_ACK_TOPIC: &str = "simulation/control/ack";

/// Port assumed when `bus.url` does not name one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default bus ring capacity, shared by all subscribers.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Default upper bound on a single worker output line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// How to launch the worker
    pub worker: WorkerConfig,

    /// Publish/subscribe settings
    pub bus: BusConfig,

    /// Optional final result artifact
    pub artifact: ArtifactConfig,

    /// HTTP adapter settings
    pub http: HttpConfig,
}

/// Worker process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable to run
    pub program: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory (defaults to the relay's own)
    pub working_dir: Option<PathBuf>,

    /// Additional environment variables
    pub env: BTreeMap<String, String>,

    /// How long to wait for stdout to drain after the worker exits
    pub drain_timeout_ms: u64,

    /// Longest accepted output line; longer lines are discarded
    pub max_line_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), "Main.py".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            drain_timeout_ms: 5_000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl WorkerConfig {
    /// Create a worker config for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the stdout drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Stdout drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Publish/subscribe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// External MQTT broker (`mqtt://host[:port]`); in-process bus when unset
    pub url: Option<String>,

    /// Ring buffer capacity shared by all subscribers
    pub capacity: usize,

    /// Topic fragments are published on
    pub results_topic: String,

    /// Topic carrying start/stop commands
    pub control_topic: String,

    /// Topic control acknowledgements are published on
    pub ack_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            capacity: DEFAULT_BUS_CAPACITY,
            results_topic: DEFAULT_RESULTS_TOPIC.to_string(),
            control_topic: DEFAULT_CONTROL_TOPIC.to_string(),
            ack_topic: DEFAULT_ACK_TOPIC.to_string(),
        }
    }
}

impl BusConfig {
    /// Host and port of the external broker, if one is configured.
    pub fn broker_endpoint(&self) -> Result<Option<(String, u16)>> {
        let Some(url) = self.url.as_deref() else {
            return Ok(None);
        };
        let invalid = |reason: &str| {
            RelayError::config_validation(format!("bus.url '{url}' {reason}"))
        };

        let rest = url
            .strip_prefix("mqtt://")
            .or_else(|| url.strip_prefix("tcp://"))
            .ok_or_else(|| invalid("must start with mqtt:// or tcp://"))?;
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.contains('/') || authority.contains('@') {
            return Err(invalid("must be of the form mqtt://host[:port]"));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("has an invalid port"))?;
                (host, port)
            }
            None => (authority, DEFAULT_MQTT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("has no host"));
        }
        Ok(Some((host.to_string(), port)))
    }
}

/// Final result artifact configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// File the worker writes its final result to, if any
    pub path: Option<PathBuf>,

    /// Delay after exit before the artifact is read
    pub settle_delay_ms: u64,

    /// Upper bound on the artifact read
    pub read_timeout_ms: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: None,
            settle_delay_ms: 500,
            read_timeout_ms: 2_000,
        }
    }
}

impl ArtifactConfig {
    /// Create an artifact config for the given path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Settle delay as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// HTTP adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to listen on
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_string(),
        }
    }
}

impl HttpConfig {
    /// Parse the bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind.parse().map_err(|e| {
            RelayError::config_validation(format!("http.bind '{}' is not a socket address: {e}", self.bind))
        })
    }
}

impl RelayConfig {
    /// Default configuration file path (`~/.simrelay/config.yaml`).
    pub fn default_path() -> Result<PathBuf> {
        Ok(simrelay_home()?.join("config.yaml"))
    }

    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RelayError::config_not_found_with_source(path, e)
            } else {
                RelayError::io("reading configuration", path, e)
            }
        })?;

        let config = Self::from_yaml(&contents).map_err(|e| match e {
            RelayError::ConfigInvalid { message, .. } => RelayError::ConfigInvalid {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load from an explicit path, or from the default path if it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::default_path()?;
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    debug!("no configuration file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(contents).map_err(|e| RelayError::ConfigInvalid {
                path: PathBuf::new(),
                message: e.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the relay cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.program.trim().is_empty() {
            return Err(RelayError::config_validation("worker.program must not be empty"));
        }
        if self.worker.max_line_bytes == 0 {
            return Err(RelayError::config_validation("worker.max_line_bytes must be positive"));
        }
        if self.bus.capacity == 0 {
            return Err(RelayError::config_validation("bus.capacity must be positive"));
        }

        for (field, topic) in [
            ("bus.results_topic", &self.bus.results_topic),
            ("bus.control_topic", &self.bus.control_topic),
            ("bus.ack_topic", &self.bus.ack_topic),
        ] {
            if topic.is_empty() {
                return Err(RelayError::config_validation(format!("{field} must not be empty")));
            }
            if topic.contains(|c| c == '+' || c == '#') {
                return Err(RelayError::config_validation(format!(
                    "{field} '{topic}' must not contain wildcards"
                )));
            }
        }

        self.bus.broker_endpoint()?;
        self.http.bind_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_python_worker() {
        let config = RelayConfig::default();
        assert_eq!(config.worker.program, "python3");
        assert_eq!(config.worker.args, vec!["-u", "Main.py"]);
        assert_eq!(config.bus.results_topic, "simulation/results");
        assert_eq!(config.http.bind, "0.0.0.0:3001");
        assert!(config.artifact.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = RelayConfig::from_yaml("").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
worker:
  program: ./sim
  args: ["--fast"]
artifact:
  path: /tmp/data.json
  settle_delay_ms: 10
"#;
        let config = RelayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.worker.program, "./sim");
        assert_eq!(config.worker.args, vec!["--fast"]);
        assert_eq!(config.worker.drain_timeout_ms, 5_000);
        assert_eq!(config.artifact.path, Some(PathBuf::from("/tmp/data.json")));
        assert_eq!(config.artifact.settle_delay(), Duration::from_millis(10));
        assert_eq!(config.artifact.read_timeout_ms, 2_000);
        assert_eq!(config.bus.capacity, DEFAULT_BUS_CAPACITY);
    }

    #[test]
    fn test_validation_rejects_empty_program() {
        let err = RelayConfig::from_yaml("worker:\n  program: \"\"\n").unwrap_err();
        assert!(matches!(err, RelayError::ConfigValidation { .. }));
    }

    #[test]
    fn test_validation_rejects_wildcard_topic() {
        let err = RelayConfig::from_yaml("bus:\n  results_topic: simulation/#\n").unwrap_err();
        assert!(err.to_string().contains("wildcards"));
    }

    #[test]
    fn test_broker_endpoint() {
        let config = RelayConfig::from_yaml("bus:\n  url: mqtt://broker.local:1884\n").unwrap();
        assert_eq!(
            config.bus.broker_endpoint().unwrap(),
            Some(("broker.local".to_string(), 1884))
        );

        let config = RelayConfig::from_yaml("bus:\n  url: tcp://10.0.0.5/\n").unwrap();
        assert_eq!(
            config.bus.broker_endpoint().unwrap(),
            Some(("10.0.0.5".to_string(), DEFAULT_MQTT_PORT))
        );

        assert_eq!(RelayConfig::default().bus.broker_endpoint().unwrap(), None);
    }

    #[test]
    fn test_validation_rejects_bad_broker_url() {
        for url in [
            "http://broker:1883",
            "mqtt://",
            "mqtt://broker:port",
            "mqtt://broker:70000",
            "mqtt://user@broker",
            "mqtt://broker/extra",
        ] {
            let err = RelayConfig::from_yaml(&format!("bus:\n  url: \"{url}\"\n")).unwrap_err();
            assert!(
                matches!(err, RelayError::ConfigValidation { .. }),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_validation_rejects_bad_bind() {
        let err = RelayConfig::from_yaml("http:\n  bind: not-an-address\n").unwrap_err();
        assert!(matches!(err, RelayError::ConfigValidation { .. }));
    }

    #[test]
    fn test_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "worker: [unclosed").unwrap();

        let err = RelayConfig::load(file.path()).unwrap_err();
        match err {
            RelayError::ConfigInvalid { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = RelayConfig::load(Path::new("/nonexistent/simrelay.yaml")).unwrap_err();
        assert!(matches!(err, RelayError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "bus:\n  capacity: 8").unwrap();

        let config = RelayConfig::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.bus.capacity, 8);
    }

    #[test]
    fn test_worker_config_builder() {
        let worker = WorkerConfig::new("sh")
            .with_arg("-c")
            .with_arg("cat")
            .with_working_dir("/tmp")
            .with_env("SIM_MODE", "fast")
            .with_drain_timeout(Duration::from_millis(250));

        assert_eq!(worker.args, vec!["-c", "cat"]);
        assert_eq!(worker.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(worker.env.get("SIM_MODE").map(String::as_str), Some("fast"));
        assert_eq!(worker.drain_timeout(), Duration::from_millis(250));
    }
}

//! Bridge configuration.
//!
//! Defaults match a Node worker project driven through npm. Every field can
//! be overridden from the environment with [`BridgeConfig::from_env`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::bridge::protocol::DEFAULT_FILE_NAME;

pub const ENV_WORKER_DIR: &str = "LINTBRIDGE_WORKER_DIR";
pub const ENV_INSTALL_CMD: &str = "LINTBRIDGE_INSTALL_CMD";
pub const ENV_WORKER_CMD: &str = "LINTBRIDGE_WORKER_CMD";
pub const ENV_FILE_NAME: &str = "LINTBRIDGE_FILE_NAME";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "LINTBRIDGE_HANDSHAKE_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "LINTBRIDGE_REQUEST_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "LINTBRIDGE_POLL_INTERVAL_MS";
pub const ENV_MAX_FRAME_BYTES: &str = "LINTBRIDGE_MAX_FRAME_BYTES";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a command line on whitespace. No quoting; returns `None` if blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Working directory of the worker and location of the polling files.
    pub worker_dir: PathBuf,
    /// `None` skips dependency installation.
    pub install_command: Option<CommandSpec>,
    pub worker_command: CommandSpec,
    /// File name sent with every lint request.
    pub file_name: String,
    pub handshake_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_dir: PathBuf::from("."),
            install_command: Some(CommandSpec::new("npm").arg("install")),
            worker_command: CommandSpec::new("npm").arg("run").arg("start"),
            file_name: DEFAULT_FILE_NAME.to_string(),
            handshake_timeout: None,
            request_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker_dir = dir.into();
        self
    }

    pub fn with_install_command(mut self, command: Option<CommandSpec>) -> Self {
        self.install_command = command;
        self
    }

    pub fn with_worker_command(mut self, command: CommandSpec) -> Self {
        self.worker_command = command;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Defaults overridden by `LINTBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_WORKER_DIR).filter(|d| !d.trim().is_empty()) {
            config.worker_dir = PathBuf::from(dir);
        }
        if let Some(line) = lookup(ENV_INSTALL_CMD) {
            config.install_command = CommandSpec::parse(&line);
        }
        if let Some(line) = lookup(ENV_WORKER_CMD) {
            config.worker_command =
                CommandSpec::parse(&line).ok_or(ConfigError::Empty { key: ENV_WORKER_CMD })?;
        }
        if let Some(name) = lookup(ENV_FILE_NAME) {
            if name.trim().is_empty() {
                return Err(ConfigError::Empty { key: ENV_FILE_NAME });
            }
            config.file_name = name;
        }
        if let Some(ms) = parse_number(&lookup, ENV_HANDSHAKE_TIMEOUT_MS)? {
            config.handshake_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_number(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_number(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_number(&lookup, ENV_MAX_FRAME_BYTES)? {
            config.max_frame_bytes = usize::try_from(bytes).map_err(|_| ConfigError::InvalidNumber {
                key: ENV_MAX_FRAME_BYTES,
                value: bytes.to_string(),
            })?;
        }

        Ok(config)
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

//! Connection configuration.
//!
//! Values come from defaults, then whatever the host deserialises (YAML in
//! the `tandem` binary), then environment variables:
//!
//! - `TANDEM_CONNECTION_NAME`
//! - `TANDEM_MAX_MESSAGE_SIZE`
//! - `TANDEM_REQUEST_TIMEOUT_MS`
//! - `TANDEM_COPY_BUFFER_SIZE`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tandem_protocol::DEFAULT_MAX_MESSAGE_SIZE;
use thiserror::Error;

/// Default diagnostic name.
pub const DEFAULT_NAME: &str = "tandem";

/// Default buffer size used when copying outbound bodies.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 81920;

/// Smallest accepted copy buffer.
pub const MIN_COPY_BUFFER_SIZE: usize = 1024;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Diagnostic label used in logs.
    pub name: String,
    /// Largest frame payload accepted or produced, in bytes.
    pub max_message_size: usize,
    /// Deadline applied to every call; 0 disables it.
    pub request_timeout_ms: u64,
    /// Buffer size for copying outbound bodies onto the stream.
    pub copy_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout_ms: 0,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_copy_buffer_size(mut self, size: usize) -> Self {
        self.copy_buffer_size = size.max(MIN_COPY_BUFFER_SIZE);
        self
    }

    /// Deadline for each call, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Applies `TANDEM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("TANDEM_CONNECTION_NAME") {
            if !name.is_empty() {
                self.name = name;
            }
        }

        if let Some(size) = lookup("TANDEM_MAX_MESSAGE_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.max_message_size = bytes;
            }
        }

        if let Some(timeout) = lookup("TANDEM_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Some(size) = lookup("TANDEM_COPY_BUFFER_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.copy_buffer_size = bytes;
            }
        }
    }

    /// Checks the values a connection cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size > i32::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "max_message_size {} exceeds the frame header limit of {}",
                self.max_message_size,
                i32::MAX
            )));
        }
        if self.copy_buffer_size < MIN_COPY_BUFFER_SIZE {
            return Err(ConfigError::Validation(format!(
                "copy_buffer_size must be at least {MIN_COPY_BUFFER_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

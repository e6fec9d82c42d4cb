//! Client configuration.
//!
//! Configuration can be built in code or loaded from a TOML file. Every
//! field has a default, so a file only needs the values it changes.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a chatsync client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Application key sent with every connect request.
    #[serde(default)]
    pub api_key: String,
    /// Realtime endpoint URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Active instances own the connection. Passive instances (e.g. an
    /// app extension) only read the store and refuse to connect.
    #[serde(default = "default_active_mode")]
    pub active_mode: bool,
    /// Upper bound on waiting for a session id (default: wait forever).
    #[serde(default)]
    pub session_id_timeout_ms: Option<u64>,
    /// Messages per page (default: 25).
    #[serde(default = "default_message_page_size")]
    pub message_page_size: usize,
    /// Capacity of observer broadcast channels (default: 256).
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Minimum gap between two missing-event syncs (default: 6 seconds).
    #[serde(default = "default_sync_cooldown_secs")]
    pub sync_cooldown_secs: u64,
    /// Let channel lists without a membership predicate react to events.
    #[serde(default = "default_automatic_filtering")]
    pub automatic_filtering: bool,
}

// Default value functions
fn default_base_url() -> String {
    "wss://chat.example.invalid".to_string()
}

fn default_active_mode() -> bool {
    true
}

fn default_message_page_size() -> usize {
    25
}

fn default_event_buffer() -> usize {
    256
}

fn default_sync_cooldown_secs() -> u64 {
    6
}

fn default_automatic_filtering() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            active_mode: default_active_mode(),
            session_id_timeout_ms: None,
            message_page_size: default_message_page_size(),
            event_buffer: default_event_buffer(),
            sync_cooldown_secs: default_sync_cooldown_secs(),
            automatic_filtering: default_automatic_filtering(),
        }
    }
}

impl ClientConfig {
    /// Configuration for `api_key` with defaults for everything else.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: None,
            source: e,
        })
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source: e,
        })
    }

    /// Set the realtime endpoint URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Switch between active and passive mode.
    pub fn with_active_mode(mut self, active: bool) -> Self {
        self.active_mode = active;
        self
    }

    /// Bound session-id waiters.
    pub fn with_session_id_timeout(mut self, timeout: Duration) -> Self {
        self.session_id_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the message page size.
    pub fn with_message_page_size(mut self, size: usize) -> Self {
        self.message_page_size = size;
        self
    }

    /// Set the minimum gap between missing-event syncs.
    pub fn with_sync_cooldown(mut self, cooldown: Duration) -> Self {
        self.sync_cooldown_secs = cooldown.as_secs();
        self
    }

    /// Enable or disable automatic filtering of channel lists.
    pub fn with_automatic_filtering(mut self, enabled: bool) -> Self {
        self.automatic_filtering = enabled;
        self
    }

    /// Session-id waiter timeout.
    pub fn session_id_timeout(&self) -> Option<Duration> {
        self.session_id_timeout_ms.map(Duration::from_millis)
    }

    /// Missing-event sync cooldown.
    pub fn sync_cooldown(&self) -> Duration {
        Duration::from_secs(self.sync_cooldown_secs)
    }

    /// Broadcast capacity, never zero.
    pub(crate) fn event_capacity(&self) -> usize {
        self.event_buffer.max(1)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config{}: {source}", .path.as_ref().map(|p| format!(" file {}", p.display())).unwrap_or_default())]
    Parse {
        /// Path to the configuration file, if loaded from one.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(config.active_mode);
        assert_eq!(config.message_page_size, 25);
        assert_eq!(config.sync_cooldown(), Duration::from_secs(6));
        assert_eq!(config.session_id_timeout(), None);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = ClientConfig::from_toml_str(
            r#"
            api_key = "key-123"
            active_mode = false
            session_id_timeout_ms = 1500
            automatic_filtering = false
            "#,
        )
        .unwrap();
        assert_eq!(config.api_key, "key-123");
        assert!(!config.active_mode);
        assert_eq!(config.session_id_timeout(), Some(Duration::from_millis(1500)));
        assert!(!config.automatic_filtering);
        assert_eq!(config.message_page_size, 25);
    }

    #[test]
    fn invalid_toml_is_reported() {
        let err = ClientConfig::from_toml_str("message_page_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: None, .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = \"from-file\"").unwrap();
        writeln!(file, "message_page_size = 10").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.api_key, "from-file");
        assert_eq!(config.message_page_size, 10);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = ClientConfig::load(Path::new("/nonexistent/chatsync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn builders_override_defaults() {
        let config = ClientConfig::new("k")
            .with_active_mode(false)
            .with_session_id_timeout(Duration::from_secs(2))
            .with_sync_cooldown(Duration::from_secs(30));
        assert!(!config.active_mode);
        assert_eq!(config.session_id_timeout_ms, Some(2000));
        assert_eq!(config.sync_cooldown_secs, 30);
    }
}

//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/log-relay/relay.toml`.
//!
//! Every field has a default, and a missing config file is not an error:
//! the relay runs on defaults alone. A present file must carry
//! `schema_version = 1`.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: u32,
    pub socket: SocketConfig,
    pub queue: QueueConfig,
    pub sender: SenderConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub path: String,
    /// When true, the supervisor treats removal of the socket file as fatal.
    pub check_exists: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub num_workers: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub name: String,
    pub collections: CollectionsConfig,
}

/// Target collection per event kind.
#[derive(Debug, Clone)]
pub struct CollectionsConfig {
    pub messages: String,
    pub scope_starts: String,
    pub scope_ends: String,
    pub qa_traces: String,
    pub threads: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            schema_version: 1,
            socket: SocketConfig {
                path: "/tmp/rtbh-log-relay.socket".to_owned(),
                check_exists: true,
            },
            queue: QueueConfig {
                sqlite_path: "/tmp/rtbh-log-relay.db".to_owned(),
            },
            sender: SenderConfig { num_workers: 8 },
            database: DatabaseConfig {
                url: "http://arango-central-db.example:9966".to_owned(),
                name: "logging".to_owned(),
                collections: CollectionsConfig {
                    messages: "messages".to_owned(),
                    scope_starts: "scope_starts".to_owned(),
                    scope_ends: "scope_ends".to_owned(),
                    qa_traces: "qa_traces".to_owned(),
                    threads: "threads".to_owned(),
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    socket: Option<RawSocketConfig>,
    queue: Option<RawQueueConfig>,
    sender: Option<RawSenderConfig>,
    database: Option<RawDatabaseConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSocketConfig {
    path: Option<String>,
    check_exists: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawQueueConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSenderConfig {
    num_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    url: Option<String>,
    name: Option<String>,
    collections: Option<RawCollectionsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCollectionsConfig {
    messages: Option<String>,
    scope_starts: Option<String>,
    scope_ends: Option<String>,
    qa_traces: Option<String>,
    threads: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from the default path `/etc/log-relay/relay.toml`.
///
/// A missing file yields the built-in defaults.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/log-relay/relay.toml"))
}

/// Load relay config from a custom path; defaults when the file is absent.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = RelayConfig::default();

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let socket = match raw.socket {
        Some(s) => SocketConfig {
            path: s.path.unwrap_or(defaults.socket.path),
            check_exists: s.check_exists.unwrap_or(defaults.socket.check_exists),
        },
        None => defaults.socket,
    };

    let queue = match raw.queue {
        Some(q) => QueueConfig {
            sqlite_path: q.sqlite_path.unwrap_or(defaults.queue.sqlite_path),
        },
        None => defaults.queue,
    };

    let sender = match raw.sender {
        Some(s) => SenderConfig {
            num_workers: s.num_workers.unwrap_or(defaults.sender.num_workers),
        },
        None => defaults.sender,
    };
    if sender.num_workers == 0 {
        return Err(ConfigError::InvalidValue(
            "sender.num_workers must be at least 1".to_owned(),
        ));
    }

    let database = match raw.database {
        Some(d) => {
            let default_collections = defaults.database.collections;
            let collections = match d.collections {
                Some(c) => CollectionsConfig {
                    messages: c.messages.unwrap_or(default_collections.messages),
                    scope_starts: c.scope_starts.unwrap_or(default_collections.scope_starts),
                    scope_ends: c.scope_ends.unwrap_or(default_collections.scope_ends),
                    qa_traces: c.qa_traces.unwrap_or(default_collections.qa_traces),
                    threads: c.threads.unwrap_or(default_collections.threads),
                },
                None => default_collections,
            };
            DatabaseConfig {
                url: d.url.unwrap_or(defaults.database.url),
                name: d.name.unwrap_or(defaults.database.name),
                collections,
            }
        }
        None => defaults.database,
    };

    Ok(RelayConfig {
        schema_version,
        socket,
        queue,
        sender,
        database,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

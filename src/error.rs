//! Error types for the lock and port registry operations.

use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;

use crate::model::Port;

/// Main error type for portlock operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors from the file-based semaphore.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock is already held{}{}", holder_suffix(.holder_pid), tag_suffix(.holder_tag))]
    AlreadyLocked {
        holder_pid: Option<u32>,
        holder_tag: Option<String>,
    },

    #[error("Lock is not held")]
    NotLocked,

    #[error("Lock is held by PID {holder_pid}; use --force to release anyway")]
    PermissionDenied { holder_pid: u32 },

    #[error("Timed out after {waited_ms} ms waiting for lock")]
    Timeout { waited_ms: u64 },

    #[error("Refusing unsafe lock path {path}: contains '..' or NUL")]
    PathTraversal { path: PathBuf },

    #[error("Failed to parse lock file: {reason}")]
    Parse { reason: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the shared port registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry holds {size} entries; allocating {requested} more would exceed the limit of {limit}")]
    RegistryFull {
        size: usize,
        requested: usize,
        limit: usize,
    },

    #[error("Invalid port count {count}: must be between 1 and {max}")]
    InvalidCount { count: usize, max: usize },

    #[error("Port {port} is registered to PID {owner_pid}, not this process")]
    NotPortOwner { port: Port, owner_pid: u32 },

    #[error("Port {port} is not registered")]
    PortNotRegistered { port: Port },

    #[error("No available port found in range {start}-{end}")]
    NoAvailablePorts { start: u16, end: u16 },

    #[error("Invalid port range: start ({start}) must not exceed end ({end})")]
    InvalidPortRange { start: u16, end: u16 },
}

fn tag_suffix(tag: &Option<String>) -> String {
    match tag {
        Some(t) => format!(" (tag: {t})"),
        None => String::new(),
    }
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(p) => format!(" by PID {p}"),
        None => String::new(),
    }
}

impl Error {
    /// Stable machine-readable error kind, used as `type` in JSON output.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Lock(e) => e.error_type(),
            Error::Registry(e) => e.error_type(),
            Error::Io(_) | Error::Serialize(_) => "io_error",
        }
    }

    /// JSON object reported on stdout when a command fails with `--json`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        fields.insert("status".into(), json!("failed"));
        fields.insert("type".into(), json!(self.error_type()));
        fields.insert("message".into(), json!(self.to_string()));
        match self {
            Error::Lock(LockError::AlreadyLocked {
                holder_pid,
                holder_tag,
            }) => {
                if let Some(pid) = holder_pid {
                    fields.insert("holder_pid".into(), json!(pid));
                }
                if let Some(tag) = holder_tag {
                    fields.insert("holder_tag".into(), json!(tag));
                }
            }
            Error::Lock(LockError::PermissionDenied { holder_pid }) => {
                fields.insert("holder_pid".into(), json!(holder_pid));
            }
            Error::Lock(LockError::Timeout { waited_ms }) => {
                fields.insert("waited_ms".into(), json!(waited_ms));
            }
            Error::Registry(RegistryError::NotPortOwner { port, owner_pid }) => {
                fields.insert("port".into(), json!(port.as_u16()));
                fields.insert("owner_pid".into(), json!(owner_pid));
            }
            Error::Registry(RegistryError::PortNotRegistered { port }) => {
                fields.insert("port".into(), json!(port.as_u16()));
            }
            _ => {}
        }
        serde_json::Value::Object(fields)
    }
}

impl LockError {
    pub fn error_type(&self) -> &'static str {
        match self {
            LockError::AlreadyLocked { .. } => "already_locked",
            LockError::NotLocked => "not_locked",
            LockError::PermissionDenied { .. } => "permission_denied",
            LockError::Timeout { .. } => "timeout",
            LockError::PathTraversal { .. } => "path_traversal",
            LockError::Parse { .. } => "parse_error",
            LockError::Read { .. } | LockError::Write { .. } | LockError::Remove { .. } => {
                "io_error"
            }
        }
    }
}

impl RegistryError {
    pub fn error_type(&self) -> &'static str {
        match self {
            RegistryError::RegistryFull { .. } => "registry_full",
            RegistryError::InvalidCount { .. } => "invalid_count",
            RegistryError::NotPortOwner { .. } => "not_port_owner",
            RegistryError::PortNotRegistered { .. } => "port_not_registered",
            RegistryError::NoAvailablePorts { .. } => "no_available_ports",
            RegistryError::InvalidPortRange { .. } => "invalid_port",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Data model for the port registry.
//!
//! The registry file is a single versioned record: a format version and
//! an ordered sequence of port entries. It is stored as TOML so that it
//! stays human-inspectable in the registry directory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Current registry format version. Files with any other version are
/// treated as empty and repaired by the next write.
pub const REGISTRY_VERSION: u32 = 1;

/// A validated TCP port number (1-65535).
///
/// The newtype guarantees validity at construction time, so invalid
/// ports cannot propagate into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(u16);

/// Error returned when attempting to create an invalid port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPortError {
    /// The invalid port value that was attempted.
    pub value: u16,
}

impl fmt::Display for InvalidPortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid port number: {} (must be 1-65535)", self.value)
    }
}

impl std::error::Error for InvalidPortError {}

impl Port {
    /// Creates a new `Port`, rejecting the reserved port 0.
    pub fn new(value: u16) -> Result<Self, InvalidPortError> {
        if value == 0 {
            Err(InvalidPortError { value })
        } else {
            Ok(Port(value))
        }
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Port {
    type Error = InvalidPortError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Port::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl FromStr for Port {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u16 = s
            .parse()
            .map_err(|_| format!("invalid port format: '{s}'"))?;
        Port::new(value).map_err(|e| e.to_string())
    }
}

impl Serialize for Port {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        Port::new(value).map_err(serde::de::Error::custom)
    }
}

/// One allocated port: the number, its owning PID, the allocation time
/// in epoch milliseconds, and an optional sanitized tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: Port,
    pub pid: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl PortEntry {
    /// Stale when the owner is dead *or* the entry is older than
    /// `stale_timeout_ms`. Unlike lock staleness this is an `or`: a
    /// registry entry is only a reservation, so an expired reservation
    /// is reclaimable even if some process with that PID exists.
    pub fn is_stale(&self, now_ms: u64, stale_timeout_ms: u64) -> bool {
        !crate::process::is_process_running(self.pid)
            || now_ms.saturating_sub(self.timestamp) > stale_timeout_ms
    }

    pub fn is_owned_by_current_process(&self) -> bool {
        self.pid == std::process::id()
    }
}

/// The persisted registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<PortEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            entries: Vec::new(),
        }
    }
}

impl RegistryFile {
    pub fn find_entry(&self, port: Port) -> Option<&PortEntry> {
        self.entries.iter().find(|e| e.port == port)
    }
}

//! On-disk lock record and its line-oriented codec.
//!
//! The lock file format is interoperability-critical: other
//! implementations of this tool family read and write the same files.
//! One `key=value` pair per line, Unix newlines on write; readers accept
//! DOS endings, blank lines, lines without `=`, and unknown keys.

use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::LockError;

/// Contents of a lock file: the holder's PID, the acquisition time in
/// epoch seconds, and an optional sanitized tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub pid: u32,
    pub timestamp: u64,
    pub tag: Option<String>,
}

impl LockRecord {
    /// Builds a record for the current process at the current time.
    ///
    /// The tag must already be sanitized (see
    /// [`crate::path_guard::sanitize_tag`]); this type does not sanitize.
    pub fn for_current_process(tag: Option<String>) -> Self {
        Self {
            pid: process::id(),
            timestamp: now_epoch_secs(),
            tag,
        }
    }

    /// Serializes to the wire format with Unix newlines.
    pub fn serialize(&self) -> String {
        let mut content = format!("pid={}\ntimestamp={}\n", self.pid, self.timestamp);
        if let Some(ref tag) = self.tag {
            content.push_str("tag=");
            content.push_str(tag);
            content.push('\n');
        }
        content
    }

    /// Parses lock file contents.
    ///
    /// Fails only when `pid` or `timestamp` is missing or not a
    /// non-negative integer. Everything else is tolerated: trailing
    /// whitespace, `\r\n` endings, blank lines, lines without `=`, and
    /// unknown keys (forward compatibility).
    pub fn parse(content: &str) -> Result<Self, LockError> {
        let mut pid = None;
        let mut timestamp = None;
        let mut tag = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "pid" => pid = Some(parse_field("pid", value)?),
                "timestamp" => timestamp = Some(parse_field("timestamp", value)?),
                "tag" => tag = Some(value.to_string()),
                _ => {}
            }
        }

        let pid = pid.ok_or_else(|| LockError::Parse {
            reason: "missing pid".to_string(),
        })?;
        let timestamp = timestamp.ok_or_else(|| LockError::Parse {
            reason: "missing timestamp".to_string(),
        })?;

        Ok(Self {
            pid: u32::try_from(pid).map_err(|_| LockError::Parse {
                reason: format!("pid {pid} out of range"),
            })?,
            timestamp,
            tag,
        })
    }

    /// A lock is stale when its holder is not running on this host *and*
    /// it is older than `stale_timeout_secs`. Requiring both sides
    /// guards against PID reuse: a recycled PID alone cannot keep a dead
    /// process's lock alive forever, and a young lock from a process we
    /// cannot observe is left untouched.
    pub fn is_stale(&self, stale_timeout_secs: u64) -> bool {
        if crate::process::is_process_running(self.pid) {
            return false;
        }
        now_epoch_secs().saturating_sub(self.timestamp) > stale_timeout_secs
    }

    /// Whether this record was written by the current process.
    pub fn is_owned_by_current_process(&self) -> bool {
        self.pid == process::id()
    }
}

fn parse_field(key: &str, value: &str) -> Result<u64, LockError> {
    value.trim().parse::<u64>().map_err(|_| LockError::Parse {
        reason: format!("{key} is not a non-negative integer: {value:?}"),
    })
}

/// Seconds since the Unix epoch.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch (registry entry timestamps).
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_basic() {
        let record = LockRecord {
            pid: 12345,
            timestamp: 1700000000,
            tag: None,
        };
        assert_eq!(record.serialize(), "pid=12345\ntimestamp=1700000000\n");
    }

    #[test]
    fn test_serialize_with_tag() {
        let record = LockRecord {
            pid: 12345,
            timestamp: 1700000000,
            tag: Some("deploy".to_string()),
        };
        assert_eq!(
            record.serialize(),
            "pid=12345\ntimestamp=1700000000\ntag=deploy\n"
        );
    }

    #[test]
    fn test_serialize_uses_unix_newlines_only() {
        let record = LockRecord {
            pid: 1,
            timestamp: 2,
            tag: Some("t".to_string()),
        };
        assert!(!record.serialize().contains('\r'));
    }

    #[test]
    fn test_roundtrip() {
        let record = LockRecord {
            pid: 999,
            timestamp: 1700000123,
            tag: Some("ci-build".to_string()),
        };
        assert_eq!(LockRecord::parse(&record.serialize()).unwrap(), record);
    }

    #[test]
    fn test_roundtrip_without_tag() {
        let record = LockRecord {
            pid: 1,
            timestamp: 0,
            tag: None,
        };
        assert_eq!(LockRecord::parse(&record.serialize()).unwrap(), record);
    }

    #[test]
    fn test_parse_dos_line_endings() {
        let record = LockRecord::parse("pid=7\r\ntimestamp=42\r\ntag=win\r\n").unwrap();
        assert_eq!(record.pid, 7);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.tag, Some("win".to_string()));
    }

    #[test]
    fn test_parse_blank_lines_and_whitespace() {
        let record = LockRecord::parse("\n  pid=7  \n\n  timestamp=42  \n\n").unwrap();
        assert_eq!(record.pid, 7);
        assert_eq!(record.timestamp, 42);
    }

    #[test]
    fn test_parse_skips_lines_without_equals() {
        let record = LockRecord::parse("garbage line\npid=7\ntimestamp=42\n").unwrap();
        assert_eq!(record.pid, 7);
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let record =
            LockRecord::parse("pid=7\ntimestamp=42\nhostname=devbox\nfuture=stuff\n").unwrap();
        assert_eq!(record.pid, 7);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.tag, None);
    }

    #[test]
    fn test_parse_missing_pid_fails() {
        let result = LockRecord::parse("timestamp=42\n");
        assert!(matches!(result, Err(LockError::Parse { .. })));
    }

    #[test]
    fn test_parse_missing_timestamp_fails() {
        let result = LockRecord::parse("pid=7\n");
        assert!(matches!(result, Err(LockError::Parse { .. })));
    }

    #[test]
    fn test_parse_negative_pid_fails() {
        let result = LockRecord::parse("pid=-5\ntimestamp=42\n");
        assert!(matches!(result, Err(LockError::Parse { .. })));
    }

    #[test]
    fn test_parse_non_numeric_timestamp_fails() {
        let result = LockRecord::parse("pid=7\ntimestamp=soon\n");
        assert!(matches!(result, Err(LockError::Parse { .. })));
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(LockRecord::parse("").is_err());
    }

    #[test]
    fn test_tag_preserves_equals_signs() {
        let record = LockRecord::parse("pid=7\ntimestamp=42\ntag=a=b=c\n").unwrap();
        assert_eq!(record.tag, Some("a=b=c".to_string()));
    }

    #[test]
    fn test_stale_requires_age() {
        // Held by a PID that is certainly not running, but freshly
        // stamped: not stale yet.
        let record = LockRecord {
            pid: 4_294_000_000,
            timestamp: now_epoch_secs(),
            tag: None,
        };
        assert!(!record.is_stale(3600));
    }

    #[test]
    fn test_stale_requires_dead_holder() {
        // Our own PID with an ancient timestamp: old, but alive.
        let record = LockRecord {
            pid: process::id(),
            timestamp: 0,
            tag: None,
        };
        assert!(!record.is_stale(3600));
    }

    #[test]
    fn test_stale_when_dead_and_old() {
        let record = LockRecord {
            pid: 4_294_000_000,
            timestamp: 0,
            tag: None,
        };
        assert!(record.is_stale(3600));
    }

    #[test]
    fn test_owned_by_current_process() {
        let record = LockRecord::for_current_process(None);
        assert!(record.is_owned_by_current_process());
        assert!(record.timestamp > 0);
    }
}

//! Output formatting and display utilities.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use serde_json::json;

use crate::lock_file::{now_epoch_millis, LockRecord};
use crate::model::PortEntry;
use crate::registry::RegistryStatus;
use crate::semaphore::LockStatus;

/// JSON shape of an acquired or inspected lock record.
pub fn lock_record_json(record: &LockRecord) -> serde_json::Value {
    let mut value = json!({
        "pid": record.pid,
        "timestamp": record.timestamp,
    });
    if let Some(ref tag) = record.tag {
        value["tag"] = json!(tag);
    }
    value
}

/// Prints the state of a lock in human form.
pub fn display_lock_status(status: &LockStatus) {
    if !status.locked {
        println!("Lock is free.");
        return;
    }

    match &status.record {
        Some(record) => {
            let owner = if status.owned_by_current_process {
                " (this process)"
            } else {
                ""
            };
            println!("Locked by PID {}{owner}", record.pid);
            println!("Acquired at: {} (epoch seconds)", record.timestamp);
            if let Some(ref tag) = record.tag {
                println!("Tag: {tag}");
            }
            println!("Stale: {}", if status.is_stale { "yes" } else { "no" });
        }
        None => println!("Locked, but the lock file is unreadable."),
    }
}

pub fn display_lock_status_json(status: &LockStatus) {
    let mut value = json!({
        "locked": status.locked,
        "stale": status.is_stale,
        "owned_by_current_process": status.owned_by_current_process,
    });
    if let Some(ref record) = status.record {
        value["holder"] = lock_record_json(record);
    }
    println!("{value}");
}

/// Prints the registry entries table.
pub fn display_entries(entries: &[PortEntry], stale_timeout_ms: u64) {
    if entries.is_empty() {
        println!("No ports registered.");
        return;
    }

    let now = now_epoch_millis();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["PORT", "PID", "STATUS", "AGE", "TAG"]);

    for entry in entries {
        let status_cell = if entry.is_stale(now, stale_timeout_ms) {
            Cell::new("STALE").fg(Color::DarkGrey)
        } else {
            Cell::new("ACTIVE").fg(Color::Green)
        };

        table.add_row(vec![
            Cell::new(entry.port),
            Cell::new(entry.pid),
            status_cell,
            Cell::new(format_age(now.saturating_sub(entry.timestamp))),
            Cell::new(entry.tag.as_deref().unwrap_or("---")),
        ]);
    }

    println!("{table}");
}

pub fn display_entries_json(entries: &[PortEntry]) {
    let values: Vec<_> = entries.iter().map(entry_json).collect();
    println!("{}", serde_json::Value::Array(values));
}

pub fn entry_json(entry: &PortEntry) -> serde_json::Value {
    let mut value = json!({
        "port": entry.port.as_u16(),
        "pid": entry.pid,
        "timestamp": entry.timestamp,
    });
    if let Some(ref tag) = entry.tag {
        value["tag"] = json!(tag);
    }
    value
}

/// Prints registry counters.
pub fn display_registry_status(status: &RegistryStatus) {
    println!("Total entries: {}", status.total_entries);
    println!("Active: {}", status.active_entries);
    println!("Stale: {}", status.stale_entries);
    println!("Owned by this process: {}", status.owned_by_current_process);
    println!(
        "Port range: {}-{}",
        status.port_range.0, status.port_range.1
    );
}

pub fn display_registry_status_json(status: &RegistryStatus) {
    println!(
        "{}",
        json!({
            "total_entries": status.total_entries,
            "active_entries": status.active_entries,
            "stale_entries": status.stale_entries,
            "owned_by_current_process": status.owned_by_current_process,
            "min_port": status.port_range.0,
            "max_port": status.port_range.1,
        })
    );
}

/// Formats a millisecond age compactly: `42s`, `5m`, `3h`, `2d`.
fn format_age(age_ms: u64) -> String {
    let secs = age_ms / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Port;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59_999), "59s");
        assert_eq!(format_age(60_000), "1m");
        assert_eq!(format_age(3_599_000), "59m");
        assert_eq!(format_age(7_200_000), "2h");
        assert_eq!(format_age(172_800_000), "2d");
    }

    #[test]
    fn test_lock_record_json_omits_missing_tag() {
        let record = LockRecord {
            pid: 1,
            timestamp: 2,
            tag: None,
        };
        let value = lock_record_json(&record);
        assert_eq!(value["pid"], 1);
        assert!(value.get("tag").is_none());
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = PortEntry {
            port: Port::new(50000).unwrap(),
            pid: 7,
            timestamp: 123,
            tag: Some("svc".to_string()),
        };
        let value = entry_json(&entry);
        assert_eq!(value["port"], 50000);
        assert_eq!(value["pid"], 7);
        assert_eq!(value["timestamp"], 123);
        assert_eq!(value["tag"], "svc");
    }
}

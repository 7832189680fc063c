//! Shared port-allocation registry.
//!
//! Every operation runs inside a critical section: the registry's own
//! semaphore is acquired on entry and released on all exit paths via the
//! RAII guard. The registry file's rename is the linearization point for
//! each mutation, so a crash mid-batch leaves the previous image intact.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::lock_file::now_epoch_millis;
use crate::model::{Port, PortEntry, RegistryFile};
use crate::path_guard::sanitize_tag;
use crate::probe::is_port_available;
use crate::semaphore::{Semaphore, SemaphoreConfig, SemaphoreGuard};
use crate::store::RegistryStore;

/// How long a registry operation waits for the registry lock. Kept
/// short so contention is reported rather than hanging callers.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Random probes attempted before falling back to a sequential scan.
const RANDOM_SEARCH_ATTEMPTS: u32 = 100;

/// Registry behavior knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Inclusive allocation range bounds.
    pub min_port: u16,
    pub max_port: u16,
    /// When false, `min_port` is floored to 1024.
    pub allow_privileged: bool,
    /// Cap on the batch size of a single `get_multiple`.
    pub max_ports_per_request: usize,
    /// Hard cap on total registry entries.
    pub max_registry_size: usize,
    /// Age past which a non-live entry is reclaimable.
    pub stale_timeout: Duration,
    /// Directory holding the registry file and its lock.
    pub registry_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_port: 49152,
            max_port: 65535,
            allow_privileged: false,
            max_ports_per_request: 100,
            max_registry_size: 1000,
            stale_timeout: Duration::from_secs(3600),
            registry_dir: default_registry_dir(),
        }
    }
}

/// Per-user default registry directory.
pub fn default_registry_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".portlock"))
        .unwrap_or_else(|| PathBuf::from(".portlock"))
}

/// Snapshot reported by `status`, computed under the registry lock.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub total_entries: usize,
    pub active_entries: usize,
    pub stale_entries: usize,
    pub owned_by_current_process: usize,
    pub port_range: (u16, u16),
}

/// The shared port registry.
#[derive(Debug)]
pub struct PortRegistry {
    config: RegistryConfig,
    store: RegistryStore,
}

impl PortRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let store = RegistryStore::new(&config.registry_dir);
        Self { config, store }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocates a single port. Convenience over `get_multiple(1, tag)`.
    pub fn get(&self, tag: Option<&str>) -> Result<PortEntry> {
        let mut allocated = self.get_multiple(1, tag)?;
        Ok(allocated.remove(0))
    }

    /// Allocates `count` distinct ports in one all-or-nothing batch.
    ///
    /// Stale entries are dropped in-memory before the size check. Each
    /// candidate is probed for real availability; any failure abandons
    /// the whole batch before anything is persisted, so the registry on
    /// disk is unchanged on error.
    pub fn get_multiple(&self, count: usize, tag: Option<&str>) -> Result<Vec<PortEntry>> {
        if count < 1 || count > self.config.max_ports_per_request {
            return Err(RegistryError::InvalidCount {
                count,
                max: self.config.max_ports_per_request,
            }
            .into());
        }
        let (min, max) = self.effective_range()?;
        let tag = tag.and_then(sanitize_tag);

        let _guard = self.enter()?;
        let mut registry = self.store.load()?;
        self.drop_stale_in_memory(&mut registry);

        if registry.entries.len() + count > self.config.max_registry_size {
            return Err(RegistryError::RegistryFull {
                size: registry.entries.len(),
                requested: count,
                limit: self.config.max_registry_size,
            }
            .into());
        }

        let mut taken: HashSet<u16> = registry.entries.iter().map(|e| e.port.as_u16()).collect();
        let now = now_epoch_millis();
        let pid = std::process::id();

        let mut proposed = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(port) = find_available_port(min, max, &taken) else {
                // Abandon the whole batch; nothing was persisted.
                debug!(min, max, wanted = count, "batch allocation rolled back");
                return Err(RegistryError::NoAvailablePorts { start: min, end: max }.into());
            };
            taken.insert(port.as_u16());
            proposed.push(PortEntry {
                port,
                pid,
                timestamp: now,
                tag: tag.clone(),
            });
        }

        registry.entries.extend(proposed.iter().cloned());
        self.store.save(&registry)?;
        debug!(count, "allocated ports");
        Ok(proposed)
    }

    /// Releases a port owned by the current process.
    pub fn release(&self, port: Port) -> Result<()> {
        let _guard = self.enter()?;
        let mut registry = self.store.load()?;

        match registry.find_entry(port) {
            None => return Err(RegistryError::PortNotRegistered { port }.into()),
            Some(entry) if !entry.is_owned_by_current_process() => {
                return Err(RegistryError::NotPortOwner {
                    port,
                    owner_pid: entry.pid,
                }
                .into());
            }
            Some(_) => {}
        }

        // A port appears at most once in the registry.
        registry.entries.retain(|e| e.port != port);
        self.store.save(&registry)?;
        debug!(port = port.as_u16(), "released port");
        Ok(())
    }

    /// Removes every entry owned by the current process; returns how
    /// many were removed.
    pub fn release_all(&self) -> Result<usize> {
        let _guard = self.enter()?;
        let mut registry = self.store.load()?;

        let before = registry.entries.len();
        registry
            .entries
            .retain(|e| !e.is_owned_by_current_process());
        let removed = before - registry.entries.len();

        if removed > 0 {
            self.store.save(&registry)?;
            debug!(removed, "released all owned ports");
        }
        Ok(removed)
    }

    /// Returns the current entries, unfiltered. Reading still happens
    /// under the lock so no half-written registry is observable.
    pub fn list(&self) -> Result<Vec<PortEntry>> {
        let _guard = self.enter()?;
        Ok(self.store.load()?.entries)
    }

    /// Removes stale entries (dead owner or expired); returns how many
    /// were removed. Any client may do this for any owner.
    pub fn clean(&self) -> Result<usize> {
        let _guard = self.enter()?;
        let mut registry = self.store.load()?;

        let before = registry.entries.len();
        self.drop_stale_in_memory(&mut registry);
        let removed = before - registry.entries.len();

        if removed > 0 {
            self.store.save(&registry)?;
        }
        Ok(removed)
    }

    /// Computes entry counts from a single snapshot under the lock.
    pub fn status(&self) -> Result<RegistryStatus> {
        let range = self.effective_range()?;
        let _guard = self.enter()?;
        let registry = self.store.load()?;

        let now = now_epoch_millis();
        let stale_ms = self.stale_timeout_ms();
        let stale = registry
            .entries
            .iter()
            .filter(|e| e.is_stale(now, stale_ms))
            .count();
        let owned = registry
            .entries
            .iter()
            .filter(|e| e.is_owned_by_current_process())
            .count();

        Ok(RegistryStatus {
            total_entries: registry.entries.len(),
            active_entries: registry.entries.len() - stale,
            stale_entries: stale,
            owned_by_current_process: owned,
            port_range: range,
        })
    }

    /// Replaces the registry with an empty one, ignoring ownership.
    /// Administrative recovery; idempotent.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.enter()?;
        self.store.save(&RegistryFile::default())?;
        warn!("registry cleared");
        Ok(())
    }

    /// Acquires the registry semaphore; the guard releases it when the
    /// operation ends, on every exit path. The semaphore is re-opened
    /// per operation so there is no process-wide registry state.
    fn enter(&self) -> Result<SemaphoreGuard> {
        self.store.ensure_dir()?;
        let sem = Semaphore::open(
            &self.store.lock_path(),
            SemaphoreConfig {
                stale_timeout: self.config.stale_timeout,
                ..Default::default()
            },
        )?;
        Ok(sem.acquire_guard(LOCK_ACQUIRE_TIMEOUT, Some("registry"))?)
    }

    fn drop_stale_in_memory(&self, registry: &mut RegistryFile) {
        let now = now_epoch_millis();
        let stale_ms = self.stale_timeout_ms();
        registry.entries.retain(|e| !e.is_stale(now, stale_ms));
    }

    fn stale_timeout_ms(&self) -> u64 {
        self.config.stale_timeout.as_millis() as u64
    }

    /// The configured range with the privileged floor applied.
    fn effective_range(&self) -> Result<(u16, u16)> {
        let min = if self.config.allow_privileged {
            self.config.min_port
        } else {
            self.config.min_port.max(1024)
        };
        let max = self.config.max_port;
        if min > max {
            return Err(RegistryError::InvalidPortRange {
                start: min,
                end: max,
            }
            .into());
        }
        Ok((min, max))
    }
}

/// Finds a bindable port in `[min, max]` not in `taken`.
///
/// Up to 100 uniformly random attempts first (fast on sparse ranges),
/// then a sequential sweep over the remainder.
fn find_available_port(min: u16, max: u16, taken: &HashSet<u16>) -> Option<Port> {
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_SEARCH_ATTEMPTS {
        let candidate = rng.gen_range(min..=max);
        if taken.contains(&candidate) {
            continue;
        }
        let Ok(port) = Port::new(candidate) else {
            continue;
        };
        if is_port_available(port) {
            return Some(port);
        }
    }
    for candidate in min..=max {
        if taken.contains(&candidate) {
            continue;
        }
        let Ok(port) = Port::new(candidate) else {
            continue;
        };
        if is_port_available(port) {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use tempfile::TempDir;

    /// A PID far above any configured pid_max.
    const DEAD_PID: u32 = 4_294_000_000;

    fn registry_in(dir: &TempDir) -> PortRegistry {
        PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            ..Default::default()
        })
    }

    fn foreign_live_entry(port: u16) -> PortEntry {
        PortEntry {
            port: Port::new(port).unwrap(),
            // PID 1 is alive and is never the test process.
            pid: 1,
            timestamp: now_epoch_millis(),
            tag: None,
        }
    }

    #[test]
    fn test_get_single_port() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let entry = registry.get(Some("svc")).unwrap();
        assert!(entry.port.as_u16() >= 49152);
        assert_eq!(entry.pid, std::process::id());
        assert_eq!(entry.tag, Some("svc".to_string()));

        let listed = registry.list().unwrap();
        assert_eq!(listed, vec![entry]);
    }

    #[test]
    fn test_get_multiple_distinct_and_persisted_in_order() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let allocated = registry.get_multiple(3, Some("svc")).unwrap();
        assert_eq!(allocated.len(), 3);

        let mut seen = HashSet::new();
        for entry in &allocated {
            assert!((49152..=65535).contains(&entry.port.as_u16()));
            assert!(seen.insert(entry.port), "duplicate {}", entry.port);
        }

        // Returned order matches on-disk order.
        assert_eq!(registry.list().unwrap(), allocated);
    }

    #[test]
    fn test_count_zero_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let err = registry.get_multiple(0, None).unwrap_err();
        assert_eq!(err.error_type(), "invalid_count");
    }

    #[test]
    fn test_count_above_cap_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let err = registry.get_multiple(101, None).unwrap_err();
        assert_eq!(err.error_type(), "invalid_count");
    }

    #[test]
    fn test_registry_size_cap() {
        let dir = TempDir::new().unwrap();
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            max_registry_size: 2,
            ..Default::default()
        });

        let err = registry.get_multiple(3, None).unwrap_err();
        assert_eq!(err.error_type(), "registry_full");
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_batch_rollback_leaves_registry_unchanged() {
        let dir = TempDir::new().unwrap();
        // Two-port range, both held by a live foreign PID.
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            min_port: 50140,
            max_port: 50141,
            ..Default::default()
        });
        let pre = RegistryFile {
            entries: vec![foreign_live_entry(50140), foreign_live_entry(50141)],
            ..Default::default()
        };
        registry.store.save(&pre).unwrap();

        let err = registry.get_multiple(2, None).unwrap_err();
        assert_eq!(err.error_type(), "no_available_ports");
        assert_eq!(registry.list().unwrap(), pre.entries);
    }

    #[test]
    fn test_allocation_skips_bound_port() {
        // Range of exactly two ports, one of them actually bound.
        let blocker = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let bound = blocker.local_addr().unwrap().port();
        // Find an adjacent free candidate for the two-port range.
        let other = {
            let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let (min, max) = (bound.min(other), bound.max(other));

        let dir = TempDir::new().unwrap();
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            min_port: min,
            max_port: max,
            ..Default::default()
        });

        let entry = registry.get(None).unwrap();
        assert_ne!(entry.port.as_u16(), bound);
    }

    #[test]
    fn test_release_own_port() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let entry = registry.get(None).unwrap();
        registry.release(entry.port).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_release_foreign_port_reports_owner() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .store
            .save(&RegistryFile {
                entries: vec![foreign_live_entry(50150)],
                ..Default::default()
            })
            .unwrap();

        let err = registry.release(Port::new(50150).unwrap()).unwrap_err();
        assert_eq!(err.error_type(), "not_port_owner");
        assert_eq!(err.to_json()["owner_pid"], 1);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_release_unregistered_port() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let err = registry.release(Port::new(50160).unwrap()).unwrap_err();
        assert_eq!(err.error_type(), "port_not_registered");
    }

    #[test]
    fn test_release_all_only_removes_own() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        registry.get_multiple(2, None).unwrap();
        let mut on_disk = registry.store.load().unwrap();
        on_disk.entries.push(foreign_live_entry(50170));
        registry.store.save(&on_disk).unwrap();

        assert_eq!(registry.release_all().unwrap(), 2);
        let remaining = registry.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, 1);
    }

    #[test]
    fn test_release_all_empty() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        assert_eq!(registry.release_all().unwrap(), 0);
    }

    #[test]
    fn test_clean_removes_dead_and_expired() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let live = registry.get(None).unwrap();
        let mut on_disk = registry.store.load().unwrap();
        // Dead owner.
        on_disk.entries.push(PortEntry {
            port: Port::new(50180).unwrap(),
            pid: DEAD_PID,
            timestamp: now_epoch_millis(),
            tag: None,
        });
        // Live owner, expired reservation.
        on_disk.entries.push(PortEntry {
            port: Port::new(50181).unwrap(),
            pid: 1,
            timestamp: 0,
            tag: None,
        });
        registry.store.save(&on_disk).unwrap();

        assert_eq!(registry.clean().unwrap(), 2);
        assert_eq!(registry.list().unwrap(), vec![live]);
    }

    #[test]
    fn test_clean_nothing_stale() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.get(None).unwrap();

        assert_eq!(registry.clean().unwrap(), 0);
    }

    #[test]
    fn test_list_does_not_filter_stale() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .store
            .save(&RegistryFile {
                entries: vec![PortEntry {
                    port: Port::new(50190).unwrap(),
                    pid: DEAD_PID,
                    timestamp: 0,
                    tag: None,
                }],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_status_counts() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        registry.get_multiple(2, None).unwrap();
        let mut on_disk = registry.store.load().unwrap();
        on_disk.entries.push(PortEntry {
            port: Port::new(50200).unwrap(),
            pid: DEAD_PID,
            timestamp: 0,
            tag: None,
        });
        registry.store.save(&on_disk).unwrap();

        let status = registry.status().unwrap();
        assert_eq!(status.total_entries, 3);
        assert_eq!(status.active_entries, 2);
        assert_eq!(status.stale_entries, 1);
        assert_eq!(status.owned_by_current_process, 2);
        assert_eq!(status.port_range, (49152, 65535));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.get_multiple(2, None).unwrap();

        registry.clear().unwrap();
        let first = registry.store.load().unwrap();
        registry.clear().unwrap();
        let second = registry.store.load().unwrap();

        assert_eq!(first, second);
        assert!(second.entries.is_empty());
    }

    #[test]
    fn test_clear_ignores_ownership() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .store
            .save(&RegistryFile {
                entries: vec![foreign_live_entry(50210)],
                ..Default::default()
            })
            .unwrap();

        registry.clear().unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_registry_recovers() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.store.ensure_dir().unwrap();
        std::fs::write(registry.store.registry_path(), b"}{ random bytes \x00").unwrap();

        assert!(registry.list().unwrap().is_empty());
        let entry = registry.get(None).unwrap();
        assert_eq!(registry.list().unwrap(), vec![entry]);
    }

    #[test]
    fn test_tag_sanitized_in_allocation() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let entry = registry.get(Some("svc\nport=1\n")).unwrap();
        assert_eq!(entry.tag, Some("svcport=1".to_string()));
        assert_eq!(registry.list().unwrap()[0].tag, entry.tag);
    }

    #[test]
    fn test_privileged_floor() {
        let dir = TempDir::new().unwrap();
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            min_port: 80,
            max_port: 65535,
            ..Default::default()
        });
        assert_eq!(registry.effective_range().unwrap(), (1024, 65535));
    }

    #[test]
    fn test_privileged_allowed_keeps_floor() {
        let dir = TempDir::new().unwrap();
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            min_port: 80,
            max_port: 65535,
            allow_privileged: true,
            ..Default::default()
        });
        assert_eq!(registry.effective_range().unwrap(), (80, 65535));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = PortRegistry::new(RegistryConfig {
            registry_dir: dir.path().join("registry"),
            min_port: 60000,
            max_port: 50000,
            ..Default::default()
        });
        let err = registry.get(None).unwrap_err();
        assert_eq!(err.error_type(), "invalid_port");
    }

    #[test]
    fn test_find_available_port_honors_exclusions() {
        let taken: HashSet<u16> = (50220..=50239).collect();
        for _ in 0..20 {
            if let Some(port) = find_available_port(50220, 50240, &taken) {
                assert_eq!(port.as_u16(), 50240);
            }
        }
    }

    #[test]
    fn test_find_available_port_exhausted() {
        let taken: HashSet<u16> = (50250..=50252).collect();
        assert!(find_available_port(50250, 50252, &taken).is_none());
    }

    #[test]
    fn test_lock_file_lives_in_registry_dir() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.get(None).unwrap();

        // Lock is released between operations.
        assert!(!registry.store.lock_path().exists());
        assert!(registry.store.registry_path().exists());
    }
}

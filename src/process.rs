//! Process liveness probe.
//!
//! Answers one question: is a PID recorded in a lock or registry entry
//! still running on this host? The probe never blocks and never fails;
//! when the answer cannot be determined it reports not-running, which is
//! safe because staleness additionally requires an age threshold.
//!
//! Known limitation: PIDs are reused after process death, so a positive
//! answer may refer to an unrelated newer process. Stale detection
//! tolerates this by requiring both a dead holder and an expired
//! timestamp before reclaiming anything.

/// Returns whether `pid` currently corresponds to a running process.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs permission and existence checks without
    // delivering anything. EPERM still proves the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_init_is_running() {
        assert!(is_process_running(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_impossible_pid_is_not_running() {
        // Far above any configured pid_max.
        assert!(!is_process_running(4_294_000_000));
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_zero_is_not_running() {
        assert!(!is_process_running(0));
    }
}

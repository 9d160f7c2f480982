use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Samples this process's resident set size.
pub struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("memory sampling disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Resident bytes right now, or 0 when the platform cannot tell.
    pub fn sample(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_never_panics() {
        let mut probe = MemoryProbe::new();
        let first = probe.sample();
        let second = probe.sample();
        // on supported platforms a live process has some resident memory
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            assert!(first > 0 && second > 0);
        }
    }

    #[test]
    fn converts_to_megabytes() {
        assert_eq!(to_mb(3 * 1024 * 1024), 3.0);
    }
}

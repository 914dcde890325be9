//! OS access for the port allocator.

use std::io;
use std::net::TcpListener;
use std::process::Command;

/// Signal sent to a process holding a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Everything the allocator needs from the operating system.
pub trait PortProbe: Send + Sync {
    /// Whether a listener can currently be bound on `port`.
    fn is_free(&self, port: u16) -> bool;

    /// Pid of the process listening on `port`, if it can be found.
    fn owner(&self, port: u16) -> Option<u32>;

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by real sockets, `lsof` and `kill(2)`.
#[derive(Debug, Clone)]
pub struct SystemPortProbe {
    host: String,
}

impl SystemPortProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for SystemPortProbe {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl PortProbe for SystemPortProbe {
    fn is_free(&self, port: u16) -> bool {
        // The listener is dropped immediately; we only care whether bind succeeds.
        TcpListener::bind((self.host.as_str(), port)).is_ok()
    }

    fn owner(&self, port: u16) -> Option<u32> {
        let output = Command::new("lsof")
            .args(["-t", "-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .output()
            .map_err(|e| tracing::debug!(port, error = %e, "lsof unavailable"))
            .ok()?;
        parse_lsof_pids(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .next()
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is only supported on unix",
        ))
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            true
        } else {
            // EPERM means the process exists but belongs to someone else
            matches!(
                io::Error::last_os_error().raw_os_error(),
                Some(code) if code == libc::EPERM
            )
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_pids() {
        assert_eq!(parse_lsof_pids("1234\n5678\n"), vec![1234, 5678]);
        assert!(parse_lsof_pids("").is_empty());
        assert_eq!(parse_lsof_pids("garbage\n42"), vec![42]);
    }

    #[test]
    fn test_bound_port_is_not_free() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = SystemPortProbe::default();
        assert!(!probe.is_free(port));
        drop(listener);
        assert!(probe.is_free(port));
    }

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        let probe = SystemPortProbe::default();
        assert!(probe.is_alive(std::process::id()));
    }
}

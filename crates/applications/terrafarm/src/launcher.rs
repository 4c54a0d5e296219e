//! Detached monitor process management
//!
//! The monitor runs as `terrafarm monitor <destroy_after>[+<max_wait>]` (fresh)
//! or `terrafarm monitor --resume`, detached from the terminal. Secrets reach
//! it through the environment, never the argument list.
//!
//! A launch only counts as successful once the child has written its monitor
//! state with its own pid and is still alive.

use crate::error::{Result, TerrafarmError};
use crate::prefs::{Credentials, EV_DATA, EV_PASSWORD, EV_TOKEN};
use crate::state::{MonitorState, StateStore};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to wait for the monitor to come up or go away
pub const MONITOR_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the monitor
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline handed to a fresh monitor: `<destroy_after>[+<max_wait>]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSpec {
    /// Earliest destroy time (unix seconds)
    pub destroy_after: i64,
    /// Grace window (seconds)
    pub max_wait: i64,
}

impl MonitorSpec {
    /// Deadline `ttl` minutes after `now`, with `max_wait` minutes of grace
    pub fn from_minutes(now: i64, ttl: u64, max_wait: u64) -> Self {
        let minutes = |m: u64| i64::try_from(m.saturating_mul(60)).unwrap_or(i64::MAX);
        Self {
            destroy_after: now.saturating_add(minutes(ttl)),
            max_wait: minutes(max_wait),
        }
    }
}

impl fmt::Display for MonitorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max_wait > 0 {
            write!(f, "{}+{}", self.destroy_after, self.max_wait)
        } else {
            write!(f, "{}", self.destroy_after)
        }
    }
}

impl FromStr for MonitorSpec {
    type Err = TerrafarmError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TerrafarmError::config(format!("Invalid monitor deadline: {}", s));

        let (deadline, wait) = match s.split_once('+') {
            Some((deadline, wait)) => (deadline, Some(wait)),
            None => (s, None),
        };

        let destroy_after = deadline.trim().parse::<i64>().map_err(|_| invalid())?;
        let max_wait = match wait {
            Some(wait) => wait.trim().parse::<i64>().map_err(|_| invalid())?,
            None => 0,
        };

        if destroy_after <= 0 || max_wait < 0 {
            return Err(invalid());
        }

        Ok(Self {
            destroy_after,
            max_wait,
        })
    }
}

/// How to start the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// New deadline
    Fresh(MonitorSpec),
    /// Continue with the stored deadline
    Resume,
}

/// Spawns and stops the detached monitor
#[derive(Debug, Clone)]
pub struct MonitorLauncher {
    exe: PathBuf,
    store: StateStore,
    credentials: Credentials,
    timeout: Duration,
}

impl MonitorLauncher {
    /// Launcher re-executing the current binary
    pub fn new(store: StateStore, credentials: Credentials) -> Result<Self> {
        Ok(Self::with_exe(std::env::current_exe()?, store, credentials))
    }

    /// Launcher executing `exe`
    pub fn with_exe(exe: impl Into<PathBuf>, store: StateStore, credentials: Credentials) -> Self {
        Self {
            exe: exe.into(),
            store,
            credentials,
            timeout: MONITOR_STARTUP_TIMEOUT,
        }
    }

    /// Override how long to wait for the monitor
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start the monitor and wait until it has registered itself
    pub async fn launch(&self, mode: LaunchMode) -> Result<MonitorState> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("monitor");

        match mode {
            LaunchMode::Fresh(spec) => cmd.arg(spec.to_string()),
            LaunchMode::Resume => cmd.arg("--resume"),
        };

        let child = cmd
            .env(EV_DATA, self.store.dir())
            .env(EV_TOKEN, &self.credentials.token)
            .env(EV_PASSWORD, &self.credentials.password)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TerrafarmError::monitor_launch(format!("Can't spawn monitor: {}", e)))?;

        debug!("Monitor spawned with pid {}", child.id());

        self.wait_for_registration(child).await
    }

    async fn wait_for_registration(&self, mut child: Child) -> Result<MonitorState> {
        let pid = child.id();
        let started = Instant::now();

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(TerrafarmError::monitor_launch(format!(
                    "Monitor exited during startup ({})",
                    status
                )));
            }

            // Half-written or stale state is expected while the child starts
            if let Ok(Some(state)) = self.store.read_monitor() {
                if state.pid == pid && is_alive(pid) {
                    info!("Monitor started with pid {}", pid);
                    return Ok(state);
                }
            }

            if started.elapsed() >= self.timeout {
                return Err(TerrafarmError::monitor_launch(format!(
                    "Monitor didn't register within {:?}",
                    self.timeout
                )));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the running monitor, if any. Returns the state it was running with.
    pub async fn stop(&self) -> Result<Option<MonitorState>> {
        let Some(state) = self.store.read_monitor()? else {
            return Ok(None);
        };

        if !is_alive(state.pid) {
            warn!("Monitor with pid {} is not running, removing its state", state.pid);
            self.store.delete_monitor()?;
            return Ok(Some(state));
        }

        send_signal(state.pid, Signal::SIGTERM)?;

        let started = Instant::now();

        while is_alive(state.pid) {
            if started.elapsed() >= self.timeout {
                return Err(TerrafarmError::Timeout(self.timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        debug!("Monitor with pid {} stopped", state.pid);

        Ok(Some(state))
    }

    /// Move the destroy deadline forward by `seconds` and restart the monitor
    pub async fn prolong(&self, seconds: i64) -> Result<MonitorState> {
        let mut state = self
            .store
            .read_monitor()?
            .ok_or_else(|| TerrafarmError::MonitorStateMissing(self.store.monitor_state_path()))?;

        self.stop().await?;

        state.prolong(seconds);
        self.store.save_monitor(&state)?;

        self.launch(LaunchMode::Resume).await
    }
}

/// True if a process with `pid` exists
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| TerrafarmError::monitor_launch(format!("Invalid pid {}", pid)))?;

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(TerrafarmError::monitor_launch(format!(
            "Can't send {} to monitor {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_monitor_spec_parse() {
        assert_eq!(
            "1700003600".parse::<MonitorSpec>().unwrap(),
            MonitorSpec { destroy_after: 1_700_003_600, max_wait: 0 }
        );
        assert_eq!(
            "1700003600+1800".parse::<MonitorSpec>().unwrap(),
            MonitorSpec { destroy_after: 1_700_003_600, max_wait: 1800 }
        );
        assert!("soon".parse::<MonitorSpec>().is_err());
        assert!("1700003600+".parse::<MonitorSpec>().is_err());
        assert!("1700003600+-5".parse::<MonitorSpec>().is_err());
    }

    #[test]
    fn test_monitor_spec_display() {
        let spec = MonitorSpec::from_minutes(1_700_000_000, 60, 30);
        assert_eq!(spec.to_string(), "1700003600+1800");
        assert_eq!(spec.to_string().parse::<MonitorSpec>().unwrap(), spec);

        let spec = MonitorSpec::from_minutes(1_700_000_000, 60, 0);
        assert_eq!(spec.to_string(), "1700003600");
    }

    #[test]
    fn test_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_stop_without_monitor() {
        let dir = TempDir::new().unwrap();
        let launcher = MonitorLauncher::with_exe("/bin/false", StateStore::new(dir.path()), Credentials::default());
        assert!(launcher.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_removes_stale_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        store
            .save_monitor(&MonitorState { pid: dead_pid, started: 1, destroy_after: 2, max_wait: 0 })
            .unwrap();

        let launcher = MonitorLauncher::with_exe("/bin/false", store.clone(), Credentials::default());
        let stopped = launcher.stop().await.unwrap().unwrap();
        assert_eq!(stopped.pid, dead_pid);
        assert!(store.read_monitor().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_launch_fails_when_child_exits() {
        let dir = TempDir::new().unwrap();
        let launcher = MonitorLauncher::with_exe("/bin/false", StateStore::new(dir.path()), Credentials::default())
            .with_timeout(Duration::from_secs(2));

        let err = launcher.launch(LaunchMode::Resume).await.unwrap_err();
        assert!(matches!(err, TerrafarmError::MonitorLaunch(_)));
    }

    #[test]
    fn test_prolong_requires_monitor_state() {
        let dir = TempDir::new().unwrap();
        let launcher = MonitorLauncher::with_exe("/bin/false", StateStore::new(dir.path()), Credentials::default());
        assert!(matches!(
            tokio_test::block_on(launcher.prolong(600)),
            Err(TerrafarmError::MonitorStateMissing(_))
        ));
    }
}

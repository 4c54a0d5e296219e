//! Farm lifecycle monitor
//!
//! Long-running background process that destroys the farm once its TTL is
//! spent and no build is running on it.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──► Waiting ──► Polling ──► Destroying ──► Terminated
//!    ▲            │           │  ▲          │
//!    │            └───────────┼──┘          └─► (failure: retry next tick)
//!    └──── Restarting ◄── SIGHUP
//! ```
//!
//! Every tick (immediately on start, then once a minute):
//!
//! 1. Terraform state holds no resources → farm was destroyed manually, exit
//! 2. `now < destroy_after` → keep waiting
//! 3. `max_wait == 0` → destroy
//! 4. `now > destroy_after + max_wait` → destroy (forced)
//! 5. otherwise probe the nodes and destroy once none is building; an
//!    unreadable Terraform state postpones the probe to the next tick
//!
//! ## Signals
//!
//! - `SIGHUP`: re-read the monitor state (the deadline may have been prolonged)
//! - `SIGTERM` / `SIGINT`: remove the monitor state and exit, farm untouched

use crate::error::Result;
use crate::farm::usage_estimate;
use crate::prefs::Credentials;
use crate::remote::{NodeProbe, active_nodes};
use crate::state::{MonitorState, StateStore};
use crate::terraform::{ProvisionedState, Provisioner};
use chrono::{DateTime, Local, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time between checks
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of the current time (unix seconds)
pub trait Clock: Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// What a tick should do, given the time and the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// TTL not reached yet
    Wait,
    /// Inside the grace window, destroy only if idle
    Poll,
    /// Destroy now
    Destroy {
        /// Grace window exhausted while builds were still running
        forced: bool,
    },
}

/// Decide the next step
pub fn decide(now: i64, destroy_after: i64, max_wait: i64) -> Decision {
    if now < destroy_after {
        Decision::Wait
    } else if max_wait <= 0 {
        Decision::Destroy { forced: false }
    } else if now > destroy_after.saturating_add(max_wait) {
        Decision::Destroy { forced: true }
    } else {
        Decision::Poll
    }
}

/// Monitor phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Loading state
    Starting,
    /// Before the deadline
    Waiting,
    /// Inside the grace window, watching builds
    Polling,
    /// Destroy in progress (or failed, pending retry)
    Destroying,
    /// Reloading state after SIGHUP
    Restarting,
    /// Done
    Terminated,
}

/// Why the monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Farm destroyed by the monitor
    Destroyed,
    /// Farm was already gone
    DestroyedManually,
    /// Asked to stop, farm left running
    Shutdown,
}

/// Control message delivered between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorControl {
    /// Reload monitor state
    Restart,
    /// Stop monitoring, keep the farm
    Shutdown,
}

/// How the monitor gets its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// New deadline (unix seconds) and grace window (seconds)
    Fresh {
        /// Earliest destroy time
        destroy_after: i64,
        /// Grace window
        max_wait: i64,
    },
    /// Continue with the deadline from the monitor state
    Resume,
}

/// Farm lifecycle monitor
pub struct FarmMonitor<P, N, C> {
    store: StateStore,
    provisioner: P,
    prober: N,
    clock: C,
    credentials: Credentials,
    state: MonitorState,
    phase: MonitorPhase,
    interval: Duration,
    active: Vec<String>,
}

impl<P, N, C> FarmMonitor<P, N, C>
where
    P: Provisioner,
    N: NodeProbe,
    C: Clock,
{
    /// Register the monitor (as process `pid`) and persist its state
    pub fn start(
        store: StateStore,
        mode: StartMode,
        pid: u32,
        provisioner: P,
        prober: N,
        clock: C,
        credentials: Credentials,
    ) -> Result<Self> {
        let state = match mode {
            StartMode::Fresh {
                destroy_after,
                max_wait,
            } => {
                let state = MonitorState {
                    pid,
                    started: clock.now(),
                    destroy_after,
                    max_wait: max_wait.max(0),
                };
                store.save_monitor(&state)?;
                state
            }
            StartMode::Resume => reaffirm(&store, pid)?,
        };

        log_deadline(&state);

        Ok(Self {
            store,
            provisioner,
            prober,
            clock,
            credentials,
            state,
            phase: MonitorPhase::Starting,
            interval: CHECK_INTERVAL,
            active: Vec::new(),
        })
    }

    /// Override the check interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Current phase
    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    /// Deadline currently in effect
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Nodes found building by the last probe
    pub fn active(&self) -> &[String] {
        &self.active
    }

    /// Run until the farm is gone or a shutdown is requested
    pub async fn run(mut self, mut control: mpsc::Receiver<MonitorControl>) -> Result<MonitorExit> {
        info!("Monitor started (pid {})", self.state.pid);

        loop {
            match self.tick().await {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(e) if e.is_fatal_for_monitor() => {
                    error!(critical = true, "{}", e);
                    return Err(e);
                }
                Err(e) => error!("{}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                Some(cmd) = control.recv() => match cmd {
                    MonitorControl::Restart => {
                        if let Err(e) = self.restart() {
                            error!(critical = true, "{}", e);
                            return Err(e);
                        }
                    }
                    MonitorControl::Shutdown => return self.shutdown(),
                },
            }
        }
    }

    /// Evaluate the farm once
    pub async fn tick(&mut self) -> Result<Option<MonitorExit>> {
        let provisioned = match self.provisioner.state() {
            Ok(state) if state.is_empty() => {
                info!("Farm destroyed manually. Shutdown monitor...");
                self.store.delete_monitor()?;
                self.phase = MonitorPhase::Terminated;
                return Ok(Some(MonitorExit::DestroyedManually));
            }
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Can't read terraform state: {}", e);
                None
            }
        };

        let now = self.clock.now();

        match decide(now, self.state.destroy_after, self.state.max_wait) {
            Decision::Wait => {
                self.phase = MonitorPhase::Waiting;
                debug!(
                    "{} seconds left until farm destruction",
                    self.state.destroy_after - now
                );
                Ok(None)
            }
            Decision::Poll => {
                self.phase = MonitorPhase::Polling;
                match provisioned {
                    Some(provisioned) => self.poll(&provisioned).await,
                    // Unknown nodes can't be proven idle
                    None => {
                        warn!("Node list unavailable, build check postponed");
                        Ok(None)
                    }
                }
            }
            Decision::Destroy { forced } => {
                if forced {
                    info!("Max wait period is over, destroying farm with active builds");
                }
                self.destroy(&provisioned.unwrap_or_default()).await
            }
        }
    }

    async fn poll(&mut self, provisioned: &ProvisionedState) -> Result<Option<MonitorExit>> {
        let farm = self.store.require_farm()?;
        let prefs = farm.preferences.with_credentials(&self.credentials);

        debug!("Checking build processes on {} nodes", provisioned.nodes.len());

        let nodes = self.prober.probe(&prefs, &provisioned.nodes).await;
        self.active = active_nodes(&nodes).into_iter().map(str::to_string).collect();

        if self.active.is_empty() {
            info!("No active builds found");
            return self.destroy(provisioned).await;
        }

        info!(
            "{} still have active build processes, waiting...",
            self.active.join(", ")
        );

        Ok(None)
    }

    async fn destroy(&mut self, provisioned: &ProvisionedState) -> Result<Option<MonitorExit>> {
        self.phase = MonitorPhase::Destroying;

        let farm = self.store.require_farm()?;
        let prefs = farm.preferences.with_credentials(&self.credentials);

        info!("Destroying farm...");

        if let Err(e) = self.provisioner.destroy(&prefs).await {
            error!("Error while farm destroying: {}", e);
            return Ok(None);
        }

        self.store.delete_farm()?;
        self.store.delete_monitor()?;
        self.phase = MonitorPhase::Terminated;

        info!("Farm successfully destroyed");

        let estimate = usage_estimate(
            farm.started,
            self.clock.now(),
            provisioned.nodes.len(),
            farm.price_hourly,
        );
        info!("{}", estimate);

        Ok(Some(MonitorExit::Destroyed))
    }

    fn restart(&mut self) -> Result<()> {
        self.phase = MonitorPhase::Restarting;
        info!("Restarting monitor...");

        self.state = reaffirm(&self.store, self.state.pid)?;
        log_deadline(&self.state);

        self.phase = MonitorPhase::Starting;

        Ok(())
    }

    fn shutdown(&mut self) -> Result<MonitorExit> {
        info!("Shutdown monitor...");
        self.store.delete_monitor()?;
        self.phase = MonitorPhase::Terminated;
        Ok(MonitorExit::Shutdown)
    }
}

/// Load the monitor state and make sure it points at `pid`
fn reaffirm(store: &StateStore, pid: u32) -> Result<MonitorState> {
    let mut state = store.require_monitor()?;

    if state.pid != pid {
        debug!("Updating monitor pid {} -> {}", state.pid, pid);
        state.pid = pid;
        store.save_monitor(&state)?;
    }

    Ok(state)
}

fn log_deadline(state: &MonitorState) {
    if state.max_wait > 0 {
        info!(
            "Farm will be destroyed during the period {} - {}",
            format_time(state.destroy_after),
            format_time(state.hard_deadline())
        );
    } else {
        info!("Farm will be destroyed after {}", format_time(state.destroy_after));
    }
}

/// Local time for log and status output
pub fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.with_timezone(&Local).format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Forward SIGHUP / SIGTERM / SIGINT into the monitor control channel
pub fn bridge_signals(tx: mpsc::Sender<MonitorControl>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                Some(()) = hangup.recv() => MonitorControl::Restart,
                Some(()) = terminate.recv() => MonitorControl::Shutdown,
                Some(()) = interrupt.recv() => MonitorControl::Shutdown,
                else => break,
            };

            debug!("Signal received: {:?}", cmd);

            if tx.send(cmd).await.is_err() {
                break;
            }
        }
    }))
}

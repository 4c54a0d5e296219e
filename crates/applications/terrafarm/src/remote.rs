//! Build node probing over SSH
//!
//! Each build node keeps a lock file in the build user's home directory while
//! a build is running:
//!
//! ```text
//! /home/<user>/.buildlock
//! ```
//!
//! A probe connects as `root` with the farm key and runs
//! `stat -c %Y /home/<user>/.buildlock`:
//!
//! | Outcome                      | State      |
//! |------------------------------|------------|
//! | command succeeds             | `Active`   |
//! | connects, command fails      | `Inactive` |
//! | connection fails or times out| `Down`     |
//!
//! ## Limitations
//!
//! A lock file left behind by a hung or killed build keeps the node `Active`
//! until `max_build_time` (when set) marks the lock as stale.

use crate::error::{Result, TerrafarmError};
use crate::prefs::Preferences;
use crate::terraform::FarmNode;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use openssh::{KnownHosts, Session, SessionBuilder};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// SSH connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for establishing the session (including handshake)
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the status command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Administrative user used for probing
const PROBE_USER: &str = "root";

/// Nodes probed at the same time
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

/// Node architecture, derived from the node name suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    /// 32-bit i386 (`-x32`)
    I386,
    /// 32-bit i686 (`-x48`)
    I686,
    /// 64-bit (`-x64` or anything else)
    X86_64,
}

impl Arch {
    /// Architecture of a node with the given name
    pub fn from_node_name(name: &str) -> Self {
        if name.ends_with("-x32") {
            Self::I386
        } else if name.ends_with("-x48") {
            Self::I686
        } else {
            Self::X86_64
        }
    }

    /// RPM architecture name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I386 => "i386",
            Self::I686 => "i686",
            Self::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node state as seen by the last probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not probed
    Unknown,
    /// Reachable, no build running
    Inactive,
    /// Reachable, build lock present
    Active,
    /// Unreachable
    Down,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// Build node with its probed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Droplet name
    pub name: String,
    /// Public IPv4 address
    pub ip: String,
    /// Architecture
    pub arch: Arch,
    /// Probed state
    pub state: NodeState,
}

impl NodeInfo {
    /// Unprobed node info
    pub fn new(node: &FarmNode) -> Self {
        Self {
            name: node.name.clone(),
            ip: node.ip.clone(),
            arch: Arch::from_node_name(&node.name),
            state: NodeState::Unknown,
        }
    }

    /// Same node with a new state
    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }
}

/// Names of nodes with a running build
pub fn active_nodes(nodes: &[NodeInfo]) -> Vec<&str> {
    nodes
        .iter()
        .filter(|n| n.state == NodeState::Active)
        .map(|n| n.name.as_str())
        .collect()
}

/// Capability to learn whether farm nodes are busy
#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Probe every node; never fails, unreachable nodes come back `Down`
    async fn probe(&self, prefs: &Preferences, nodes: &[FarmNode]) -> Vec<NodeInfo>;
}

/// Result of running the lock check on a reachable node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCheck {
    /// `stat` succeeded and printed the lock mtime (unix seconds)
    Present(Option<i64>),
    /// `stat` failed, there is no lock
    Absent,
}

/// Map a lock check to a node state.
///
/// With `max_build_time` > 0 (minutes), a lock older than that is stale.
pub fn classify(check: &LockCheck, now: i64, max_build_time: u64) -> NodeState {
    match check {
        LockCheck::Absent => NodeState::Inactive,
        LockCheck::Present(Some(mtime)) if max_build_time > 0 => {
            let limit = i64::try_from(max_build_time.saturating_mul(60)).unwrap_or(i64::MAX);
            if now.saturating_sub(*mtime) > limit {
                NodeState::Inactive
            } else {
                NodeState::Active
            }
        }
        LockCheck::Present(_) => NodeState::Active,
    }
}

/// Path of the build lock for `user`
pub fn lock_path(user: &str) -> String {
    format!("/home/{}/.buildlock", user)
}

/// Node prober using OpenSSH multiplexed sessions
#[derive(Debug, Clone)]
pub struct SshProber {
    concurrency: usize,
}

impl SshProber {
    /// Create a prober with default concurrency
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_PROBE_CONCURRENCY)
    }

    /// Create a prober probing at most `concurrency` nodes at once
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    async fn probe_node(&self, prefs: &Preferences, node: &FarmNode) -> NodeInfo {
        let info = NodeInfo::new(node);

        let session = match connect(&prefs.key, &node.ip).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Can't connect to {} ({}): {}", node.name, node.ip, e);
                return info.with_state(NodeState::Down);
            }
        };

        let check = check_lock(&session, &prefs.user).await;

        if let Err(e) = session.close().await {
            debug!("Error while closing session to {}: {}", node.name, e);
        }

        match check {
            Ok(check) => {
                let now = chrono::Utc::now().timestamp();
                info.with_state(classify(&check, now, prefs.max_build_time))
            }
            Err(e) => {
                warn!("Can't check build lock on {}: {}", node.name, e);
                info.with_state(NodeState::Down)
            }
        }
    }
}

impl Default for SshProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeProbe for SshProber {
    async fn probe(&self, prefs: &Preferences, nodes: &[FarmNode]) -> Vec<NodeInfo> {
        let probes: Vec<_> = nodes
            .iter()
            .map(|node| Box::pin(self.probe_node(prefs, node)))
            .collect();

        let mut infos: Vec<NodeInfo> = stream::iter(probes)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

async fn connect(key: &Path, ip: &str) -> Result<Session> {
    let mut builder = SessionBuilder::default();
    builder
        .user(PROBE_USER.to_string())
        .keyfile(key)
        .connect_timeout(CONNECT_TIMEOUT)
        .known_hosts_check(KnownHosts::Accept);

    tokio::time::timeout(SESSION_TIMEOUT, builder.connect(ip))
        .await
        .map_err(|_| TerrafarmError::Timeout(SESSION_TIMEOUT))?
        .map_err(TerrafarmError::from)
}

async fn check_lock(session: &Session, user: &str) -> Result<LockCheck> {
    let mut command = session.command("stat");
    command.arg("-c").arg("%Y").arg(lock_path(user));

    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .map_err(|_| TerrafarmError::Timeout(COMMAND_TIMEOUT))??;

    if output.status.success() {
        let mtime = String::from_utf8_lossy(&output.stdout).trim().parse().ok();
        Ok(LockCheck::Present(mtime))
    } else {
        Ok(LockCheck::Absent)
    }
}

//! # Terrafarm
//!
//! Ephemeral RPM build farms on DigitalOcean, driven by Terraform.
//!
//! ## Architecture
//!
//! ```text
//! CLI (create/destroy/status/prolong)
//! ├── Preferences     defaults < file < env < flags
//! ├── TerraformRunner apply / destroy / state
//! ├── StateStore      .farm-state, .monitor-state
//! └── MonitorLauncher ─────► detached `terrafarm monitor`
//!                            └── FarmMonitor
//!                                ├── TTL + max-wait deadline
//!                                ├── SshProber (build locks)
//!                                └── TerraformRunner::destroy
//! ```
//!
//! The monitor keeps cloud spend bounded: once the TTL is spent it destroys
//! the farm, unless builds are still running and a max-wait grace window is
//! configured. See [`monitor`] for the decision rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digitalocean;
pub mod error;
pub mod farm;
pub mod launcher;
pub mod monitor;
pub mod prefs;
pub mod remote;
pub mod state;
pub mod terraform;

// Error handling
pub use error::{Result, TerrafarmError};

// Preferences
pub use prefs::{Credentials, PreferenceOverrides, Preferences, PreferencesResolver};

// State files
pub use state::{FarmState, MonitorState, StateStore};

// Provisioning
pub use terraform::{FarmNode, OutputMode, ProvisionedState, Provisioner, TerraformRunner};

// Node probing
pub use remote::{Arch, NodeInfo, NodeProbe, NodeState, SshProber};

// Lifecycle monitor
pub use monitor::{
    Clock, Decision, FarmMonitor, MonitorControl, MonitorExit, MonitorPhase, StartMode,
    SystemClock, decide,
};

// Monitor process management
pub use launcher::{LaunchMode, MonitorLauncher, MonitorSpec};

// DigitalOcean API
pub use digitalocean::{DigitalOceanClient, Droplet, Validation};

//! Terraform runner
//!
//! Wraps `terraform apply` / `terraform destroy` for a farm template.
//!
//! Variables are handed over in a temporary var-file so secrets never show up
//! in the process list. Stdout is drained while the tool runs, either into the
//! log (monitor) or to the console (interactive). Stderr is captured and
//! returned with the failure.
//!
//! The state file is always passed explicitly, which lets the monitor and the
//! CLI look at the same infrastructure from different working directories.

use crate::error::{Result, TerrafarmError};
use crate::prefs::Preferences;
use async_trait::async_trait;
use colored::Colorize;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default provisioning binary
pub const DEFAULT_TERRAFORM_BINARY: &str = "terraform";

/// Terraform resource type of build nodes
const DROPLET_RESOURCE: &str = "digitalocean_droplet";

/// Where the tool's stdout goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Structured log, one event per non-blank line
    Log,
    /// Terminal, with per-architecture colouring
    Console,
}

/// Build node as recorded in the terraform state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmNode {
    /// Droplet name
    pub name: String,
    /// Public IPv4 address
    pub ip: String,
}

/// What the terraform state currently holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedState {
    /// Total number of managed resources
    pub resources: usize,
    /// Droplets, sorted by name
    pub nodes: Vec<FarmNode>,
}

impl ProvisionedState {
    /// True when nothing is provisioned
    pub fn is_empty(&self) -> bool {
        self.resources == 0
    }
}

/// Capability to create, destroy and inspect farm infrastructure
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the farm described by `prefs`
    async fn apply(&self, prefs: &Preferences) -> Result<()>;

    /// Destroy the farm described by `prefs`
    async fn destroy(&self, prefs: &Preferences) -> Result<()>;

    /// Current provisioning state; a missing state file means nothing exists
    fn state(&self) -> Result<ProvisionedState>;
}

/// Terraform runner that wraps the terraform CLI
#[derive(Debug, Clone)]
pub struct TerraformRunner {
    /// Binary to execute
    binary: PathBuf,
    /// Directory holding the templates
    data_dir: PathBuf,
    /// Terraform state file
    state_file: PathBuf,
    /// Stdout handling
    output: OutputMode,
}

impl TerraformRunner {
    /// Create a runner for templates and state under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>, state_file: impl Into<PathBuf>, output: OutputMode) -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_TERRAFORM_BINARY),
            data_dir: data_dir.into(),
            state_file: state_file.into(),
            output,
        }
    }

    /// Use another binary instead of `terraform` from `PATH`
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Terraform state file
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Resolve the terraform binary, failing early when it isn't installed
    pub fn check_binary(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|e| {
            TerrafarmError::config(format!(
                "{} is required but can't be found ({})",
                self.binary.display(),
                e
            ))
        })
    }

    async fn run(&self, action: &str, prefs: &Preferences) -> Result<()> {
        let template_dir = prefs.template_dir(&self.data_dir);

        info!(
            "Running terraform {} with template {}",
            action, prefs.template
        );

        let var_file = write_var_file(&prefs.variables()?)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(action)
            .arg("-auto-approve")
            .arg("-input=false")
            .arg(format!("-var-file={}", var_file.path().display()))
            .arg(format!("-state={}", self.state_file.display()));

        if self.output == OutputMode::Log {
            cmd.arg("-no-color");
        }

        let mut child = cmd
            .current_dir(&template_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TerrafarmError::provisioning(action, format!("can't run {}: {}", self.binary.display(), e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mode = self.output;

        let stdout_task = tokio::spawn(async move {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    emit_line(mode, &line);
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut err) = stderr {
                if let Err(e) = err.read_to_string(&mut buf).await {
                    warn!("Can't read terraform stderr: {}", e);
                }
            }
            buf
        });

        let status = child.wait().await?;

        if let Err(e) = stdout_task.await {
            warn!("Terraform output reader failed: {}", e);
        }

        let stderr = stderr_task.await.unwrap_or_default();

        debug!("terraform {} exited with {}", action, status);

        if status.success() {
            Ok(())
        } else {
            Err(TerrafarmError::provisioning(action, stderr.trim()))
        }
    }
}

#[async_trait]
impl Provisioner for TerraformRunner {
    async fn apply(&self, prefs: &Preferences) -> Result<()> {
        self.run("apply", prefs).await
    }

    async fn destroy(&self, prefs: &Preferences) -> Result<()> {
        self.run("destroy", prefs).await
    }

    fn state(&self) -> Result<ProvisionedState> {
        read_state(&self.state_file)
    }
}

/// Write variables as an HCL var-file
fn write_var_file(vars: &[(String, String)]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("terrafarm-")
        .suffix(".tfvars")
        .tempfile()?;

    for (name, value) in vars {
        writeln!(file, "{} = \"{}\"", name, escape_hcl(value))?;
    }

    file.flush()?;

    Ok(file)
}

fn escape_hcl(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace("${", "$${")
}

fn emit_line(mode: OutputMode, line: &str) {
    match mode {
        OutputMode::Log => {
            if !line.trim().is_empty() {
                info!("{}", line);
            }
        }
        OutputMode::Console => {
            let line = line.replace("\x1b[0m\x1b[0m", "");

            if line.contains("-x32 (remote-exec)") {
                println!("{}", line.cyan());
            } else if line.contains("-x48 (remote-exec)") {
                println!("{}", line.magenta());
            } else if line.contains("-x64 (remote-exec)") {
                println!("{}", line.blue());
            } else {
                println!("{}", line);
            }
        }
    }
}

/// Read a terraform state file
pub fn read_state(path: &Path) -> Result<ProvisionedState> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ProvisionedState::default()),
        Err(e) => return Err(e.into()),
    };

    parse_state(&data).map_err(|source| TerrafarmError::StateCorrupted {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse terraform state JSON (legacy `modules` layout or v4 `resources`)
pub fn parse_state(data: &[u8]) -> std::result::Result<ProvisionedState, serde_json::Error> {
    let raw: RawState = serde_json::from_slice(data)?;

    let mut state = ProvisionedState::default();

    for module in &raw.modules {
        state.resources += module.resources.len();

        for resource in module.resources.values() {
            if resource.kind != DROPLET_RESOURCE {
                continue;
            }
            if let Some(primary) = &resource.primary {
                push_node(&mut state.nodes, primary.attributes.get("name"), primary.attributes.get("ipv4_address"));
            }
        }
    }

    for resource in &raw.resources {
        if resource.mode.as_deref() == Some("data") {
            continue;
        }

        state.resources += 1;

        if resource.kind != DROPLET_RESOURCE {
            continue;
        }

        for instance in &resource.instances {
            let attr = |key: &str| {
                instance
                    .attributes
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };
            push_node(&mut state.nodes, attr("name").as_ref(), attr("ipv4_address").as_ref());
        }
    }

    state.nodes.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(state)
}

fn push_node(nodes: &mut Vec<FarmNode>, name: Option<&String>, ip: Option<&String>) {
    if let (Some(name), Some(ip)) = (name, ip) {
        nodes.push(FarmNode {
            name: name.clone(),
            ip: ip.clone(),
        });
    }
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(default)]
    modules: Vec<RawModule>,
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    #[serde(default)]
    resources: BTreeMap<String, RawLegacyResource>,
}

#[derive(Debug, Deserialize)]
struct RawLegacyResource {
    #[serde(rename = "type", default)]
    kind: String,
    primary: Option<RawPrimary>,
}

#[derive(Debug, Deserialize)]
struct RawPrimary {
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(default)]
    mode: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

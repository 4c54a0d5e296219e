//! Farm helpers: templates, destroy, node export and usage accounting

use crate::error::{Result, TerrafarmError};
use crate::prefs::{Credentials, Preferences};
use crate::remote::{Arch, NodeInfo};
use crate::state::StateStore;
use crate::terraform::Provisioner;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Farm template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    /// Template (directory) name
    pub name: String,
    /// Number of build nodes the template creates
    pub builders: usize,
}

/// Templates available in the data directory, sorted by name
pub fn list_templates(data_dir: &Path) -> Result<Vec<TemplateInfo>> {
    let mut templates = Vec::new();

    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;

        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();

        if name.starts_with('.') {
            continue;
        }

        templates.push(TemplateInfo {
            builders: count_builders(&entry.path())?,
            name,
        });
    }

    templates.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(templates)
}

/// Number of `builder*.tf` files in a template directory
pub fn count_builders(dir: &Path) -> Result<usize> {
    let mut count = 0;

    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();

        if name.starts_with("builder") && name.ends_with(".tf") {
            count += 1;
        }
    }

    Ok(count)
}

/// Result of [`destroy_farm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Resources were destroyed
    Destroyed,
    /// Terraform state held no resources
    NothingToDestroy,
}

/// Destroy the farm with the template it was created from.
///
/// Repeating it is a no-op: once the Terraform state is empty only the farm
/// state is removed and [`DestroyOutcome::NothingToDestroy`] is returned.
/// `prefs` supplies the live credentials; everything else comes from the
/// farm state when it is readable.
pub async fn destroy_farm<P: Provisioner>(
    provisioner: &P,
    store: &StateStore,
    prefs: &Preferences,
) -> Result<DestroyOutcome> {
    if provisioner.state()?.is_empty() {
        store.delete_farm()?;
        return Ok(DestroyOutcome::NothingToDestroy);
    }

    let prefs = match store.read_farm() {
        Ok(Some(farm)) => farm.preferences.with_credentials(&Credentials::from(prefs)),
        Ok(None) => prefs.clone(),
        Err(e) => {
            debug!("Ignoring farm state: {}", e);
            prefs.clone()
        }
    };

    provisioner.destroy(&prefs).await?;
    store.delete_farm()?;

    info!("Farm with template {} destroyed", prefs.template);

    Ok(DestroyOutcome::Destroyed)
}

/// Node list in the build tool format: `user:password@ip~arch`, one per line.
///
/// Nodes are ordered i386, i686, x86_64; x86_64 nodes carry no arch suffix.
pub fn render_export(nodes: &[NodeInfo], user: &str, password: &str) -> String {
    let mut sorted: Vec<&NodeInfo> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.arch.cmp(&b.arch).then_with(|| a.name.cmp(&b.name)));

    let mut out = String::new();

    for node in sorted {
        out.push_str(&format!("{}:{}@{}", user, password, node.ip));

        if node.arch != Arch::X86_64 {
            out.push('~');
            out.push_str(node.arch.as_str());
        }

        out.push('\n');
    }

    out
}

/// Write the node list to `path`, replacing an existing file
pub fn export_nodes(path: &Path, nodes: &[NodeInfo], user: &str, password: &str) -> Result<()> {
    if path.is_dir() {
        return Err(TerrafarmError::config(format!(
            "Output path {} must be path to file",
            path.display()
        )));
    }

    fs::write(path, render_export(nodes, user, password))?;

    info!("Nodes info exported to {}", path.display());

    Ok(())
}

/// How long a farm ran and roughly what it cost
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEstimate {
    /// Farm lifetime in seconds
    pub lifetime: i64,
    /// Billed hours (rounded up)
    pub hours: i64,
    /// Number of nodes
    pub nodes: usize,
    /// Estimated total cost, when the node price is known
    pub cost: Option<f64>,
}

/// Estimate usage for a farm started at `started` and gone at `now`
pub fn usage_estimate(started: i64, now: i64, nodes: usize, price_hourly: Option<f64>) -> UsageEstimate {
    let lifetime = now.saturating_sub(started).max(0);
    let hours = (lifetime + 3599) / 3600;

    UsageEstimate {
        lifetime,
        hours,
        nodes,
        cost: price_hourly.map(|price| nodes as f64 * hours as f64 * price),
    }
}

impl fmt::Display for UsageEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifetime = humantime::format_duration(Duration::from_secs(self.lifetime as u64));

        write!(f, "Farm usage: {}", lifetime)?;

        if let Some(cost) = self.cost {
            write!(
                f,
                " ({} nodes × {}h), approximate cost ${:.2}",
                self.nodes, self.hours, cost
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::NodeState;
    use crate::terraform::{FarmNode, OutputMode, TerraformRunner};
    use tempfile::TempDir;

    fn create_test_node(name: &str, ip: &str) -> NodeInfo {
        NodeInfo::new(&FarmNode {
            name: name.to_string(),
            ip: ip.to_string(),
        })
        .with_state(NodeState::Inactive)
    }

    #[test]
    fn test_render_export_orders_by_arch() {
        let nodes = vec![
            create_test_node("terrafarm-c7-x64", "10.0.0.3"),
            create_test_node("terrafarm-c7-x48", "10.0.0.2"),
            create_test_node("terrafarm-c7-x32", "10.0.0.1"),
        ];

        assert_eq!(
            render_export(&nodes, "builder", "pw"),
            "builder:pw@10.0.0.1~i386\nbuilder:pw@10.0.0.2~i686\nbuilder:pw@10.0.0.3\n"
        );
    }

    #[test]
    fn test_export_nodes_rejects_directory() {
        let dir = TempDir::new().unwrap();
        assert!(export_nodes(dir.path(), &[], "builder", "pw").is_err());

        let file = dir.path().join("nodes.list");
        fs::write(&file, "old").unwrap();
        export_nodes(&file, &[create_test_node("terrafarm-c7-x64", "10.0.0.3")], "builder", "pw").unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "builder:pw@10.0.0.3\n");
    }

    #[test]
    fn test_list_templates() {
        let dir = TempDir::new().unwrap();
        let c7 = dir.path().join("c7-multiarch");
        fs::create_dir(&c7).unwrap();
        for file in ["builder-x32.tf", "builder-x48.tf", "builder-x64.tf", "provider.tf"] {
            fs::write(c7.join(file), "").unwrap();
        }
        fs::create_dir(dir.path().join("c6")).unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("terraform.tfstate"), "{}").unwrap();

        let templates = list_templates(dir.path()).unwrap();
        assert_eq!(
            templates,
            vec![
                TemplateInfo { name: "c6".to_string(), builders: 0 },
                TemplateInfo { name: "c7-multiarch".to_string(), builders: 3 },
            ]
        );
    }

    /// Terraform stand-in that counts runs and leaves an empty state behind
    fn create_fake_terraform(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-terraform");
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
echo "$1" >> "{calls}"
for a in "$@"; do case "$a" in -state=*) echo '{{"version": 4, "resources": []}}' > "${{a#-state=}}";; esac; done
exit 0
"#,
                calls = dir.join("calls").display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_destroy_farm_twice_is_a_noop() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("c7")).unwrap();
        let store = StateStore::new(dir.path());

        fs::write(
            store.terraform_state_path(),
            r#"{"version": 4, "resources": [{"mode": "managed", "type": "digitalocean_droplet",
                "name": "builder-x64", "instances": [{"attributes": {"name": "terrafarm-c7-x64", "ipv4_address": "10.0.0.3"}}]}]}"#,
        )
        .unwrap();

        let prefs = Preferences {
            token: "t".repeat(64),
            fingerprint: "aa:bb".to_string(),
            template: "c7".to_string(),
            ..Default::default()
        };
        store.save_farm(&crate::state::FarmState::new(&prefs, 0, None)).unwrap();

        let runner = TerraformRunner::new(dir.path(), store.terraform_state_path(), OutputMode::Log)
            .with_binary(create_fake_terraform(dir.path()));

        assert_eq!(
            destroy_farm(&runner, &store, &prefs).await.unwrap(),
            DestroyOutcome::Destroyed
        );
        assert!(store.read_farm().unwrap().is_none());

        assert_eq!(
            destroy_farm(&runner, &store, &prefs).await.unwrap(),
            DestroyOutcome::NothingToDestroy
        );
        assert_eq!(fs::read_to_string(dir.path().join("calls")).unwrap(), "destroy\n");
    }

    #[tokio::test]
    async fn test_destroy_farm_without_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let runner = TerraformRunner::new(dir.path(), store.terraform_state_path(), OutputMode::Log)
            .with_binary(dir.path().join("never-run"));

        assert_eq!(
            destroy_farm(&runner, &store, &Preferences::default()).await.unwrap(),
            DestroyOutcome::NothingToDestroy
        );
    }

    #[test]
    fn test_usage_estimate() {
        let estimate = usage_estimate(0, 2 * 3600 + 60, 3, Some(0.25));
        assert_eq!(estimate.hours, 3);
        assert_eq!(estimate.cost, Some(2.25));
        assert!(estimate.to_string().contains("$2.25"));

        let estimate = usage_estimate(0, 3600, 3, None);
        assert_eq!(estimate.hours, 1);
        assert_eq!(estimate.cost, None);
        assert_eq!(estimate.to_string(), "Farm usage: 1h");
    }
}

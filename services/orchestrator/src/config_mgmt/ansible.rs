use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use vmfleet_id::Ulid;

use super::{is_role_removal, ConfigMgmtError, RoleReport, RoleRunner, RoleTarget};

#[derive(Debug, Clone)]
pub struct AnsibleConfig {
    pub binary: PathBuf,
    /// Directory holding `<role>.yml` playbooks.
    pub playbook_dir: PathBuf,
    /// Where rendered inventories are written.
    pub inventory_dir: PathBuf,
    pub timeout: Duration,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ansible-playbook"),
            playbook_dir: PathBuf::from("playbooks"),
            inventory_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(900),
        }
    }
}

pub struct AnsibleRunner {
    config: AnsibleConfig,
}

/// Role names map to file names, so only a conservative charset is allowed.
fn valid_role_name(role: &str) -> bool {
    !role.is_empty()
        && !role.starts_with('.')
        && role
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// JSON inventory with one group holding every target. Values are
/// encoded, so passwords may contain any character.
pub fn render_inventory(targets: &[RoleTarget]) -> String {
    let hosts: serde_json::Map<String, serde_json::Value> = targets
        .iter()
        .map(|target| {
            let mut vars = serde_json::Map::new();
            vars.insert(
                "ansible_host".to_string(),
                json!(target.address.as_deref().unwrap_or(&target.name)),
            );
            if let Some(user) = &target.username {
                vars.insert("ansible_user".to_string(), json!(user));
            }
            if let Some(password) = &target.password {
                vars.insert("ansible_password".to_string(), json!(password));
            }
            (target.name.clone(), serde_json::Value::Object(vars))
        })
        .collect();
    json!({ "fleet": { "hosts": hosts } }).to_string()
}

/// Playbook variables as one JSON document. `role` always names the role
/// being applied.
pub fn extra_vars(role: &str, vars: &BTreeMap<String, String>) -> String {
    let mut doc: serde_json::Map<String, serde_json::Value> = vars
        .iter()
        .map(|(key, value)| (key.clone(), json!(value)))
        .collect();
    doc.insert("role".to_string(), json!(role));
    serde_json::Value::Object(doc).to_string()
}

/// Create the inventory readable by the owner only; it holds credentials.
async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await
}

impl AnsibleRunner {
    pub fn new(config: AnsibleConfig) -> Self {
        Self { config }
    }

    pub fn playbook_path(&self, role: &str) -> PathBuf {
        self.config.playbook_dir.join(format!("{role}.yml"))
    }

    /// Full argument list for one playbook run.
    pub fn playbook_args(
        &self,
        inventory: &Path,
        targets: &[RoleTarget],
        role: &str,
        vars: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let hosts: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        vec![
            "-i".to_string(),
            inventory.display().to_string(),
            self.playbook_path(role).display().to_string(),
            "--limit".to_string(),
            hosts.join(","),
            "--extra-vars".to_string(),
            extra_vars(role, vars),
        ]
    }

    async fn run_playbook(&self, args: &[String], role: &str) -> Result<RoleReport, ConfigMgmtError> {
        let binary = self.config.binary.display().to_string();
        let child = Command::new(&self.config.binary)
            .args(args)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConfigMgmtError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ConfigMgmtError::Timeout {
                role: role.to_string(),
                secs: self.config.timeout.as_secs(),
            })?
            .map_err(|source| ConfigMgmtError::Spawn { binary, source })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(RoleReport {
            success: output.status.success(),
            skipped: false,
            log,
        })
    }
}

#[async_trait]
impl RoleRunner for AnsibleRunner {
    #[instrument(skip(self, targets, vars), fields(hosts = targets.len()))]
    async fn assign_role(
        &self,
        targets: &[RoleTarget],
        role: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<RoleReport, ConfigMgmtError> {
        if is_role_removal(Some(role)) || targets.is_empty() {
            debug!("nothing to run");
            return Ok(RoleReport::skipped());
        }
        if !valid_role_name(role) {
            return Err(ConfigMgmtError::InvalidRole(role.to_string()));
        }

        let playbook = self.playbook_path(role);
        if !tokio::fs::try_exists(&playbook).await.unwrap_or(false) {
            return Err(ConfigMgmtError::MissingPlaybook {
                role: role.to_string(),
                path: playbook.display().to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.config.inventory_dir)
            .await
            .map_err(ConfigMgmtError::Inventory)?;
        let inventory = self
            .config
            .inventory_dir
            .join(format!("vmfleet-inventory-{}.json", Ulid::new()));
        write_private(&inventory, &render_inventory(targets))
            .await
            .map_err(ConfigMgmtError::Inventory)?;

        let args = self.playbook_args(&inventory, targets, role, vars);
        let result = self.run_playbook(&args, role).await;

        if let Err(e) = tokio::fs::remove_file(&inventory).await {
            warn!(path = %inventory.display(), error = %e, "failed to remove inventory");
        }

        let report = result?;
        info!(success = report.success, "playbook finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, ip: Option<&str>) -> RoleTarget {
        RoleTarget {
            name: name.to_string(),
            address: ip.map(str::to_string),
            username: Some("ubuntu".to_string()),
            password: None,
        }
    }

    #[test]
    fn test_render_inventory() {
        let inventory = render_inventory(&[target("web-1", Some("10.0.0.5")), target("web-2", None)]);
        let doc: serde_json::Value = serde_json::from_str(&inventory).unwrap();
        assert_eq!(
            doc,
            json!({
                "fleet": { "hosts": {
                    "web-1": { "ansible_host": "10.0.0.5", "ansible_user": "ubuntu" },
                    "web-2": { "ansible_host": "web-2", "ansible_user": "ubuntu" }
                }}
            })
        );
    }

    #[test]
    fn test_inventory_keeps_awkward_passwords_intact() {
        let mut host = target("db-1", Some("10.0.0.9"));
        host.password = Some("correct horse=battery \"staple\"".to_string());

        let doc: serde_json::Value = serde_json::from_str(&render_inventory(&[host])).unwrap();
        assert_eq!(
            doc["fleet"]["hosts"]["db-1"]["ansible_password"],
            "correct horse=battery \"staple\""
        );
    }

    #[test]
    fn test_playbook_args_limit_and_extra_vars() {
        let runner = AnsibleRunner::new(AnsibleConfig {
            playbook_dir: PathBuf::from("/srv/playbooks"),
            ..Default::default()
        });
        let vars = BTreeMap::from([
            ("port".to_string(), "8080".to_string()),
            ("motd".to_string(), "managed by vmfleet".to_string()),
            ("role".to_string(), "ignored".to_string()),
        ]);

        let args = runner.playbook_args(
            Path::new("/tmp/inv.json"),
            &[target("web-1", None), target("web-2", None)],
            "nginx",
            &vars,
        );

        assert_eq!(
            &args[..6],
            &[
                "-i",
                "/tmp/inv.json",
                "/srv/playbooks/nginx.yml",
                "--limit",
                "web-1,web-2",
                "--extra-vars",
            ]
        );
        assert_eq!(args.len(), 7);
        let extra: serde_json::Value = serde_json::from_str(&args[6]).unwrap();
        assert_eq!(
            extra,
            json!({ "role": "nginx", "port": "8080", "motd": "managed by vmfleet" })
        );
    }

    #[test]
    fn test_role_names_are_restricted() {
        assert!(valid_role_name("nginx"));
        assert!(valid_role_name("web_server-v2"));
        assert!(!valid_role_name("../etc/passwd"));
        assert!(!valid_role_name("a/b"));
        assert!(!valid_role_name(".hidden"));
    }

    #[tokio::test]
    async fn test_empty_role_skips_playbook() {
        let runner = AnsibleRunner::new(AnsibleConfig {
            binary: PathBuf::from("/nonexistent/ansible-playbook"),
            ..Default::default()
        });
        let report = runner
            .assign_role(&[target("web-1", None)], "", &BTreeMap::new())
            .await
            .unwrap();
        assert!(report.skipped);
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_missing_playbook_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = AnsibleRunner::new(AnsibleConfig {
            playbook_dir: dir.path().to_path_buf(),
            inventory_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let err = runner
            .assign_role(&[target("web-1", None)], "nginx", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigMgmtError::MissingPlaybook { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_playbook_failure_is_reported_and_inventory_removed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("nginx.yml"), "- hosts: all\n").unwrap();
        let binary = dir.path().join("ansible-playbook");
        std::fs::write(&binary, "#!/bin/sh\necho 'fatal: unreachable'\nexit 4\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let inventories = dir.path().join("inv");

        let runner = AnsibleRunner::new(AnsibleConfig {
            binary,
            playbook_dir: dir.path().to_path_buf(),
            inventory_dir: inventories.clone(),
            timeout: Duration::from_secs(10),
        });
        let report = runner
            .assign_role(&[target("web-1", Some("10.0.0.5"))], "nginx", &BTreeMap::new())
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.log.contains("unreachable"));
        assert_eq!(std::fs::read_dir(&inventories).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inventory_is_private_while_playbook_runs() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("nginx.yml"), "- hosts: all\n").unwrap();
        // Report the inventory's mode and content from inside the run.
        let binary = dir.path().join("ansible-playbook");
        std::fs::write(
            &binary,
            "#!/bin/sh\nstat -c '%a' \"$2\"\ncat \"$2\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = AnsibleRunner::new(AnsibleConfig {
            binary,
            playbook_dir: dir.path().to_path_buf(),
            inventory_dir: dir.path().join("inv"),
            timeout: Duration::from_secs(10),
        });
        let mut host = target("web-1", Some("10.0.0.5"));
        host.password = Some("two words".to_string());
        let report = runner.assign_role(&[host], "nginx", &BTreeMap::new()).await.unwrap();

        assert!(report.success, "{}", report.log);
        assert!(report.log.starts_with("600\n"), "{}", report.log);
        assert!(report.log.contains(r#""ansible_password":"two words""#), "{}", report.log);
    }
}

//! Distro entity: the named template worker hosts are built from.

use serde::{Deserialize, Serialize};

/// SSH connection options for hosts of a distro.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshOptions {
    /// Login user.
    #[serde(default)]
    pub user: String,

    /// Port, when not 22.
    #[serde(default)]
    pub port: Option<u16>,

    /// Extra `-o` options passed verbatim to ssh.
    #[serde(default)]
    pub options: Vec<String>,

    /// Path to the identity file.
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Named worker template: provider, scripts, and capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distro {
    /// Unique identifier, e.g. `linux-64`.
    pub id: String,

    /// Cloud provider hosts of this distro are spawned on.
    pub provider: String,

    /// Opaque provider-specific settings (image, size, region, ...).
    #[serde(default)]
    pub provider_settings: serde_json::Value,

    /// SSH options for reachability checks and script execution.
    #[serde(default)]
    pub ssh: SshOptions,

    /// Script run after the instance boots.
    #[serde(default)]
    pub setup_script: String,

    /// Script run before the instance is terminated.
    #[serde(default)]
    pub teardown_script: String,

    /// Hard cap on concurrently up hosts of this distro.
    pub max_hosts: usize,

    /// Working directory tasks execute in on the host.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Target architecture, e.g. `linux_amd64`.
    #[serde(default)]
    pub arch: String,
}

fn default_work_dir() -> String {
    "/data/mci".to_string()
}

impl Distro {
    /// Create a distro with the given id, provider and host cap.
    #[must_use]
    pub fn new(id: impl Into<String>, provider: impl Into<String>, max_hosts: usize) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            provider_settings: serde_json::Value::Null,
            ssh: SshOptions::default(),
            setup_script: String::new(),
            teardown_script: String::new(),
            max_hosts,
            work_dir: default_work_dir(),
            arch: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distro_defaults() {
        let distro = Distro::new("linux-64", "mock", 10);
        assert_eq!(distro.work_dir, "/data/mci");
        assert!(distro.teardown_script.is_empty());
    }

    #[test]
    fn test_distro_yaml_round_trip() {
        let yaml = r#"
id: linux-64
provider: static
max_hosts: 4
ssh:
  user: mci
  options: ["StrictHostKeyChecking=no"]
"#;
        let distro: Distro = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(distro.ssh.user, "mci");
        assert_eq!(distro.max_hosts, 4);
    }
}

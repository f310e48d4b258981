//! Service settings.
//!
//! A single YAML file, defaulting to [`DEFAULT_SETTINGS_FILE`], carries
//! the configuration for every MCI process. Sections are optional and fall
//! back to serde defaults; `validate` enforces the few cross-section
//! rules (exactly one auth backend, sane intervals).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default settings file path.
pub const DEFAULT_SETTINGS_FILE: &str = "/etc/mci_settings.yml";

/// Error types for settings loading.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The file could not be read.
    #[error("could not read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid YAML for the settings shape.
    #[error("could not parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The settings are structurally valid but semantically wrong.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Database connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbSettings {
    /// Connection URL.
    #[serde(default)]
    pub url: String,

    /// Database name.
    #[serde(default)]
    pub name: String,
}

/// API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP listen address.
    #[serde(default = "default_api_listen")]
    pub listen_addr: String,

    /// HTTPS listen address, when TLS is configured.
    #[serde(default)]
    pub https_listen_addr: Option<String>,

    /// Path to the TLS certificate.
    #[serde(default)]
    pub https_cert: Option<String>,

    /// Path to the TLS key.
    #[serde(default)]
    pub https_key: Option<String>,

    /// Log file, empty for stdout.
    #[serde(default)]
    pub log_file: String,
}

fn default_api_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_api_listen(),
            https_listen_addr: None,
            https_cert: None,
            https_key: None,
            log_file: String::new(),
        }
    }
}

/// UI server settings. The UI itself is external; the control plane only
/// needs the base URL for links and the session secret for validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    /// Public base URL.
    #[serde(default)]
    pub url: String,

    /// Session encryption secret.
    #[serde(default)]
    pub secret: String,

    /// HTTP listen address.
    #[serde(default)]
    pub listen_addr: String,
}

/// Users for the naive auth backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    /// Login name.
    pub username: String,

    /// Password (already hashed in real deployments).
    pub password: String,

    /// Display name.
    #[serde(default)]
    pub display_name: String,
}

/// Naive auth backend: a static user list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NaiveAuthConfig {
    /// The users.
    #[serde(default)]
    pub users: Vec<AuthUser>,
}

/// Crowd auth backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrowdAuthConfig {
    /// Service account user.
    #[serde(default)]
    pub username: String,

    /// Service account password.
    #[serde(default)]
    pub password: String,

    /// Crowd server URL root.
    #[serde(default)]
    pub url_root: String,
}

/// GitHub OAuth backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubAuthConfig {
    /// OAuth client id.
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret.
    #[serde(default)]
    pub client_secret: String,

    /// Organization whose members may log in.
    #[serde(default)]
    pub organization: String,
}

/// Auth settings: exactly one backend must be configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Naive backend.
    #[serde(default)]
    pub naive: Option<NaiveAuthConfig>,

    /// Crowd backend.
    #[serde(default)]
    pub crowd: Option<CrowdAuthConfig>,

    /// GitHub backend.
    #[serde(default)]
    pub github: Option<GithubAuthConfig>,
}

/// SMTP settings for the notifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Server hostname.
    #[serde(default)]
    pub server: String,

    /// Server port.
    #[serde(default)]
    pub port: u16,

    /// Sender address.
    #[serde(default)]
    pub from: String,

    /// Admin addresses for operational alerts.
    #[serde(default)]
    pub admin_email: Vec<String>,
}

/// Notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// SMTP transport.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Target turnaround window used to turn queued duration into a host
    /// count.
    #[serde(default = "default_turnaround", with = "humantime_serde")]
    pub turnaround_window: Duration,

    /// Log file, empty for stdout.
    #[serde(default)]
    pub log_file: String,
}

fn default_turnaround() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            turnaround_window: default_turnaround(),
            log_file: String::new(),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunnerConfig {
    /// Directory holding agent binaries per arch.
    #[serde(default = "default_executables_dir")]
    pub agent_executables_dir: String,

    /// Log file, empty for stdout.
    #[serde(default)]
    pub log_file: String,
}

fn default_executables_dir() -> String {
    "/usr/local/mci/agents".to_string()
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            agent_executables_dir: default_executables_dir(),
            log_file: String::new(),
        }
    }
}

/// Host allocator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInitConfig {
    /// Cap on hosts provisioned concurrently in one pass.
    #[serde(default = "default_provision_concurrency")]
    pub provision_concurrency: usize,

    /// Log file, empty for stdout.
    #[serde(default)]
    pub log_file: String,
}

const fn default_provision_concurrency() -> usize {
    16
}

impl Default for HostInitConfig {
    fn default() -> Self {
        Self {
            provision_concurrency: default_provision_concurrency(),
            log_file: String::new(),
        }
    }
}

/// Monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long a free host may idle before it is flagged.
    #[serde(default = "default_idle_threshold", with = "humantime_serde")]
    pub idle_threshold: Duration,

    /// How long provisioning may run before the host is flagged.
    #[serde(default = "default_provision_timeout", with = "humantime_serde")]
    pub provision_timeout: Duration,

    /// Grace window an unreachable host gets before it is flagged.
    #[serde(default = "default_unreachable_grace", with = "humantime_serde")]
    pub unreachable_grace: Duration,

    /// Heartbeat age after which a running task is reset.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Log file, empty for stdout.
    #[serde(default)]
    pub log_file: String,
}

fn default_idle_threshold() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_provision_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_unreachable_grace() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(7 * 60)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_threshold: default_idle_threshold(),
            provision_timeout: default_provision_timeout(),
            unreachable_grace: default_unreachable_grace(),
            heartbeat_timeout: default_heartbeat_timeout(),
            log_file: String::new(),
        }
    }
}

/// Background runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Interval between loop passes.
    #[serde(default = "default_runner_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_runner_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval: default_runner_interval(),
        }
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Database connection.
    #[serde(default)]
    pub database: DbSettings,

    /// API server.
    #[serde(default)]
    pub api: ApiConfig,

    /// UI server.
    #[serde(default)]
    pub ui: UiConfig,

    /// Authentication backends.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cloud providers, keyed by provider name; values are opaque to the
    /// core and interpreted by each manager.
    #[serde(default)]
    pub providers: HashMap<String, serde_yaml::Value>,

    /// Notifications.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Dispatcher.
    #[serde(default)]
    pub taskrunner: TaskRunnerConfig,

    /// Host allocator.
    #[serde(default)]
    pub hostinit: HostInitConfig,

    /// Monitor.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Background runner.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Global default expansions, merged under project expansions.
    #[serde(default)]
    pub expansions: HashMap<String, String>,

    /// Per-plugin opaque configuration maps.
    #[serde(default)]
    pub plugins: HashMap<String, serde_yaml::Value>,

    /// Users with administrative rights.
    #[serde(default)]
    pub superusers: Vec<String>,
}

impl Settings {
    /// Load settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Enforce cross-section rules.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] when a rule is violated.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let backends = [
            self.auth.naive.is_some(),
            self.auth.crowd.is_some(),
            self.auth.github.is_some(),
        ]
        .iter()
        .filter(|configured| **configured)
        .count();
        if backends != 1 {
            return Err(SettingsError::Invalid(format!(
                "exactly one auth backend must be configured, found {backends}"
            )));
        }
        if self.runner.interval.is_zero() {
            return Err(SettingsError::Invalid(
                "runner.interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"
auth:
  naive:
    users:
      - username: admin
        password: secret
"#;

    #[test]
    fn test_minimal_settings_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.api.listen_addr, "0.0.0.0:8080");
        assert_eq!(settings.runner.interval, Duration::from_secs(60));
        assert_eq!(
            settings.monitor.idle_threshold,
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn test_exactly_one_auth_backend() {
        let none: Settings = serde_yaml::from_str("{}").unwrap();
        assert!(none.validate().is_err());

        let two: Settings = serde_yaml::from_str(
            r#"
auth:
  naive:
    users: []
  github:
    client_id: abc
"#,
        )
        .unwrap();
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_durations_parse_as_humantime() {
        let settings: Settings = serde_yaml::from_str(
            r#"
auth:
  naive:
    users: []
monitor:
  idle_threshold: 20m
runner:
  interval: 15s
"#,
        )
        .unwrap();
        assert_eq!(
            settings.monitor.idle_threshold,
            Duration::from_secs(20 * 60)
        );
        assert_eq!(settings.runner.interval, Duration::from_secs(15));
    }
}

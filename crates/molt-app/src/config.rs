//! Settings management
//!
//! Handles locating, loading, migrating and saving the settings file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use molt_core::GroupLimits;

/// Current settings layout
pub const SCHEMA_VERSION: u32 = 2;

/// File name of the upgrade endpoint inside the runtime directory
const ENDPOINT_NAME: &str = "molt-upgrade.sock";

/// Settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// Complete settings record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Layout version of the file this was read from
    pub schema: u32,
    /// Version discovery and hand-off
    pub upgrade: UpgradeConfig,
    /// Process group limits
    pub supervisor: SupervisorConfig,
    /// Processes started into the group at startup
    #[serde(rename = "process", skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            upgrade: UpgradeConfig::default(),
            supervisor: SupervisorConfig::default(),
            processes: Vec::new(),
        }
    }
}

impl Settings {
    pub fn distribution_root(&self) -> &Path {
        &self.upgrade.distribution_root
    }

    pub fn ping_url(&self) -> &str {
        &self.upgrade.ping_url
    }

    /// Check the fields a monitoring instance cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upgrade.distribution_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "upgrade.distribution_root is not set".into(),
            ));
        }
        if self.upgrade.marker.is_empty() {
            return Err(ConfigError::Invalid("upgrade.marker is empty".into()));
        }
        if let Some(process) = self.processes.iter().find(|p| p.command.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "process entry with args {:?} has no command",
                process.args
            )));
        }
        Ok(())
    }
}

/// Upgrade settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Shared location where releases are published, one directory per version
    pub distribution_root: PathBuf,
    /// Reachability check URL for the distribution host (informational)
    pub ping_url: String,
    /// Release executable name (None = name of the running executable)
    pub executable: Option<String>,
    /// File that must accompany the executable in a release directory
    pub marker: String,
    /// Seconds between checks for a newer release
    pub check_interval_secs: u64,
    /// How long the old instance waits for the new one to confirm
    pub handshake_timeout_ms: u64,
    /// Upgrade endpoint path (None = runtime directory default)
    pub endpoint: Option<PathBuf>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            distribution_root: PathBuf::new(),
            ping_url: String::new(),
            executable: None,
            marker: "release.ok".into(),
            check_interval_secs: 300,
            handshake_timeout_ms: 5000,
            endpoint: None,
        }
    }
}

impl UpgradeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Endpoint path, falling back to the well-known default
    pub fn endpoint_path(&self) -> PathBuf {
        self.endpoint.clone().unwrap_or_else(default_endpoint)
    }
}

/// Process group settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Name the group is known by in logs
    pub group_name: String,
    /// Maximum number of live processes (0 = unlimited)
    pub max_active: usize,
    /// CPU seconds per process (0 = unlimited)
    pub cpu_seconds: u64,
    /// Address space per process in bytes (0 = unlimited)
    pub memory_bytes: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            group_name: "molt-workers".into(),
            max_active: 0,
            cpu_seconds: 0,
            memory_bytes: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn limits(&self) -> GroupLimits {
        GroupLimits {
            max_active: self.max_active,
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_bytes,
        }
    }
}

/// A process to run under supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn build_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.command);
        command.args(&self.args);
        if let Some(ref dir) = self.working_directory {
            command.current_dir(dir);
        }
        command
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "molt", "molt")
}

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|p| p.config_dir().to_path_buf())
}

/// Get the settings file path
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}

/// Get the event log path
pub fn event_log_path() -> Option<PathBuf> {
    project_dirs().map(|p| p.data_dir().join("molt.log"))
}

/// Well-known upgrade endpoint shared by old and new instances
pub fn default_endpoint() -> PathBuf {
    project_dirs()
        .and_then(|p| p.runtime_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join(ENDPOINT_NAME)
}

/// Load settings from `path`; a missing file yields the defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    Ok(load_and_migrate(path)?.0)
}

/// Load settings and report whether the file used an older layout
pub fn load_and_migrate(path: &Path) -> Result<(Settings, bool), ConfigError> {
    if !path.exists() {
        return Ok((Settings::default(), false));
    }

    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

/// Parse settings text, lifting legacy layouts to the current schema
pub fn parse_settings(content: &str) -> Result<(Settings, bool), ConfigError> {
    let mut table: toml::Table = toml::from_str(content)?;

    let schema = match table.get("schema") {
        None => 1,
        Some(toml::Value::Integer(n)) => u32::try_from(*n)
            .map_err(|_| ConfigError::Invalid(format!("schema {} out of range", n)))?,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "schema must be an integer, found {}",
                other.type_str()
            )))
        }
    };
    if schema > SCHEMA_VERSION {
        return Err(ConfigError::Invalid(format!(
            "schema {} is newer than supported ({})",
            schema, SCHEMA_VERSION
        )));
    }

    let migrated = schema < SCHEMA_VERSION;
    if migrated {
        migrate_v1(&mut table)?;
    }

    let settings: Settings = toml::Value::Table(table).try_into()?;
    Ok((settings, migrated))
}

/// Schema 1 kept the upgrade keys at the top level
fn migrate_v1(table: &mut toml::Table) -> Result<(), ConfigError> {
    let mut upgrade = match table.remove("upgrade") {
        Some(toml::Value::Table(t)) => t,
        Some(_) => return Err(ConfigError::Invalid("[upgrade] must be a table".into())),
        None => toml::Table::new(),
    };

    for key in ["distribution_root", "ping_url"] {
        if let Some(value) = table.remove(key) {
            upgrade.entry(key).or_insert(value);
        }
    }

    table.insert("upgrade".into(), toml::Value::Table(upgrade));
    table.insert("schema".into(), toml::Value::Integer(SCHEMA_VERSION as i64));
    Ok(())
}

/// Save settings to `path`
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, &content)?;

    // Set restrictive permissions on the settings file
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    Ok(())
}

/// Load settings and rewrite the file if it used an older layout
pub fn load_and_upgrade_file(path: &Path) -> Result<Settings, ConfigError> {
    let (settings, migrated) = load_and_migrate(path)?;
    if migrated {
        log::info!(
            "Migrating settings file {} to schema {}",
            path.display(),
            SCHEMA_VERSION
        );
        save_settings(path, &settings)?;
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.schema, SCHEMA_VERSION);
        assert_eq!(settings.upgrade.handshake_timeout(), Duration::from_millis(5000));
        assert_eq!(settings.upgrade.marker, "release.ok");
        assert!(settings.processes.is_empty());
        assert_eq!(settings.supervisor.limits(), GroupLimits::default());
    }

    #[test]
    fn test_parse_current_schema() {
        let text = r#"
schema = 2

[upgrade]
distribution_root = "/srv/molt/dist"
ping_url = "http://updates.local/ping"
handshake_timeout_ms = 250

[supervisor]
max_active = 4

[[process]]
command = "/usr/bin/worker"
args = ["--fast"]
"#;
        let (settings, migrated) = parse_settings(text).unwrap();
        assert!(!migrated);
        assert_eq!(settings.distribution_root(), Path::new("/srv/molt/dist"));
        assert_eq!(settings.ping_url(), "http://updates.local/ping");
        assert_eq!(settings.upgrade.handshake_timeout_ms, 250);
        assert_eq!(settings.upgrade.check_interval_secs, 300);
        assert_eq!(settings.supervisor.max_active, 4);
        assert_eq!(settings.processes.len(), 1);
        assert_eq!(settings.processes[0].args, vec!["--fast".to_string()]);
    }

    #[test]
    fn test_migrate_legacy_layout() {
        let text = r#"
distribution_root = "/mnt/share/dist"
ping_url = "http://old/ping"
"#;
        let (settings, migrated) = parse_settings(text).unwrap();
        assert!(migrated);
        assert_eq!(settings.schema, SCHEMA_VERSION);
        assert_eq!(settings.distribution_root(), Path::new("/mnt/share/dist"));
        assert_eq!(settings.ping_url(), "http://old/ping");
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::default();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        settings.upgrade.distribution_root = PathBuf::from("/srv/dist");
        assert!(settings.validate().is_ok());

        settings.processes.push(ProcessConfig::default());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_newer_schema() {
        let err = parse_settings("schema = 99").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            parse_settings("upgrade = ").unwrap_err(),
            ConfigError::Parse(_)
        ));
        assert!(parse_settings("schema = \"two\"").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_upgrade_file_rewrites_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "distribution_root = \"/dist\"\n").unwrap();

        let settings = load_and_upgrade_file(&path).unwrap();
        assert_eq!(settings.distribution_root(), Path::new("/dist"));

        let (reloaded, migrated) = load_and_migrate(&path).unwrap();
        assert!(!migrated);
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_endpoint_override() {
        let mut upgrade = UpgradeConfig::default();
        assert!(upgrade.endpoint_path().ends_with(ENDPOINT_NAME));

        upgrade.endpoint = Some(PathBuf::from("/tmp/custom.sock"));
        assert_eq!(upgrade.endpoint_path(), PathBuf::from("/tmp/custom.sock"));
    }
}

//! Daemon configuration

use anyhow::Context;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use wgwarden_common::{Allocator, CorruptPolicy, KeyProviderKind};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding peers.json, archive.json, last_ip.json, admins.json
    pub store_path: PathBuf,

    /// Operator API listen address
    pub listen: String,

    /// Client config template with %AD%, %PrK% and %PhK% tokens
    /// (default `<store_path>/template.conf`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,

    /// Where rendered client configs are written as `<id>.conf`
    /// (default `<store_path>/clients`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_dir: Option<PathBuf>,

    /// WireGuard interface configuration
    pub interface: InterfaceConfig,

    /// Key material configuration
    pub keys: KeysConfig,

    /// Daily job configuration
    pub schedule: ScheduleConfig,

    /// Reconciler configuration
    pub reconcile: ReconcileConfig,

    /// Store configuration
    pub store: StoreConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wgwarden_common::default_store_path(),
            template_path: None,
            clients_dir: None,
            listen: wgwarden_common::DEFAULT_LISTEN.to_string(),
            interface: InterfaceConfig::default(),
            keys: KeysConfig::default(),
            schedule: ScheduleConfig::default(),
            reconcile: ReconcileConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// WireGuard interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface name
    pub name: String,

    /// Allocation subnet
    pub subnet: Ipv4Network,

    /// Cursor value on a fresh store; the first peer gets the next address
    pub first_cursor: Ipv4Addr,

    /// Restart the service unit after a reconcile pass that changed anything
    pub restart_service_after_changes: bool,

    /// systemd unit; `{name}` expands to the interface name
    pub service_unit: String,

    /// Path to the `wg` binary
    pub wg_binary: String,

    /// Path to the `systemctl` binary
    pub systemctl_binary: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        let allocator = Allocator::default();
        Self {
            name: "wg0".to_string(),
            subnet: allocator.subnet(),
            first_cursor: allocator.first_cursor(),
            restart_service_after_changes: false,
            service_unit: "wg-quick@{name}".to_string(),
            wg_binary: "wg".to_string(),
            systemctl_binary: "systemctl".to_string(),
        }
    }
}

impl InterfaceConfig {
    pub fn service_unit(&self) -> String {
        self.service_unit.replace("{name}", &self.name)
    }
}

/// Key material configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub provider: KeyProviderKind,
}

/// Daily sweep and notification job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local time of day, `HH:MM`
    pub daily_at: String,

    /// Peers expiring within this many days are announced
    pub notify_window_days: i64,

    pub enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_at: "12:00".to_string(),
            notify_window_days: 3,
            enabled: true,
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upper bound on concurrent `wg` invocations
    pub max_in_flight: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { max_in_flight: 4 }
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub on_corrupt: CorruptPolicy,
}

impl DaemonConfig {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {:?}", path))?;
            let config: Self =
                toml::from_str(&content).with_context(|| format!("parsing config {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn template_path(&self) -> PathBuf {
        self.template_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("template.conf"))
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.clients_dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("clients"))
    }

    /// Allocator for the configured subnet
    pub fn allocator(&self) -> wgwarden_common::Result<Allocator> {
        Allocator::new(self.interface.subnet, self.interface.first_cursor)
    }

    /// Parsed `schedule.daily_at` (local wall-clock time)
    pub fn daily_at(&self) -> wgwarden_common::Result<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(self.schedule.daily_at.trim(), "%H:%M").map_err(|_| {
            wgwarden_common::Error::InvalidConfig(format!(
                "schedule.daily_at must be HH:MM, got {:?}",
                self.schedule.daily_at
            ))
        })
    }

    /// Check cross-field constraints before anything is started
    pub fn validate(&self) -> wgwarden_common::Result<()> {
        self.allocator()?;
        self.daily_at()?;
        if self.reconcile.max_in_flight == 0 {
            return Err(wgwarden_common::Error::InvalidConfig(
                "reconcile.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.schedule.notify_window_days < 0 {
            return Err(wgwarden_common::Error::InvalidConfig(
                "schedule.notify_window_days must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = DaemonConfig::load(&tmp.path().join("absent.toml")).unwrap();

        assert_eq!(config.listen, "127.0.0.1:7420");
        assert_eq!(config.interface.name, "wg0");
        assert_eq!(config.interface.service_unit(), "wg-quick@wg0");
        assert_eq!(config.keys.provider, KeyProviderKind::Toolkit);
        assert_eq!(config.store.on_corrupt, CorruptPolicy::Fail);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
store_path = "/srv/wg"

[interface]
name = "wg1"
subnet = "10.20.0.0/24"
first_cursor = "10.20.0.1"
restart_service_after_changes = true

[keys]
provider = "native"

[schedule]
daily_at = "09:30"

[store]
on_corrupt = "quarantine"
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/srv/wg"));
        assert_eq!(config.template_path(), PathBuf::from("/srv/wg/template.conf"));
        assert_eq!(config.clients_dir(), PathBuf::from("/srv/wg/clients"));
        assert_eq!(config.interface.service_unit(), "wg-quick@wg1");
        assert_eq!(config.keys.provider, KeyProviderKind::Native);
        assert_eq!(config.schedule.notify_window_days, 3);
        assert_eq!(config.reconcile.max_in_flight, 4);
        assert_eq!(config.store.on_corrupt, CorruptPolicy::Quarantine);
        assert_eq!(
            config.daily_at().unwrap(),
            chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert_eq!(
            config.allocator().unwrap().first_cursor(),
            Ipv4Addr::new(10, 20, 0, 1)
        );
    }

    #[test]
    fn test_paths_follow_store_unless_set() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "template_path = \"/etc/wgwarden/client.conf\"\n").unwrap();

        let mut config = DaemonConfig::load(&path).unwrap();
        // What `--store` does after loading
        config.store_path = PathBuf::from("/srv/other");

        assert_eq!(config.template_path(), PathBuf::from("/etc/wgwarden/client.conf"));
        assert_eq!(config.clients_dir(), PathBuf::from("/srv/other/clients"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.schedule.daily_at = "noon".to_string();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.interface.first_cursor = Ipv4Addr::new(192, 168, 1, 1);
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.reconcile.max_in_flight = 0;
        assert!(config.validate().is_err());
    }
}

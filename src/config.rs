use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::address::AddressFormat;
use crate::core::codec::CodecOptions;
use crate::core::error::Result;
use crate::core::live::KeyMode;
use crate::core::reconcile::ReconcileOptions;
use crate::facts::OsFamily;
use crate::utils::default_config_path;

/// Complete iptsync configuration
///
/// Every field has a default, so an empty `{}` file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_iptables")]
    pub iptables_command: String,
    #[serde(default = "default_iptables_save")]
    pub iptables_save_command: String,
    /// How addresses are rendered; `legacy` drops `/32`
    #[serde(default)]
    pub address_format: AddressFormat,
    /// Emit `-m icmp` before `--icmp-type`
    #[serde(default = "default_true")]
    pub icmp_module: bool,
    /// Match live rules by position as well as text
    #[serde(default = "default_true")]
    pub match_order: bool,
    /// Pass `-w` to iptables to wait for the xtables lock
    #[serde(default = "default_true")]
    pub wait_for_lock: bool,
    /// Run the persistence command after a pass that changed rules
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Overrides the persistence command picked from the OS family
    #[serde(default)]
    pub persist_command: Option<String>,
    /// Overrides OS family detection
    #[serde(default)]
    pub os_family: Option<OsFamily>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iptables_command: default_iptables(),
            iptables_save_command: default_iptables_save(),
            address_format: AddressFormat::default(),
            icmp_module: true,
            match_order: true,
            wait_for_lock: true,
            persist: true,
            persist_command: None,
            os_family: None,
        }
    }
}

fn default_iptables() -> String {
    "/sbin/iptables".to_string()
}

fn default_iptables_save() -> String {
    "/sbin/iptables-save".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            address_format: self.address_format,
            icmp_module: self.icmp_module,
        }
    }

    pub fn key_mode(&self) -> KeyMode {
        if self.match_order {
            KeyMode::Ordinal
        } else {
            KeyMode::Text
        }
    }

    pub fn reconcile_options(&self, dry_run: bool) -> ReconcileOptions {
        ReconcileOptions {
            codec: self.codec_options(),
            mode: self.key_mode(),
            dry_run,
            persist: self.persist,
        }
    }

    /// Applies `IPTSYNC_IPTABLES_COMMAND` and `IPTSYNC_IPTABLES_SAVE_COMMAND`.
    fn apply_env(mut self) -> Self {
        if let Ok(cmd) = std::env::var("IPTSYNC_IPTABLES_COMMAND")
            && !cmd.is_empty()
        {
            self.iptables_command = cmd;
        }
        if let Ok(cmd) = std::env::var("IPTSYNC_IPTABLES_SAVE_COMMAND")
            && !cmd.is_empty()
        {
            self.iptables_save_command = cmd;
        }
        self
    }
}

/// Parses a config file body.
pub fn parse_config(json: &str) -> Result<Config> {
    Ok(serde_json::from_str(json)?)
}

/// Loads the config from `path`, or from `~/.config/iptsync/config.json`.
///
/// A missing file yields the defaults; a malformed one is an error.
/// Environment overrides are applied last.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map(Path::to_path_buf).or_else(default_config_path);
    let config = match path {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                debug!("Loaded config from {}", path.display());
                parse_config(&json)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Config::default()
            }
            Err(e) => return Err(e.into()),
        },
        None => Config::default(),
    };
    Ok(config.apply_env())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(parse_config("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config() {
        let config = parse_config(
            r#"{"address_format": "legacy", "icmp_module": false, "match_order": false, "os_family": "debian"}"#,
        )
        .unwrap();
        assert_eq!(config.address_format, AddressFormat::Legacy);
        assert!(!config.codec_options().icmp_module);
        assert_eq!(config.key_mode(), KeyMode::Text);
        assert_eq!(config.os_family, Some(OsFamily::Debian));
        assert_eq!(config.iptables_command, "/sbin/iptables");
    }

    #[test]
    fn test_unknown_field_is_error() {
        assert!(parse_config(r#"{"iptables": "/bin/true"}"#).is_err());
    }

    #[test]
    fn test_reconcile_options_projection() {
        let config = Config {
            persist: false,
            ..Config::default()
        };
        let options = config.reconcile_options(true);
        assert!(options.dry_run);
        assert!(!options.persist);
        assert_eq!(options.mode, KeyMode::Ordinal);
    }

    #[tokio::test]
    async fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"iptables_command": "/usr/sbin/iptables"}"#).unwrap();

        let config = {
            let _guard = ENV_VAR_MUTEX.lock().unwrap();
            unsafe {
                std::env::set_var("IPTSYNC_IPTABLES_SAVE_COMMAND", "/opt/save");
            }
            let json = std::fs::read_to_string(&path).unwrap();
            let config = parse_config(&json).unwrap().apply_env();
            unsafe {
                std::env::remove_var("IPTSYNC_IPTABLES_SAVE_COMMAND");
            }
            config
        };
        assert_eq!(config.iptables_command, "/usr/sbin/iptables");
        assert_eq!(config.iptables_save_command, "/opt/save");
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json")))
            .await
            .unwrap();
        assert_eq!(config.persist_command, None);
        assert!(config.wait_for_lock);
    }

    #[tokio::test]
    async fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(&path)).await.is_err());
    }
}

//! Host facts: OS family, persistence command, iptables version
//!
//! The OS family picks the command that saves the live rules for the next
//! boot. Detection reads `/etc/os-release`; the config can override it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Distribution family, as far as rule persistence is concerned
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OsFamily {
    Redhat,
    Debian,
    Gentoo,
    #[default]
    Unknown,
}

impl OsFamily {
    /// Maps an os-release `ID` (or one `ID_LIKE` word) to a family.
    pub fn from_id(id: &str) -> Self {
        match id.trim().trim_matches('"').to_lowercase().as_str() {
            "fedora" | "redhat" | "rhel" | "centos" | "rocky" | "almalinux" => OsFamily::Redhat,
            "debian" | "ubuntu" => OsFamily::Debian,
            "gentoo" => OsFamily::Gentoo,
            _ => OsFamily::Unknown,
        }
    }

    /// Command that saves the live rules for the next boot.
    pub const fn persist_command(self) -> Option<&'static str> {
        match self {
            OsFamily::Redhat => Some("/sbin/service iptables save"),
            OsFamily::Debian => Some("/etc/init.d/iptables-persistent save"),
            OsFamily::Gentoo => Some("/etc/init.d/iptables save"),
            OsFamily::Unknown => None,
        }
    }
}

fn os_release_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

/// Family from the contents of an os-release file: `ID` first, then each
/// word of `ID_LIKE`.
pub fn family_from_os_release(text: &str) -> OsFamily {
    let by_id = os_release_value(text, "ID").map_or(OsFamily::Unknown, OsFamily::from_id);
    if by_id != OsFamily::Unknown {
        return by_id;
    }
    os_release_value(text, "ID_LIKE")
        .into_iter()
        .flat_map(str::split_whitespace)
        .map(OsFamily::from_id)
        .find(|family| *family != OsFamily::Unknown)
        .unwrap_or_default()
}

/// Detects the family of the running host.
pub async fn detect_os_family() -> OsFamily {
    for path in ["/etc/os-release", "/usr/lib/os-release"] {
        if let Ok(text) = tokio::fs::read_to_string(Path::new(path)).await {
            let family = family_from_os_release(&text);
            debug!("OS family from {path}: {family}");
            return family;
        }
    }
    OsFamily::Unknown
}

/// Extracts `1.8.10` from `iptables v1.8.10 (nf_tables)`.
pub fn parse_iptables_version(output: &str) -> Option<String> {
    output.split_whitespace().find_map(|word| {
        let version = word.strip_prefix('v')?;
        (!version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.'))
            .then(|| version.to_string())
    })
}

/// Runs `iptables --version`. Needs no privileges.
pub async fn iptables_version(iptables: &str) -> Option<String> {
    let output = tokio::process::Command::new(iptables)
        .arg("--version")
        .output()
        .await
        .ok()?;
    parse_iptables_version(&String::from_utf8_lossy(&output.stdout))
}

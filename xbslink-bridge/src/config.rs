//! Persistent configuration: the last discovered Xbox MAC.
//!
//! Stored as JSON at `~/.xbslink-ng/config.json`. A missing file means an
//! empty config; a malformed one is reported to the caller, which warns and
//! proceeds with defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use xbslink_core::MacAddr;

const CONFIG_DIR_NAME: &str = ".xbslink-ng";
const CONFIG_FILE_NAME: &str = "config.json";

/// Persisted settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedConfig {
    /// MAC address of the last discovered Xbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_xbox_mac: Option<String>,
}

impl SavedConfig {
    /// The saved MAC, if present and parseable.
    pub fn xbox_mac(&self) -> Option<MacAddr> {
        self.last_xbox_mac.as_deref()?.parse().ok()
    }

    pub fn set_xbox_mac(&mut self, mac: MacAddr) {
        self.last_xbox_mac = Some(mac.to_string());
    }
}

/// Default path: `~/.xbslink-ng/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let base = directories::BaseDirs::new().context("could not determine home directory")?;
    Ok(base.home_dir().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Loads the config. A missing file yields the default config; read and
/// parse failures are errors the caller downgrades to warnings.
pub fn load(path: &Path) -> Result<SavedConfig> {
    if !path.exists() {
        return Ok(SavedConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: SavedConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    Ok(cfg)
}

/// Saves the config, creating the directory (mode 0755) if needed and
/// writing the file with mode 0644.
pub fn save(path: &Path, cfg: &SavedConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_config_dir(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(cfg).context("failed to serialize config")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("failed to set config permissions: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_config_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_config_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

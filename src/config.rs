use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://archive.org";
pub const DEFAULT_STAGING_DIR: &str = "temp_internetarchive_downloads";

/// Files removed by the optional post-run sweep.
pub const DEFAULT_CLEANUP_EXTENSIONS: [&str; 11] = [
    ".torrent", ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".svg", ".json", ".xml", ".txt",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive: ArchiveSettings,
    pub setting: SettingPaths,
    pub cleanup: CleanupSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub base_url: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub page_size: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("IADownload/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            page_size: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SettingPaths {
    pub staging_dir: PathBuf,
}

impl Default for SettingPaths {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub extensions: Vec<String>,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_CLEANUP_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// Loads the YAML file if present, otherwise falls back to defaults.
pub fn load_config(yaml_path: &Path) -> Result<Config> {
    if !yaml_path.exists() {
        info!(
            "⚙️  No configuration at {}, using defaults",
            yaml_path.display()
        );
        return Ok(Config::default());
    }
    info!("⚙️  Loading configuration from: {}", yaml_path.display());
    let content = fs::read_to_string(yaml_path)
        .with_context(|| format!("Failed to read {}", yaml_path.display()))?;
    let config = parse_config(&content)?;
    info!("✅ Configuration loaded successfully");
    Ok(config)
}

fn parse_config(content: &str) -> Result<Config> {
    // An empty file deserializes to null.
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(content).context("Invalid YAML configuration")
}

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::coordinator::{LoaderOptions, DEFAULT_FLOOR};
use crate::decimate::task::DEFAULT_CHUNK_UNITS;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub decimation: DecimationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
pub struct DecimationConfig {
    #[serde(default = "default_floor")]
    pub floor: f32,
    #[serde(default = "default_chunk_units")]
    pub chunk_units: usize,
    #[serde(default)]
    pub rates: Vec<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for DecimationConfig {
    fn default() -> Self {
        Self {
            floor: default_floor(),
            chunk_units: default_chunk_units(),
            rates: Vec::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: None,
        }
    }
}

impl DecimationConfig {
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            floor: self.floor.min(0.0),
            chunk_units: self.chunk_units.max(1),
        }
    }
}

fn default_floor() -> f32 { DEFAULT_FLOOR }
fn default_chunk_units() -> usize { DEFAULT_CHUNK_UNITS }
fn default_cache_enabled() -> bool { true }

/// `waveline.toml` in the working directory, then the user config locations.
pub fn find_config() -> Option<PathBuf> {
    let local = PathBuf::from("waveline.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("waveline").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("waveline").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            log::debug!("Invalid config {}: {}", path.display(), e);
            None
        }
    }
}

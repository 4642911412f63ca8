//! Configuration loading and types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use muxrun_core::DispatcherConfig;

/// Top-level configuration for the muxrun CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dispatcher, transport and worker settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl MuxConfig {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("reading {}: {e}", path.display()))?;
        let config: MuxConfig = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("parsing {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be read or parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("MUXRUN_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("muxrun.toml")),
            Some(PathBuf::from("/etc/muxrun/muxrun.toml")),
            dirs::config_dir().map(|p| p.join("muxrun/muxrun.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(MuxConfig::default())
    }
}

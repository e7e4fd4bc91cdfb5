pub mod schema;

pub use schema::{Config, TransportConfig, VoiceConfig};

use anyhow::Context;
use directories::UserDirs;
use std::path::{Path, PathBuf};

/// `~/.voxdesk/config.toml`
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".voxdesk").join("config.toml"))
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            return Ok(Self {
                config_path,
                ..Self::default()
            });
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
        config.config_path = config_path;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.voice.frame_len == 0 {
            anyhow::bail!("voice.frame_len must be greater than zero");
        }
        if self.voice.input_sample_rate == 0 || self.voice.output_sample_rate == 0 {
            anyhow::bail!("voice sample rates must be greater than zero");
        }
        if self.voice.outbound_queue_capacity == 0 || self.voice.inbound_queue_capacity == 0 {
            anyhow::bail!("voice queue capacities must be greater than zero");
        }
        Ok(())
    }
}

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::ConductorConfig;

/// Loads the Conductor configuration from disk with env-var overrides.
pub struct ConfigLoader {
    config: Arc<RwLock<ConductorConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > CONDUCTOR_CONFIG env >
    /// ~/.conductor/conductor.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CONDUCTOR_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conductor")
            .join("conductor.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> conductor_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<ConductorConfig>(&raw).map_err(|e| {
                conductor_core::ConductorError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            ConductorConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(conductor_core::ConductorError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> ConductorConfig {
        self.config.read().clone()
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides. Config file values take priority for
    /// credentials; env fills the gaps.
    fn apply_env_overrides(mut config: ConductorConfig) -> ConductorConfig {
        if let Ok(v) = std::env::var("CONDUCTOR_AUTH_TOKEN")
            && !v.is_empty()
        {
            config.server.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("CONDUCTOR_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_PORT_START")
            && let Ok(port) = v.parse::<u16>()
        {
            config.server.port_start = port;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_PORT_END")
            && let Ok(port) = v.parse::<u16>()
        {
            config.server.port_end = port;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            let creds = config.providers.entry("anthropic".into()).or_default();
            if creds.api_key.is_none() {
                creds.api_key = Some(v);
            }
        }
        config
    }
}

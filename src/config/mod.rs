use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/prewarm.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Application root. Defaults to the working directory.
    pub root: Option<PathBuf>,
    /// Control socket, relative to the root unless absolute.
    pub socket_path: PathBuf,
    /// Environment used when neither the command nor the client names one.
    pub default_env: String,
    /// Variables set to the environment name inside each worker.
    pub env_vars: Vec<String>,
    /// Program commands are exec'd with.
    pub interpreter: String,
    pub commands: HashMap<String, CommandConfig>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CommandConfig {
    pub preloads: Option<Vec<String>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: None,
            socket_path: PathBuf::from("tmp/prewarm.sock"),
            default_env: "development".to_string(),
            env_vars: vec!["RAILS_ENV".to_string(), "RACK_ENV".to_string()],
            interpreter: "ruby".to_string(),
            commands: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Load from `PREWARM_CONFIG` or the default path. A missing or broken
    /// file yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("PREWARM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Ok(Self::load_from(Path::new(&path)))
    }

    pub fn load_from(path: &Path) -> Self {
        let s = std::fs::read_to_string(path).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Per-command preload overrides.
    pub fn preload_overrides(&self) -> HashMap<String, Vec<String>> {
        self.commands
            .iter()
            .filter_map(|(name, cfg)| cfg.preloads.clone().map(|p| (name.clone(), p)))
            .collect()
    }
}

//! Agent configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};

use agentmux::ForwardConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// X11 display number; the X11 listener binds port `6000 + x11_display`.
    #[serde(default = "default_x11_display")]
    pub x11_display: u32,
    #[serde(default = "default_x11_bind_host")]
    pub x11_bind_host: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            x11_display: default_x11_display(),
            x11_bind_host: default_x11_bind_host(),
        }
    }
}

fn default_x11_display() -> u32 {
    10
}
fn default_x11_bind_host() -> String {
    "127.0.0.1".into()
}

impl AgentSection {
    /// TCP port the X11 listener binds.
    pub fn x11_port(&self) -> u32 {
        6000 + self.x11_display
    }
}

impl AgentConfig {
    /// Load config from `config_path` (if it exists) and apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_x11_display: Option<u32>,
        cli_terminate_timeout_ms: Option<u64>,
    ) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read config {}", expanded.display()))?;
                    toml::from_str::<AgentConfig>(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    AgentConfig::default()
                }
            }
            None => AgentConfig::default(),
        };

        if let Some(display) = cli_x11_display {
            config.agent.x11_display = display;
        }
        if let Some(ms) = cli_terminate_timeout_ms {
            config.forward.terminate_timeout_ms = ms;
        }
        Ok(config)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

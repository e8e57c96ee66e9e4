// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::sync::Pacing;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub adapter: AdapterConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub buffer_count: u32,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub pacing: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            vsync: false,
            clear_color: [0.4, 0.6, 0.9, 1.0],
            pacing: "pipelined".to_string(),
        }
    }
}

/// Adapter selection policy
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Select a CPU rasterizer instead of a hardware GPU
    pub force_software: bool,
    /// Fall back to a software adapter when no suitable hardware is found
    pub software_fallback: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            force_software: false,
            software_fallback: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    /// Validation message ids dropped by the debug callback
    pub suppressed_messages: Vec<String>,
    /// Milliseconds to wait on the GPU timeline per frame; 0 waits forever
    pub frame_wait_timeout_ms: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: true,
            suppressed_messages: vec![
                "VUID-VkSwapchainCreateInfoKHR-imageExtent-01274".to_string(),
                "UNASSIGNED-BestPractices-NonSuccessResult".to_string(),
            ],
            frame_wait_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Back-buffer count, clamped to the supported ring sizes
    pub fn buffer_count(&self) -> u32 {
        let count = self.graphics.buffer_count.clamp(2, 4);
        if count != self.graphics.buffer_count {
            log::warn!(
                "buffer_count {} out of range, using {}",
                self.graphics.buffer_count,
                count
            );
        }
        count
    }

    /// Get the frame pacing policy as an enum
    pub fn pacing(&self) -> Pacing {
        match self.graphics.pacing.to_lowercase().as_str() {
            "pipelined" => Pacing::Pipelined,
            "lockstep" => Pacing::Lockstep,
            _ => {
                log::warn!(
                    "Unknown pacing policy '{}', defaulting to pipelined",
                    self.graphics.pacing
                );
                Pacing::Pipelined
            }
        }
    }

    /// Per-frame timeline wait budget; `None` waits forever
    pub fn frame_wait_timeout(&self) -> Option<Duration> {
        match self.debug.frame_wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.buffer_count(), 2);
        assert_eq!(config.pacing(), Pacing::Pipelined);
        assert!(config.frame_wait_timeout().is_none());
        assert!(config.adapter.software_fallback);
        assert!(!config.adapter.force_software);
    }

    #[test]
    fn buffer_count_is_clamped() {
        let mut config = Config::default();
        config.graphics.buffer_count = 1;
        assert_eq!(config.buffer_count(), 2);
        config.graphics.buffer_count = 8;
        assert_eq!(config.buffer_count(), 4);
        config.graphics.buffer_count = 3;
        assert_eq!(config.buffer_count(), 3);
    }

    #[test]
    fn pacing_strings_map_to_policies() {
        let mut config = Config::default();
        config.graphics.pacing = "Lockstep".to_string();
        assert_eq!(config.pacing(), Pacing::Lockstep);
        config.graphics.pacing = "nonsense".to_string();
        assert_eq!(config.pacing(), Pacing::Pipelined);
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            buffer_count = 4
            vsync = true
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics.buffer_count, 4);
        assert!(config.graphics.vsync);
        assert_eq!(config.window.title, "vkframe");
        assert!(!config.debug.suppressed_messages.is_empty());
    }

    #[test]
    fn finite_timeout_is_exposed() {
        let mut config = Config::default();
        config.debug.frame_wait_timeout_ms = 250;
        assert_eq!(
            config.frame_wait_timeout(),
            Some(Duration::from_millis(250))
        );
    }
}

//! Layered configuration: defaults, an optional TOML file, then environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::PixelFormat;
use crate::pipeline::BundleAttr;
use crate::Result;

/// Environment prefix, e.g. `BUNDLECORE__CHANNEL__BUNDLE__WATER_MARK=4`.
const ENV_PREFIX: &str = "BUNDLECORE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub channel: ChannelConfig,
    pub device: DeviceConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Bundle attributes applied when a channel starts.
    pub bundle: BundleAttr,
    /// Maximum number of streams a single channel can bundle.
    pub max_streams: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// How long a synchronous API call waits for the state machine, 0 waits forever.
    pub api_timeout_ms: u64,
}

/// Knobs for the demo binary's virtual hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub fps: u32,
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Stop the demo after this many seconds, 0 runs until Ctrl-C.
    pub run_seconds: u64,
    /// Number of snapshot bundles requested per take-picture.
    pub burst: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "bundlecore=info".into(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bundle: BundleAttr::default(),
            max_streams: 4,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { api_timeout_ms: 0 }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            buffer_count: 6,
            width: 800,
            height: 600,
            format: PixelFormat::Nv12,
            run_seconds: 5,
            burst: 2,
        }
    }
}

impl Config {
    /// Builds the configuration from defaults, an optional TOML file and
    /// `BUNDLECORE__*` environment variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NotifyMode;

    #[test]
    fn test_defaults_load_without_file() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.channel.max_streams, 4);
        assert_eq!(cfg.channel.bundle.notify_mode, NotifyMode::Burst);
        assert_eq!(cfg.simulation.fps, 30);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("bundlecore-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bundlecore.toml");
        std::fs::write(
            &path,
            "[channel.bundle]\nwater_mark = 7\nnotify_mode = \"continuous\"\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.channel.bundle.water_mark, 7);
        assert_eq!(cfg.channel.bundle.notify_mode, NotifyMode::Continuous);
        // untouched keys keep their defaults
        assert_eq!(cfg.channel.bundle.look_back, BundleAttr::default().look_back);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

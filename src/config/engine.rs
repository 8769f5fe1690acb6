// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use super::error::ConfigError;
use super::parse_duration;
use crate::bus::DEFAULT_RESTORE_DELAY;
use crate::resource::{DEFAULT_RESOURCE_PREFIX, DEFAULT_SILENCE_THRESHOLD};
use crate::unit::DEFAULT_REGISTRATION_TIMEOUT;

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub(crate) struct RawEngine {
    /// How long an attach waits for the initial registration, e.g. "2s".
    registration_timeout: Option<String>,

    /// Pause between re-evaluating and starting a unit when a solo ends, e.g. "100ms".
    restore_delay: Option<String>,

    /// Peak amplitude below which a rendered buffer is reported as silent.
    silence_threshold: Option<f32>,

    /// Prefix for resource handle URLs.
    resource_prefix: Option<String>,

    /// Directory of source audio files for the file renderer.
    renders: Option<PathBuf>,
}

/// Engine settings with every default resolved.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    registration_timeout: Duration,
    restore_delay: Duration,
    silence_threshold: f32,
    resource_prefix: String,
    renders: Option<PathBuf>,
}

impl EngineConfig {
    /// Resolves the YAML representation, applying defaults.
    pub(crate) fn from_raw(raw: &RawEngine) -> Result<EngineConfig, ConfigError> {
        let silence_threshold = raw.silence_threshold.unwrap_or(DEFAULT_SILENCE_THRESHOLD);
        if !(0.0..1.0).contains(&silence_threshold) {
            return Err(ConfigError::Invalid {
                field: "silence_threshold".to_string(),
                message: format!("{} is not in [0, 1)", silence_threshold),
            });
        }

        let resource_prefix = raw
            .resource_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_RESOURCE_PREFIX.to_string());
        if resource_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "resource_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(EngineConfig {
            registration_timeout: parse_duration(
                "registration_timeout",
                &raw.registration_timeout,
                DEFAULT_REGISTRATION_TIMEOUT,
            )?,
            restore_delay: parse_duration("restore_delay", &raw.restore_delay, DEFAULT_RESTORE_DELAY)?,
            silence_threshold,
            resource_prefix,
            renders: raw.renders.clone(),
        })
    }

    /// Parses an engine configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        let raw = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<RawEngine>()?;
        EngineConfig::from_raw(&raw)
    }

    /// Returns how long an attach waits for the initial registration.
    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    /// Returns the pause used by the last step of the solo restore chain.
    pub fn restore_delay(&self) -> Duration {
        self.restore_delay
    }

    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    pub fn resource_prefix(&self) -> &str {
        &self.resource_prefix
    }

    /// Returns the directory of source audio files, if configured.
    pub fn renders(&self) -> Option<&Path> {
        self.renders.as_deref()
    }

    /// Returns a copy with the renders directory replaced.
    pub fn with_renders(mut self, renders: &Path) -> EngineConfig {
        self.renders = Some(renders.to_path_buf());
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            restore_delay: DEFAULT_RESTORE_DELAY,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            resource_prefix: DEFAULT_RESOURCE_PREFIX.to_string(),
            renders: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    fn parse(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let raw: RawEngine = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        EngineConfig::from_raw(&raw)
    }

    #[test]
    fn test_engine_config() {
        let config = parse(
            r#"
            registration_timeout: 500ms
            restore_delay: 50ms
            silence_threshold: 0.001
            resource_prefix: blob:test
            renders: /var/renders
        "#,
        )
        .unwrap();

        assert_eq!(config.registration_timeout(), Duration::from_millis(500));
        assert_eq!(config.restore_delay(), Duration::from_millis(50));
        assert_eq!(config.silence_threshold(), 0.001);
        assert_eq!(config.resource_prefix(), "blob:test");
        assert_eq!(config.renders(), Some(Path::new("/var/renders")));
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::from_raw(&RawEngine::default()).unwrap();
        assert_eq!(config.registration_timeout(), Duration::from_secs(2));
        assert_eq!(config.restore_delay(), Duration::from_millis(100));
        assert_eq!(config.silence_threshold(), DEFAULT_SILENCE_THRESHOLD);
        assert_eq!(config.resource_prefix(), "blob:evolive");
        assert_eq!(config.renders(), None);
    }

    #[test]
    fn test_engine_config_invalid() {
        assert!(matches!(
            parse("registration_timeout: soon"),
            Err(ConfigError::Duration {
                field: "registration_timeout",
                ..
            })
        ));
        assert!(matches!(
            parse("silence_threshold: 2.0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse("resource_prefix: \"  \""),
            Err(ConfigError::Invalid { .. })
        ));
    }
}

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
use std::collections::HashSet;
use std::path::Path;

use config::{Config, File};
use serde::Deserialize;

use super::engine::{EngineConfig, RawEngine};
use super::error::ConfigError;
use super::parse_duration;
use crate::render::{SourceReference, DEFAULT_DURATION, DEFAULT_VELOCITY, UNSHIFTED_PITCH};

/// A source to render into a unit's bank.
#[derive(Deserialize, Clone, Debug)]
pub struct SourceConfig {
    /// The source id known to the renderer.
    id: String,

    /// Render length, e.g. "1500ms" (default: 2s).
    duration: Option<String>,

    /// MIDI pitch to render at (default: 60, unshifted).
    pitch: Option<i32>,

    /// MIDI velocity to render at (default: 100).
    velocity: Option<u8>,
}

impl SourceConfig {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves the source into a render request.
    pub fn to_source_reference(&self) -> Result<SourceReference, ConfigError> {
        let velocity = self.velocity.unwrap_or(DEFAULT_VELOCITY);
        if velocity > 127 {
            return Err(ConfigError::Invalid {
                field: format!("sources.{}.velocity", self.id),
                message: format!("{} is above 127", velocity),
            });
        }
        let pitch = self.pitch.unwrap_or(UNSHIFTED_PITCH);
        if !(0..=127).contains(&pitch) {
            return Err(ConfigError::Invalid {
                field: format!("sources.{}.pitch", self.id),
                message: format!("{} is not a MIDI note", pitch),
            });
        }

        Ok(SourceReference::new(
            &self.id,
            parse_duration("duration", &self.duration, DEFAULT_DURATION)?,
            pitch,
            velocity,
        ))
    }
}

/// A unit to create when a session starts.
#[derive(Deserialize, Clone, Debug)]
pub struct UnitConfig {
    /// Code to use instead of the code generated from the sources.
    code: Option<String>,

    /// Sources rendered into the unit's bank, in order.
    #[serde(default)]
    sources: Vec<SourceConfig>,

    /// Whether the unit starts playing once attached.
    #[serde(default)]
    play: bool,
}

impl UnitConfig {
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn play(&self) -> bool {
        self.play
    }
}

#[derive(Deserialize)]
struct RawSession {
    #[serde(default)]
    engine: RawEngine,

    #[serde(default)]
    units: Vec<UnitConfig>,
}

/// A session file: engine settings and the units to set up.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    engine: EngineConfig,
    units: Vec<UnitConfig>,
}

impl SessionConfig {
    /// Parses a session from a YAML file.
    pub fn deserialize(path: &Path) -> Result<SessionConfig, ConfigError> {
        let raw = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<RawSession>()?;
        SessionConfig::from_raw(raw)
    }

    fn from_raw(raw: RawSession) -> Result<SessionConfig, ConfigError> {
        for (index, unit) in raw.units.iter().enumerate() {
            let mut seen = HashSet::new();
            for source in unit.sources.iter() {
                if source.id.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        field: format!("units[{}].sources", index),
                        message: "source id must not be empty".to_string(),
                    });
                }
                if !seen.insert(source.id.as_str()) {
                    return Err(ConfigError::Invalid {
                        field: format!("units[{}].sources", index),
                        message: format!("source {} is listed twice", source.id),
                    });
                }
                source.to_source_reference()?;
            }
        }

        Ok(SessionConfig {
            engine: EngineConfig::from_raw(&raw.engine)?,
            units: raw.units,
        })
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn units(&self) -> &[UnitConfig] {
        &self.units
    }
}

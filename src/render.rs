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

//! Rendering of evolved sources into decoded audio.
//!
//! This module provides:
//! - The source reference used as the render cache key
//! - The rendering collaborator trait and its errors
//! - A process-wide cache that renders each source at most once at a time

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod buffer;
mod cache;
mod file;

pub use buffer::AudioBuffer;
pub use cache::RenderCache;
pub use file::FileRenderer;

/// The MIDI note that renders without any pitch shift.
pub const UNSHIFTED_PITCH: i32 = 60;

/// The default render duration.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(2);

/// The default render velocity.
pub const DEFAULT_VELOCITY: u8 = 100;

/// Identifies raw material to render. Immutable, and hashed as a whole when used as a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceReference {
    source_id: String,
    duration: Duration,
    pitch: i32,
    velocity: u8,
}

impl SourceReference {
    /// Creates a new source reference.
    pub fn new(source_id: &str, duration: Duration, pitch: i32, velocity: u8) -> SourceReference {
        SourceReference {
            source_id: source_id.to_string(),
            duration,
            pitch,
            velocity,
        }
    }

    /// Creates a source reference with the default render parameters.
    pub fn with_defaults(source_id: &str) -> SourceReference {
        SourceReference::new(source_id, DEFAULT_DURATION, UNSHIFTED_PITCH, DEFAULT_VELOCITY)
    }

    /// The identifier of the evolved source.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// How much of the source to render.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The MIDI note to render at.
    pub fn pitch(&self) -> i32 {
        self.pitch
    }

    /// The velocity (0-127) to render at.
    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    /// Checks that the pitch and velocity are MIDI values.
    pub fn validate(&self) -> Result<(), RenderError> {
        if !(0..=127).contains(&self.pitch) {
            return Err(RenderError::InvalidParameter {
                source_id: self.source_id.clone(),
                message: format!("pitch {} is not a MIDI note", self.pitch),
            });
        }
        if self.velocity > 127 {
            return Err(RenderError::InvalidParameter {
                source_id: self.source_id.clone(),
                message: format!("velocity {} is above 127", self.velocity),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}ms_{}_{}",
            self.source_id,
            self.duration.as_millis(),
            self.pitch,
            self.velocity
        )
    }
}

/// Errors reported by a rendering collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("No audio found for source {0}")]
    NotFound(String),

    #[error("Failed to fetch source {source_id}: {message}")]
    Fetch { source_id: String, message: String },

    #[error("Failed to decode {0}")]
    Decode(String),

    #[error("Render of {0} produced no audio")]
    Empty(String),

    #[error("Invalid render parameters for {source_id}: {message}")]
    InvalidParameter { source_id: String, message: String },

    #[error("Render task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

/// A rendering collaborator. Given a source reference, produces decoded audio or a
/// descriptive error. Direct fetch-and-decode and multi-step pipelines both sit behind this.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Renders the given source into a decoded buffer.
    async fn render(&self, source: &SourceReference) -> Result<AudioBuffer, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let source = SourceReference::with_defaults("genome-7");
        assert_eq!(source.source_id(), "genome-7");
        assert_eq!(source.duration(), DEFAULT_DURATION);
        assert_eq!(source.pitch(), UNSHIFTED_PITCH);
        assert_eq!(source.velocity(), DEFAULT_VELOCITY);
    }

    #[test]
    fn test_render_parameters_distinguish_keys() {
        let a = SourceReference::new("genome-7", Duration::from_secs(1), 60, 100);
        let b = SourceReference::new("genome-7", Duration::from_secs(1), 62, 100);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "genome-7_1000ms_60_100");
    }

    #[test]
    fn test_validate() {
        assert!(SourceReference::new("genome-7", DEFAULT_DURATION, 0, 0).validate().is_ok());
        assert!(SourceReference::new("genome-7", DEFAULT_DURATION, 127, 127).validate().is_ok());
        for (pitch, velocity) in [(-1, 100), (128, 100), (-5000, 100), (i32::MAX, 100), (60, 128)] {
            assert!(matches!(
                SourceReference::new("genome-7", DEFAULT_DURATION, pitch, velocity).validate(),
                Err(RenderError::InvalidParameter { .. })
            ));
        }
    }
}

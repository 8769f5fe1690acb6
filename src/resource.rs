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

//! Playable resource handles for rendered audio.
//!
//! A handle is a `blob:`-style URL that an evaluator can load. Handles stay resolvable
//! until revoked; after revocation the URL no longer resolves to any audio.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::render::AudioBuffer;

/// Default URL prefix for minted handles.
pub const DEFAULT_RESOURCE_PREFIX: &str = "blob:evolive";

/// Default magnitude below which a buffer is considered silent.
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.0001;

/// A revocable handle to materialized audio.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    url: String,
}

impl ResourceHandle {
    /// The URL the evaluator loads the audio from.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Turns decoded audio into revocable handles and resolves them back.
pub struct Materializer {
    /// Live handles and the audio they resolve to.
    resources: RwLock<HashMap<ResourceHandle, AudioBuffer>>,
    /// Monotonic id for the next handle. Ids are never reused.
    next_id: AtomicU64,
    /// URL prefix for minted handles.
    prefix: String,
    /// Magnitude below which a buffer is reported as silent.
    silence_threshold: f32,
}

impl Materializer {
    /// Creates a new materializer.
    pub fn new(prefix: &str, silence_threshold: f32) -> Materializer {
        Materializer {
            resources: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            prefix: prefix.trim_end_matches('/').to_string(),
            silence_threshold,
        }
    }

    /// Mints a new handle for the buffer. A silent buffer is still materialized but is
    /// reported, since it usually means the render went wrong upstream.
    pub fn materialize(&self, buffer: AudioBuffer, label: &str) -> ResourceHandle {
        if buffer.is_silent(self.silence_threshold) {
            warn!(
                label,
                peak = buffer.peak(),
                threshold = self.silence_threshold,
                "Materialized audio is silent"
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ResourceHandle {
            url: format!("{}/{}", self.prefix, id),
        };
        self.resources.write().insert(handle.clone(), buffer);

        debug!(label, handle = %handle, "Materialized resource");
        handle
    }

    /// Resolves a live handle to its audio.
    pub fn resolve(&self, handle: &ResourceHandle) -> Option<AudioBuffer> {
        self.resources.read().get(handle).cloned()
    }

    /// True if the handle has not been revoked.
    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        self.resources.read().contains_key(handle)
    }

    /// Revokes the handle. Returns false if it was already revoked or never minted here.
    pub fn revoke(&self, handle: &ResourceHandle) -> bool {
        let revoked = self.resources.write().remove(handle).is_some();
        if revoked {
            debug!(handle = %handle, "Revoked resource");
        }
        revoked
    }

    /// Returns the number of live handles.
    pub fn live_count(&self) -> usize {
        self.resources.read().len()
    }
}

impl Default for Materializer {
    fn default() -> Self {
        Materializer::new(DEFAULT_RESOURCE_PREFIX, DEFAULT_SILENCE_THRESHOLD)
    }
}

impl fmt::Debug for Materializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materializer")
            .field("prefix", &self.prefix)
            .field("live", &self.live_count())
            .finish()
    }
}

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

//! Process-wide cache of rendered audio.
//!
//! The underlying renderer is only called on a miss, and at most one render per
//! source is in flight at any time no matter how many units ask for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{AudioBuffer, RenderError, Renderer, SourceReference};

/// A render in progress. Every caller waiting on the same source polls a clone of it.
type InflightRender = Shared<BoxFuture<'static, Result<AudioBuffer, RenderError>>>;

type InflightMap = Arc<Mutex<HashMap<SourceReference, InflightRender>>>;

/// Caches decoded audio by source reference.
pub struct RenderCache {
    /// The rendering collaborator, only called on a miss.
    renderer: Arc<dyn Renderer>,
    /// Completed renders. Entries are never replaced once inserted.
    entries: Arc<RwLock<HashMap<SourceReference, AudioBuffer>>>,
    /// Renders that are currently running, removed as soon as they finish either way.
    inflight: InflightMap,
    /// Number of times the renderer has been invoked.
    renders: Arc<AtomicUsize>,
}

/// Drops the in-flight entry when the render task ends, including on panic.
struct InflightGuard {
    inflight: InflightMap,
    source: SourceReference,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.source);
    }
}

impl RenderCache {
    /// Creates a new cache in front of the given renderer.
    pub fn new(renderer: Arc<dyn Renderer>) -> RenderCache {
        RenderCache {
            renderer,
            entries: Arc::new(RwLock::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            renders: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the cached audio for the source, rendering it if needed.
    ///
    /// Concurrent callers for the same source share one render and all see its outcome.
    /// A failed render leaves the cache untouched and the next call starts over.
    pub async fn get_or_render(&self, source: &SourceReference) -> Result<AudioBuffer, RenderError> {
        if let Some(buffer) = self.lookup(source) {
            debug!(source = %source, "Using cached render");
            return Ok(buffer);
        }

        let render = {
            let mut inflight = self.inflight.lock();
            // The render may have finished between the lookup and taking the lock.
            if let Some(buffer) = self.lookup(source) {
                return Ok(buffer);
            }
            match inflight.get(source) {
                Some(render) => {
                    debug!(source = %source, "Joining in-flight render");
                    render.clone()
                }
                None => {
                    let render = self.start_render(source);
                    inflight.insert(source.clone(), render.clone());
                    render
                }
            }
        };

        render.await
    }

    /// Spawns the render. The task runs to completion even if every caller goes away, so
    /// a superseded render still populates the cache.
    fn start_render(&self, source: &SourceReference) -> InflightRender {
        info!(source = %source, "Rendering source");

        let renderer = self.renderer.clone();
        let entries = self.entries.clone();
        let renders = self.renders.clone();
        let guard = InflightGuard {
            inflight: self.inflight.clone(),
            source: source.clone(),
        };
        let task = tokio::spawn(async move {
            let source = &guard.source;
            renders.fetch_add(1, Ordering::Relaxed);
            let result = match renderer.render(source).await {
                Ok(buffer) if buffer.frames() == 0 => Err(RenderError::Empty(source.to_string())),
                result => result,
            };

            match &result {
                Ok(buffer) => {
                    entries
                        .write()
                        .entry(source.clone())
                        .or_insert_with(|| buffer.clone());
                    info!(
                        source = %source,
                        channels = buffer.channel_count(),
                        sample_rate = buffer.sample_rate(),
                        duration_ms = buffer.duration().as_millis(),
                        memory_kb = buffer.memory_size() / 1024,
                        "Source rendered"
                    );
                }
                Err(e) => warn!(source = %source, error = %e, "Render failed"),
            }
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RenderError::Task(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Returns the cached audio for the source without rendering.
    pub fn lookup(&self, source: &SourceReference) -> Option<AudioBuffer> {
        self.entries.read().get(source).cloned()
    }

    /// True if the source has a completed render.
    pub fn contains(&self, source: &SourceReference) -> bool {
        self.entries.read().contains_key(source)
    }

    /// Returns the number of completed renders held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing has been rendered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns how many times the renderer has been invoked.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::Relaxed)
    }

    /// Returns the total memory used by cached renders.
    pub fn total_memory_usage(&self) -> usize {
        self.entries.read().values().map(|b| b.memory_size()).sum()
    }
}

impl std::fmt::Debug for RenderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCache")
            .field("cached_renders", &self.len())
            .field("renders", &self.render_count())
            .field("inflight", &self.inflight.lock().len())
            .field("total_memory_kb", &(self.total_memory_usage() / 1024))
            .finish()
    }
}

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

//! Per-unit registry of rendered samples.
//!
//! Each unit owns one bank. Samples are deduplicated by source id, named
//! `unit<id>_evo_<n>` with a counter that is never reused, and own their resource
//! handle until they are removed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::codegen;
use crate::error::EngineError;
use crate::render::{RenderCache, SourceReference};
use crate::resource::{Materializer, ResourceHandle};
use crate::unit::UnitId;

/// Where a sample stands with respect to the current evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not yet registered with the current evaluator.
    Pending,
    /// Confirmed registered with the current evaluator.
    Registered,
    /// The last registration attempt was rejected.
    Failed,
}

/// A named, playable sample scoped to one unit.
pub struct Sample {
    name: String,
    handle: ResourceHandle,
    source: SourceReference,
    status: Mutex<RegistrationStatus>,
}

impl Sample {
    /// The sample's unique name within its unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handle the evaluator loads the audio from.
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// The source this sample was rendered from.
    pub fn source(&self) -> &SourceReference {
        &self.source
    }

    /// The registration status against the current evaluator.
    pub fn status(&self) -> RegistrationStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RegistrationStatus) {
        *self.status.lock() = status;
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("name", &self.name)
            .field("handle", &self.handle.url())
            .field("source", &self.source.to_string())
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Default)]
struct BankState {
    /// Live samples in insertion order.
    samples: Vec<Arc<Sample>>,
    /// Index used for the next sample name.
    next_index: u64,
    /// Set when a sample has been added or a registration failed, cleared when the
    /// whole bank is confirmed registered.
    has_unregistered: bool,
}

/// The samples owned by one unit.
pub struct SampleBank {
    unit: UnitId,
    cache: Arc<RenderCache>,
    materializer: Arc<Materializer>,
    state: Mutex<BankState>,
}

impl SampleBank {
    /// Creates an empty bank for the unit.
    pub fn new(unit: UnitId, cache: Arc<RenderCache>, materializer: Arc<Materializer>) -> SampleBank {
        SampleBank {
            unit,
            cache,
            materializer,
            state: Mutex::new(BankState::default()),
        }
    }

    /// Adds the source to the bank, rendering it if needed. Adding a source id that is
    /// already present returns the existing sample unchanged.
    pub async fn add(&self, source: SourceReference) -> Result<Arc<Sample>, EngineError> {
        if let Some(existing) = self.get(source.source_id()) {
            debug!(unit = self.unit, sample = existing.name(), "Source already in bank");
            return Ok(existing);
        }

        let buffer = self.cache.get_or_render(&source).await?;

        let mut state = self.state.lock();
        // A concurrent add for the same source may have won while we were rendering.
        if let Some(existing) = state
            .samples
            .iter()
            .find(|s| s.source.source_id() == source.source_id())
        {
            return Ok(existing.clone());
        }

        let name = codegen::sample_name(self.unit, state.next_index);
        if state.samples.iter().any(|s| s.name == name) {
            error!(unit = self.unit, sample = name, "Sample name collision");
            debug_assert!(false, "sample name collision: {}", name);
            return Err(EngineError::NameCollision(name));
        }
        state.next_index += 1;

        let handle = self.materializer.materialize(buffer, &name);
        let sample = Arc::new(Sample {
            name,
            handle,
            source,
            status: Mutex::new(RegistrationStatus::Pending),
        });
        state.samples.push(sample.clone());
        state.has_unregistered = true;

        info!(
            unit = self.unit,
            sample = sample.name(),
            source = %sample.source(),
            handle = %sample.handle(),
            "Sample added"
        );
        Ok(sample)
    }

    /// Removes the sample for the source id and revokes its handle.
    pub fn remove(&self, source_id: &str) -> Option<Arc<Sample>> {
        let removed = {
            let mut state = self.state.lock();
            let position = state
                .samples
                .iter()
                .position(|s| s.source.source_id() == source_id)?;
            state.samples.remove(position)
        };

        self.revoke(&removed);
        info!(unit = self.unit, sample = removed.name(), "Sample removed");
        Some(removed)
    }

    /// Removes every sample, revokes their handles and resets the name counter.
    pub fn clear(&self) -> Vec<Arc<Sample>> {
        let removed = {
            let mut state = self.state.lock();
            state.next_index = 0;
            state.has_unregistered = false;
            std::mem::take(&mut state.samples)
        };

        for sample in removed.iter() {
            self.revoke(sample);
        }
        if !removed.is_empty() {
            info!(unit = self.unit, removed = removed.len(), "Sample bank cleared");
        }
        removed
    }

    fn revoke(&self, sample: &Sample) {
        if !self.materializer.revoke(sample.handle()) {
            error!(
                unit = self.unit,
                sample = sample.name(),
                handle = %sample.handle(),
                "Sample handle was already revoked"
            );
        }
    }

    /// Returns the sample for the source id.
    pub fn get(&self, source_id: &str) -> Option<Arc<Sample>> {
        self.state
            .lock()
            .samples
            .iter()
            .find(|s| s.source.source_id() == source_id)
            .cloned()
    }

    /// Returns the sample with the given name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Sample>> {
        self.state
            .lock()
            .samples
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// True if a live sample has the name.
    pub fn contains_name(&self, name: &str) -> bool {
        self.state.lock().samples.iter().any(|s| s.name == name)
    }

    /// Returns every live sample in insertion order.
    pub fn samples(&self) -> Vec<Arc<Sample>> {
        self.state.lock().samples.clone()
    }

    /// Returns every live sample name in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.state
            .lock()
            .samples
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Returns the live samples whose names are not in the given set.
    pub fn unregistered(&self, registered: &HashSet<String>) -> Vec<Arc<Sample>> {
        self.state
            .lock()
            .samples
            .iter()
            .filter(|s| !registered.contains(&s.name))
            .cloned()
            .collect()
    }

    /// True if some sample has not been confirmed registered.
    pub fn has_unregistered(&self) -> bool {
        self.state.lock().has_unregistered
    }

    pub(crate) fn mark_unregistered(&self) {
        self.state.lock().has_unregistered = true;
    }

    pub(crate) fn mark_all_registered(&self) {
        let mut state = self.state.lock();
        state.has_unregistered = state
            .samples
            .iter()
            .any(|s| s.status() != RegistrationStatus::Registered);
    }

    /// Resets every sample to pending, for a fresh evaluator that has seen none of them.
    pub(crate) fn reset_registration(&self) {
        let mut state = self.state.lock();
        for sample in state.samples.iter() {
            sample.set_status(RegistrationStatus::Pending);
        }
        state.has_unregistered = !state.samples.is_empty();
    }

    /// Returns the number of live samples.
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// True if the bank has no samples.
    pub fn is_empty(&self) -> bool {
        self.state.lock().samples.is_empty()
    }
}

impl fmt::Debug for SampleBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBank")
            .field("unit", &self.unit)
            .field("samples", &self.names())
            .finish()
    }
}

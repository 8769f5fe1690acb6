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

//! Cross-unit coordination: stop all, start all, and mutually exclusive solo.
//!
//! The bus is owned by the application root and shared by reference. It holds weak
//! references to its members, so a member that goes away without unregistering is
//! simply skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::unit::UnitId;

/// Default pause between re-evaluating and starting a unit during solo restore.
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_millis(100);

/// The controls a unit exposes to the bus.
#[async_trait]
pub trait BusMember: Send + Sync + 'static {
    /// The member's unit id.
    fn id(&self) -> UnitId;

    /// True if the member is currently playing.
    fn is_playing(&self) -> bool;

    /// Sets the member's solo flag.
    fn set_solo(&self, solo: bool);

    /// Starts playback.
    async fn start(&self) -> Result<(), EngineError>;

    /// Stops playback. Always safe to call.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Stops if playing, otherwise starts.
    async fn toggle(&self) -> Result<(), EngineError>;

    /// Re-evaluates the member's code without starting it.
    async fn reevaluate(&self) -> Result<(), EngineError>;
}

/// How a unit was brought back after a solo ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreMethod {
    Start,
    Toggle,
    Reevaluate,
}

/// The playing state of one registered unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitPlayingState {
    pub id: UnitId,
    pub is_playing: bool,
}

struct Entry {
    member: Weak<dyn BusMember>,
    /// The member's playing state as of the last stop_all.
    was_playing: bool,
    /// Set while this member is soloing: the members that were playing when it started.
    solo_snapshot: Option<Vec<UnitId>>,
}

/// Process-wide registry of units for coordinated playback.
pub struct CoordinationBus {
    entries: Mutex<BTreeMap<UnitId, Entry>>,
    restore_delay: Duration,
}

impl CoordinationBus {
    /// Creates an empty bus.
    pub fn new(restore_delay: Duration) -> CoordinationBus {
        CoordinationBus {
            entries: Mutex::new(BTreeMap::new()),
            restore_delay,
        }
    }

    /// Registers a unit. Registering an id again replaces the earlier member.
    pub fn register_unit(&self, member: &Arc<dyn BusMember>) {
        let id = member.id();
        let replaced = self
            .entries
            .lock()
            .insert(
                id,
                Entry {
                    member: Arc::downgrade(member),
                    was_playing: false,
                    solo_snapshot: None,
                },
            )
            .is_some();
        debug!(unit = id, replaced, "Unit registered on bus");
    }

    /// Unregisters a unit. Returns false if it was not registered.
    pub fn unregister_unit(&self, id: UnitId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            // Forget the unit in any solo snapshot so it is never restored.
            for entry in self.entries.lock().values_mut() {
                if let Some(snapshot) = entry.solo_snapshot.as_mut() {
                    snapshot.retain(|other| *other != id);
                }
            }
            debug!(unit = id, "Unit unregistered from bus");
        }
        removed
    }

    /// True if the unit is registered.
    pub fn is_registered(&self, id: UnitId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Returns the live members in id order, pruning the ones that have gone away.
    fn members(&self) -> Vec<Arc<dyn BusMember>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.member.strong_count() > 0);
        entries
            .values()
            .filter_map(|entry| entry.member.upgrade())
            .collect()
    }

    fn member(&self, id: UnitId) -> Option<Arc<dyn BusMember>> {
        self.entries
            .lock()
            .get(&id)
            .and_then(|entry| entry.member.upgrade())
    }

    /// Returns the playing state of every registered unit, in id order.
    pub fn get_all_playing_states(&self) -> Vec<UnitPlayingState> {
        self.members()
            .iter()
            .map(|member| UnitPlayingState {
                id: member.id(),
                is_playing: member.is_playing(),
            })
            .collect()
    }

    /// Stops every registered unit, remembering which ones were playing.
    pub async fn stop_all(&self) {
        let members = self.members();
        {
            let mut entries = self.entries.lock();
            for member in members.iter() {
                if let Some(entry) = entries.get_mut(&member.id()) {
                    entry.was_playing = member.is_playing();
                }
            }
        }

        info!(units = members.len(), "Stopping all units");
        for (member, result) in members
            .iter()
            .zip(join_all(members.iter().map(|m| m.stop())).await)
        {
            if let Err(e) = result {
                warn!(unit = member.id(), error = %e, "Error stopping unit");
            }
        }
    }

    /// Starts every unit whose last known state was playing. Idle units are left alone.
    pub async fn start_all(&self) {
        let to_start: Vec<Arc<dyn BusMember>> = {
            let members = self.members();
            let entries = self.entries.lock();
            members
                .into_iter()
                .filter(|m| !m.is_playing())
                .filter(|m| entries.get(&m.id()).is_some_and(|e| e.was_playing))
                .collect()
        };

        info!(units = to_start.len(), "Starting previously playing units");
        for (member, result) in to_start
            .iter()
            .zip(join_all(to_start.iter().map(|m| m.start())).await)
        {
            if let Err(e) = result {
                warn!(unit = member.id(), error = %e, "Error starting unit");
            }
        }
    }

    /// Starts the unit if its last known state was playing. Returns true if it was started.
    pub async fn restore_if_was_playing(&self, id: UnitId) -> Result<bool, EngineError> {
        let was_playing = self
            .entries
            .lock()
            .get(&id)
            .map(|entry| entry.was_playing)
            .ok_or(EngineError::UnknownUnit(id))?;
        let member = self.member(id).ok_or(EngineError::UnknownUnit(id))?;

        if !was_playing || member.is_playing() {
            return Ok(false);
        }
        member.start().await?;
        Ok(true)
    }

    /// Solos the unit: every other unit is stopped and loses its solo flag, and the ones
    /// that were playing are recorded on the soloing unit for restoring later. The soloing
    /// unit's own playback is not touched.
    pub async fn solo_unit(&self, id: UnitId) -> Result<(), EngineError> {
        let soloist = self.member(id).ok_or(EngineError::UnknownUnit(id))?;
        let others: Vec<Arc<dyn BusMember>> = self
            .members()
            .into_iter()
            .filter(|m| m.id() != id)
            .collect();

        let snapshot: Vec<UnitId> = others
            .iter()
            .filter(|m| m.is_playing())
            .map(|m| m.id())
            .collect();

        {
            // Only one unit solos at a time; an earlier soloist's snapshot is dropped.
            let mut entries = self.entries.lock();
            for (other_id, entry) in entries.iter_mut() {
                if *other_id != id && entry.solo_snapshot.take().is_some() {
                    info!(unit = other_id, soloist = id, "Clearing earlier solo");
                }
            }
            if let Some(entry) = entries.get_mut(&id) {
                entry.solo_snapshot = Some(snapshot.clone());
            }
        }

        for other in others.iter() {
            other.set_solo(false);
            if let Err(e) = other.stop().await {
                warn!(unit = other.id(), error = %e, "Error stopping unit for solo");
            }
        }
        soloist.set_solo(true);

        info!(unit = id, silenced = ?snapshot, "Unit soloed");
        Ok(())
    }

    /// Ends the unit's solo and restores exactly the units that were playing when it
    /// started, regardless of what they are doing now. Returns how each was restored.
    pub async fn unsolo_unit(
        &self,
        id: UnitId,
    ) -> Result<Vec<(UnitId, RestoreMethod)>, EngineError> {
        let soloist = self.member(id).ok_or(EngineError::UnknownUnit(id))?;
        let snapshot = self
            .entries
            .lock()
            .get_mut(&id)
            .and_then(|entry| entry.solo_snapshot.take());
        soloist.set_solo(false);

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => {
                debug!(unit = id, "Unit was not soloing");
                return Ok(Vec::new());
            }
        };

        let mut restored = Vec::new();
        for other_id in snapshot {
            let Some(member) = self.member(other_id) else {
                debug!(unit = other_id, "Soloed-out unit is gone, skipping restore");
                continue;
            };
            match self.restore(member.as_ref()).await {
                Ok(method) => restored.push((other_id, method)),
                Err(e) => warn!(unit = other_id, error = %e, "Unable to restore unit after solo"),
            }
        }

        info!(unit = id, restored = restored.len(), "Solo ended");
        Ok(restored)
    }

    /// Solos the unit, or ends its solo if it is already soloing.
    pub async fn toggle_solo(&self, id: UnitId) -> Result<bool, EngineError> {
        if self.is_soloing(id) {
            self.unsolo_unit(id).await?;
            Ok(false)
        } else {
            self.solo_unit(id).await?;
            Ok(true)
        }
    }

    /// True if the unit is currently soloing.
    pub fn is_soloing(&self, id: UnitId) -> bool {
        self.entries
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.solo_snapshot.is_some())
    }

    /// Returns the soloing unit, if any.
    pub fn soloist(&self) -> Option<UnitId> {
        self.entries
            .lock()
            .iter()
            .find(|(_, entry)| entry.solo_snapshot.is_some())
            .map(|(id, _)| *id)
    }

    /// Tries start, then toggle, then re-evaluate followed by a delayed start. Only the
    /// first method that succeeds is used.
    async fn restore(&self, member: &dyn BusMember) -> Result<RestoreMethod, EngineError> {
        match member.start().await {
            Ok(()) => return Ok(RestoreMethod::Start),
            Err(e) => debug!(unit = member.id(), error = %e, "Start failed during restore"),
        }

        if !member.is_playing() {
            match member.toggle().await {
                Ok(()) if member.is_playing() => return Ok(RestoreMethod::Toggle),
                Ok(()) => debug!(unit = member.id(), "Toggle did not start unit"),
                Err(e) => debug!(unit = member.id(), error = %e, "Toggle failed during restore"),
            }
        }

        member.reevaluate().await?;
        tokio::time::sleep(self.restore_delay).await;
        member.start().await?;
        Ok(RestoreMethod::Reevaluate)
    }
}

impl Default for CoordinationBus {
    fn default() -> Self {
        CoordinationBus::new(DEFAULT_RESTORE_DELAY)
    }
}

impl fmt::Debug for CoordinationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationBus")
            .field("units", &self.entries.lock().keys().collect::<Vec<_>>())
            .field("soloist", &self.soloist())
            .finish()
    }
}

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

//! A live-coding unit: code, a sample bank, playback state, and an optional binding to
//! an evaluator.
//!
//! Code and playback status belong to the unit, not to the evaluator. An evaluator can
//! be detached and a new one attached at any time, and the unit picks up where it left
//! off: the new evaluator gets the unit's code, every sample is registered again, and a
//! unit that was playing starts playing again.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::attachment::{AttachState, AttachmentSession};
use crate::bank::SampleBank;
use crate::bus::BusMember;
use crate::codegen::{self, SILENCE};
use crate::error::EngineError;
use crate::evaluator::{Evaluator, HostElement};
use crate::render::{RenderCache, SourceReference};
use crate::resource::Materializer;

/// Identifies a unit within the engine.
pub type UnitId = u32;

/// Default time a sample registration may take.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether a unit intends to be making sound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Playing => "playing",
        };
        write!(f, "{}", status)
    }
}

/// Tunables for a unit.
#[derive(Clone, Copy, Debug)]
pub struct UnitOptions {
    /// How long a registration batch may take before it counts as failed. Attach waits
    /// this long for the initial registration, then lets it finish in the background.
    pub registration_timeout: Duration,
}

impl Default for UnitOptions {
    fn default() -> Self {
        UnitOptions {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

struct UnitState {
    code: String,
    /// When set, the code is regenerated whenever the bank changes.
    sync: bool,
    solo: bool,
    status: PlaybackStatus,
    attach_state: AttachState,
    session: Option<Arc<AttachmentSession>>,
    generation: u64,
}

/// A single live-coding unit.
pub struct Unit {
    id: UnitId,
    bank: Arc<SampleBank>,
    options: UnitOptions,
    state: Mutex<UnitState>,
    /// Serializes attach and detach. Taken before `playback` when both are needed.
    transition: tokio::sync::Mutex<()>,
    /// Serializes calls that drive the evaluator's scheduler.
    playback: tokio::sync::Mutex<()>,
}

impl Unit {
    /// Creates a detached, idle unit with an empty bank and silent code.
    pub fn new(
        id: UnitId,
        cache: Arc<RenderCache>,
        materializer: Arc<Materializer>,
        options: UnitOptions,
    ) -> Unit {
        Unit {
            id,
            bank: Arc::new(SampleBank::new(id, cache, materializer)),
            options,
            state: Mutex::new(UnitState {
                code: SILENCE.to_string(),
                sync: true,
                solo: false,
                status: PlaybackStatus::Idle,
                attach_state: AttachState::Detached,
                session: None,
                generation: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
            playback: tokio::sync::Mutex::new(()),
        }
    }

    /// The unit's id.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The unit's sample bank.
    pub fn bank(&self) -> &Arc<SampleBank> {
        &self.bank
    }

    /// The unit's current code.
    pub fn code(&self) -> String {
        self.state.lock().code.clone()
    }

    /// True if the code follows the bank.
    pub fn is_sync(&self) -> bool {
        self.state.lock().sync
    }

    /// True if the unit is soloing.
    pub fn is_solo(&self) -> bool {
        self.state.lock().solo
    }

    /// The unit's playback status.
    pub fn status(&self) -> PlaybackStatus {
        self.state.lock().status
    }

    /// True if the unit intends to be playing.
    pub fn is_playing(&self) -> bool {
        self.status() == PlaybackStatus::Playing
    }

    /// Where the unit stands in the attachment protocol.
    pub fn attach_state(&self) -> AttachState {
        self.state.lock().attach_state
    }

    /// The current attachment session, if any.
    pub fn session(&self) -> Option<Arc<AttachmentSession>> {
        self.state.lock().session.clone()
    }

    fn set_status(&self, status: PlaybackStatus) {
        self.state.lock().status = status;
    }

    fn is_current(&self, session: &Arc<AttachmentSession>) -> bool {
        self.state
            .lock()
            .session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    /// Replaces the unit's code, e.g. after a user edit. The code no longer follows the
    /// bank afterwards. The new code takes effect on the next play.
    pub async fn set_code(&self, code: &str) -> Result<(), EngineError> {
        let session = {
            let mut state = self.state.lock();
            state.code = code.to_string();
            state.sync = false;
            state.session.clone()
        };
        debug!(unit = self.id, "Code set");

        if let Some(session) = session {
            session.evaluator().set_code(code).await?;
        }
        Ok(())
    }

    /// Sets whether the code follows the bank. Turning it on regenerates the code.
    pub async fn set_sync(&self, sync: bool) {
        self.state.lock().sync = sync;
        if sync {
            self.sync_code().await;
        }
    }

    /// Renders the source, adds it to the bank and returns the new sample's name. Adding a
    /// source that is already in the bank returns the existing name.
    pub async fn add_source(&self, source: SourceReference) -> Result<String, EngineError> {
        let span = span!(Level::INFO, "add source", unit = self.id, source = %source);

        async {
            let sample = self.bank.add(source).await?;

            if let Some(session) = self.session() {
                let limit = Some(self.options.registration_timeout);
                if let Err(e) = session.register_pending(&self.bank, None, limit).await {
                    warn!(error = %e, "Unable to register new sample, will retry on next evaluation");
                }
            }

            self.sync_code().await;
            Ok::<_, EngineError>(sample.name().to_string())
        }
        .instrument(span)
        .await
    }

    /// Removes the source's sample from the bank and revokes its handle. Returns the
    /// removed sample's name.
    pub async fn remove_source(&self, source_id: &str) -> Option<String> {
        let sample = self.bank.remove(source_id)?;
        if let Some(session) = self.session() {
            session.forget(sample.name());
        }
        info!(unit = self.id, sample = sample.name(), "Source removed");

        self.sync_code().await;
        Some(sample.name().to_string())
    }

    /// Removes every sample from the bank. Returns how many were removed.
    pub async fn clear_samples(&self) -> usize {
        let removed = self.bank.clear();
        if let Some(session) = self.session() {
            session.forget_all();
        }
        info!(unit = self.id, removed = removed.len(), "Samples cleared");

        self.sync_code().await;
        removed.len()
    }

    /// Regenerates the code from the bank if the code follows the bank. A playing,
    /// attached unit re-plays so the new code is heard.
    async fn sync_code(&self) {
        let (code, session, playing) = {
            let mut state = self.state.lock();
            if !state.sync {
                return;
            }
            let code = codegen::generate(&self.bank.names());
            if code == state.code {
                return;
            }
            state.code = code.clone();
            (code, state.session.clone(), state.status == PlaybackStatus::Playing)
        };
        debug!(unit = self.id, "Code regenerated from bank");

        let Some(session) = session else {
            return;
        };
        if let Err(e) = session.evaluator().set_code(&code).await {
            warn!(unit = self.id, error = %e, "Unable to push regenerated code");
        }
        if playing {
            if let Err(e) = self.play().await {
                warn!(unit = self.id, error = %e, "Unable to re-play regenerated code");
            }
        }
    }

    /// Plays the unit's code.
    ///
    /// Silent code leaves the unit idle. A detached unit records that it should be
    /// playing and starts when an evaluator is attached. Otherwise the scheduler is
    /// stopped, any samples the code needs are registered, and the code is evaluated and
    /// started. Code that fails to evaluate is replaced by silence and the unit goes
    /// idle.
    pub async fn play(&self) -> Result<(), EngineError> {
        let _playback = self.playback.lock().await;
        self.play_locked().await
    }

    async fn play_locked(&self) -> Result<(), EngineError> {
        let (code, session) = {
            let state = self.state.lock();
            (state.code.clone(), state.session.clone())
        };

        if codegen::is_silence(&code) {
            info!(unit = self.id, "Nothing to play");
            self.set_status(PlaybackStatus::Idle);
            if let Some(session) = session {
                if let Err(e) = session.evaluator().stop().await {
                    warn!(unit = self.id, error = %e, "Error stopping evaluator");
                }
            }
            return Ok(());
        }

        let Some(session) = session else {
            info!(unit = self.id, "Unit is detached, playback will start on attach");
            self.set_status(PlaybackStatus::Playing);
            return Ok(());
        };

        // A restart must never layer a second pattern on the first.
        if let Err(e) = session.evaluator().stop().await {
            warn!(unit = self.id, error = %e, "Error stopping evaluator before play");
        }
        self.evaluate(&session, &code).await?;

        if let Err(e) = session.evaluator().start().await {
            self.set_status(PlaybackStatus::Idle);
            return Err(e.into());
        }
        self.set_status(PlaybackStatus::Playing);
        info!(unit = self.id, "Playing");
        Ok(())
    }

    /// Makes sure the code's samples are registered, then evaluates it. Falls back to
    /// silence and goes idle if the code is rejected.
    async fn evaluate(
        &self,
        session: &Arc<AttachmentSession>,
        code: &str,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.ensure_samples_for(session, code).await {
            warn!(unit = self.id, error = %e, "Unable to register samples before evaluation");
        }

        if let Err(e) = session.evaluator().evaluate(code).await {
            error!(unit = self.id, error = %e, "Evaluation failed, falling back to silence");
            if let Err(e) = session.evaluator().evaluate(SILENCE).await {
                warn!(unit = self.id, error = %e, "Unable to evaluate silence");
            }
            self.set_status(PlaybackStatus::Idle);
            return Err(EngineError::Evaluation {
                unit: self.id,
                source: e,
            });
        }
        Ok(())
    }

    /// Registers any sample the current code references that the evaluator has not
    /// seen yet. Returns the number registered.
    pub async fn ensure_samples(&self) -> Result<usize, EngineError> {
        let (code, session) = {
            let state = self.state.lock();
            (state.code.clone(), state.session.clone())
        };
        let session = session.ok_or(EngineError::Detached(self.id))?;
        self.ensure_samples_for(&session, &code).await
    }

    async fn ensure_samples_for(
        &self,
        session: &AttachmentSession,
        code: &str,
    ) -> Result<usize, EngineError> {
        let missing: Vec<String> = codegen::referenced_names(code)
            .into_iter()
            .filter(|name| !session.is_registered(name))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let unknown: Vec<&String> = missing
            .iter()
            .filter(|name| !self.bank.contains_name(name))
            .collect();
        if !unknown.is_empty() {
            warn!(unit = self.id, names = ?unknown, "Code references samples not in the bank");
        }

        session
            .register_pending(
                &self.bank,
                Some(&missing),
                Some(self.options.registration_timeout),
            )
            .await
    }

    /// Stops the unit. Always safe, attached or not.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let _playback = self.playback.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<(), EngineError> {
        let session = {
            let mut state = self.state.lock();
            state.status = PlaybackStatus::Idle;
            state.session.clone()
        };
        if let Some(session) = session {
            if let Err(e) = session.evaluator().stop().await {
                warn!(unit = self.id, error = %e, "Error stopping evaluator");
            }
        }
        info!(unit = self.id, "Stopped");
        Ok(())
    }

    /// Stops the unit if it is playing, otherwise plays it.
    pub async fn toggle(&self) -> Result<(), EngineError> {
        let _playback = self.playback.lock().await;
        if self.is_playing() {
            self.stop_locked().await
        } else {
            self.play_locked().await
        }
    }

    /// Evaluates the unit's code again without touching the scheduler.
    pub async fn reevaluate(&self) -> Result<(), EngineError> {
        let _playback = self.playback.lock().await;
        let (code, session) = {
            let state = self.state.lock();
            (state.code.clone(), state.session.clone())
        };
        let session = session.ok_or(EngineError::Detached(self.id))?;
        self.evaluate(&session, &code).await
    }

    /// Binds the unit to an evaluator hosted by the given element, replacing any earlier
    /// binding.
    ///
    /// The evaluator is given the unit's code and every sample in the bank is registered
    /// with it. Registration that takes longer than the configured timeout carries on in
    /// the background and the unit is re-evaluated when it lands. A unit that was
    /// playing starts playing on the new evaluator.
    pub async fn attach(
        self: &Arc<Self>,
        host: HostElement,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<(), EngineError> {
        let _transition = self.transition.lock().await;

        if let Some(previous) = self.take_session() {
            previous.discard();
            info!(unit = self.id, host = %previous.host(), "Replacing earlier attachment");
        }

        let (session, code, was_playing) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.attach_state = AttachState::Attaching;
            let session = Arc::new(AttachmentSession::new(
                self.id,
                state.generation,
                host,
                evaluator,
            ));
            state.session = Some(session.clone());
            (
                session,
                state.code.clone(),
                state.status == PlaybackStatus::Playing,
            )
        };
        self.bank.reset_registration();
        info!(
            unit = self.id,
            host = %session.host(),
            generation = session.generation(),
            samples = self.bank.len(),
            "Attaching"
        );

        // Overwrite whatever the element was showing before.
        if let Err(e) = session.evaluator().set_code(&code).await {
            session.discard();
            let mut state = self.state.lock();
            if state
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                state.session = None;
                state.attach_state = AttachState::Detached;
            }
            error!(unit = self.id, error = %e, "Unable to push code to evaluator");
            return Err(e.into());
        }

        let mut registration = {
            let session = session.clone();
            let bank = self.bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        let joined = tokio::time::timeout(self.options.registration_timeout, &mut registration).await;
        match joined {
            Ok(Ok(Ok(count))) => debug!(unit = self.id, registered = count, "Initial registration done"),
            Ok(Ok(Err(e))) => {
                warn!(unit = self.id, error = %e, "Initial registration failed, will retry on next evaluation")
            }
            Ok(Err(e)) => error!(unit = self.id, err = %e, "Registration task failed"),
            Err(_) => {
                warn!(
                    unit = self.id,
                    timeout = ?self.options.registration_timeout,
                    "Initial registration is slow, continuing without it"
                );
                self.reevaluate_when_registered(registration, session.clone());
            }
        }

        {
            let mut state = self.state.lock();
            if state
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                state.attach_state = AttachState::Attached;
            }
        }

        if was_playing {
            let _playback = self.playback.lock().await;
            if self.is_playing() && self.is_current(&session) {
                info!(unit = self.id, "Resuming playback on new evaluator");
                if let Err(e) = self.play_locked().await {
                    warn!(unit = self.id, error = %e, "Unable to resume playback");
                }
            }
        }

        info!(unit = self.id, host = %session.host(), "Attached");
        Ok(())
    }

    /// Once a slow registration lands, evaluates the code again so the samples are heard.
    fn reevaluate_when_registered(
        self: &Arc<Self>,
        registration: tokio::task::JoinHandle<Result<usize, EngineError>>,
        session: Arc<AttachmentSession>,
    ) {
        let unit: Weak<Unit> = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(Ok(count)) = registration.await else {
                return;
            };
            let Some(unit) = unit.upgrade() else {
                return;
            };
            if count == 0 {
                return;
            }

            let _playback = unit.playback.lock().await;
            if !unit.is_playing() || !unit.is_current(&session) {
                return;
            }
            debug!(unit = unit.id, registered = count, "Late registration landed, re-evaluating");
            if let Err(e) = unit.evaluate(&session, &unit.code()).await {
                warn!(unit = unit.id, error = %e, "Re-evaluation after late registration failed");
            }
        });
    }

    fn take_session(&self) -> Option<Arc<AttachmentSession>> {
        let mut state = self.state.lock();
        state.attach_state = AttachState::Detached;
        state.session.take()
    }

    /// Unbinds the unit from its evaluator and returns the hosting element. The unit keeps
    /// its code, samples, and playback status. Late results from the old evaluator are
    /// ignored.
    pub async fn detach(&self) -> Option<HostElement> {
        let _transition = self.transition.lock().await;
        let session = self.take_session()?;
        session.discard();
        info!(
            unit = self.id,
            host = %session.host(),
            status = %self.status(),
            "Detached"
        );
        Some(session.host().clone())
    }

    /// Stops the unit, unbinds it, and releases every sample.
    pub async fn dispose(&self) {
        if let Err(e) = self.stop().await {
            warn!(unit = self.id, error = %e, "Error stopping unit during dispose");
        }
        self.detach().await;
        let removed = self.bank.clear();
        debug!(unit = self.id, released = removed.len(), "Unit disposed");
    }
}

#[async_trait]
impl BusMember for Unit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn is_playing(&self) -> bool {
        Unit::is_playing(self)
    }

    fn set_solo(&self, solo: bool) {
        self.state.lock().solo = solo;
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.play().await
    }

    async fn stop(&self) -> Result<(), EngineError> {
        Unit::stop(self).await
    }

    async fn toggle(&self) -> Result<(), EngineError> {
        Unit::toggle(self).await
    }

    async fn reevaluate(&self) -> Result<(), EngineError> {
        Unit::reevaluate(self).await
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("attach_state", &state.attach_state)
            .field("sync", &state.sync)
            .field("solo", &state.solo)
            .field("samples", &self.bank.len())
            .finish()
    }
}

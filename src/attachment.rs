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

//! The transient binding between a unit and a live evaluator.
//!
//! A session is created on every attach and thrown away on detach. It never inherits
//! registrations from an earlier session, and once discarded it ignores every late
//! result instead of failing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::bank::{RegistrationStatus, SampleBank};
use crate::error::EngineError;
use crate::evaluator::{Evaluator, EvaluatorError, HostElement};
use crate::resource::ResourceHandle;
use crate::unit::UnitId;

/// Where a unit stands in the attachment protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// No evaluator is bound.
    Detached,
    /// An evaluator is being bound and synchronized.
    Attaching,
    /// An evaluator is bound and synchronized.
    Attached,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            AttachState::Detached => "detached",
            AttachState::Attaching => "attaching",
            AttachState::Attached => "attached",
        };
        write!(f, "{}", state)
    }
}

/// One binding of a unit to an evaluator and its hosting element.
pub struct AttachmentSession {
    unit: UnitId,
    /// Distinguishes successive sessions of the same unit.
    generation: u64,
    host: HostElement,
    evaluator: Arc<dyn Evaluator>,
    /// Names confirmed registered with this evaluator.
    registered: Mutex<HashSet<String>>,
    /// Serializes registration batches against this evaluator.
    registration: tokio::sync::Mutex<()>,
    /// Incremented after every completed registration batch.
    last_registration: AtomicU64,
    discarded: AtomicBool,
}

impl AttachmentSession {
    /// Creates a new session. Nothing is registered yet.
    pub fn new(
        unit: UnitId,
        generation: u64,
        host: HostElement,
        evaluator: Arc<dyn Evaluator>,
    ) -> AttachmentSession {
        AttachmentSession {
            unit,
            generation,
            host,
            evaluator,
            registered: Mutex::new(HashSet::new()),
            registration: tokio::sync::Mutex::new(()),
            last_registration: AtomicU64::new(0),
            discarded: AtomicBool::new(false),
        }
    }

    /// The evaluator bound by this session.
    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    /// The element hosting the evaluator.
    pub fn host(&self) -> &HostElement {
        &self.host
    }

    /// The session's generation within its unit.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Marks the session as discarded. It is never used again after this.
    pub(crate) fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    /// True once the unit has detached from this session.
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// True if the name is confirmed registered with this session's evaluator.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.lock().contains(name)
    }

    /// Returns the names confirmed registered with this session's evaluator.
    pub fn registered_names(&self) -> HashSet<String> {
        self.registered.lock().clone()
    }

    /// Returns how many registration batches have completed.
    pub fn registration_marker(&self) -> u64 {
        self.last_registration.load(Ordering::Acquire)
    }

    /// Drops the name from the registered set, e.g. after its sample was removed.
    pub(crate) fn forget(&self, name: &str) {
        self.registered.lock().remove(name);
    }

    pub(crate) fn forget_all(&self) {
        self.registered.lock().clear();
    }

    /// Registers the bank's samples that this evaluator has not seen yet. When `only` is
    /// given, the batch is limited to those names.
    ///
    /// Batches against one session never overlap, and each batch works from the bank's
    /// current contents once it holds the registration lock, so a batch queued behind
    /// another never re-sends what the first one registered. With a `limit`, waiting for
    /// the lock and the evaluator together may take no longer than that, and running out
    /// of time is a registration failure. Returns the number of samples registered. A
    /// discarded session registers nothing and reports success.
    pub async fn register_pending(
        &self,
        bank: &SampleBank,
        only: Option<&[String]>,
        limit: Option<Duration>,
    ) -> Result<usize, EngineError> {
        let deadline = limit.map(|limit| (limit, Instant::now() + limit));

        let _guard = match deadline {
            Some((limit, deadline)) => timeout_at(deadline, self.registration.lock())
                .await
                .map_err(|_| {
                    warn!(unit = self.unit, ?limit, "Timed out waiting for an earlier registration");
                    EngineError::Registration {
                        unit: self.unit,
                        source: EvaluatorError::Timeout(limit),
                    }
                })?,
            None => self.registration.lock().await,
        };
        if self.is_discarded() {
            debug!(unit = self.unit, "Skipping registration for a discarded session");
            return Ok(0);
        }

        let pending: Vec<_> = bank
            .unregistered(&self.registered_names())
            .into_iter()
            .filter(|s| only.map_or(true, |names| names.iter().any(|n| n == s.name())))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let batch: HashMap<String, ResourceHandle> = pending
            .iter()
            .map(|s| (s.name().to_string(), s.handle().clone()))
            .collect();

        debug!(
            unit = self.unit,
            generation = self.generation,
            samples = batch.len(),
            "Registering samples"
        );

        let request = self.evaluator.register_samples(batch);
        let result = match deadline {
            Some((limit, deadline)) => timeout_at(deadline, request)
                .await
                .unwrap_or(Err(EvaluatorError::Timeout(limit))),
            None => request.await,
        };

        // The unit may have detached, removed or replaced samples while the evaluator was
        // busy. Only samples that are still live in the bank are touched.
        if self.is_discarded() {
            debug!(unit = self.unit, "Registration finished after detach, ignoring");
            return Ok(0);
        }
        let live: Vec<_> = pending
            .iter()
            .filter(|s| {
                bank.by_name(s.name())
                    .is_some_and(|current| Arc::ptr_eq(&current, *s))
            })
            .collect();

        if let Err(e) = result {
            if !live.is_empty() {
                for sample in live {
                    sample.set_status(RegistrationStatus::Failed);
                }
                bank.mark_unregistered();
            }
            warn!(unit = self.unit, error = %e, "Sample registration failed");
            return Err(EngineError::Registration {
                unit: self.unit,
                source: e,
            });
        }

        let count = live.len();
        {
            let mut registered = self.registered.lock();
            for sample in live {
                registered.insert(sample.name().to_string());
                sample.set_status(RegistrationStatus::Registered);
            }
        }
        bank.mark_all_registered();
        let marker = self.last_registration.fetch_add(1, Ordering::AcqRel) + 1;

        info!(
            unit = self.unit,
            generation = self.generation,
            registered = count,
            marker,
            "Samples registered"
        );
        Ok(count)
    }
}

impl fmt::Debug for AttachmentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentSession")
            .field("unit", &self.unit)
            .field("generation", &self.generation)
            .field("host", &self.host)
            .field("registered", &self.registered.lock().len())
            .field("discarded", &self.is_discarded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::evaluator::mock;
    use crate::render::{RenderCache, SourceReference};
    use crate::resource::Materializer;
    use crate::testutil::CountingRenderer;

    fn bank() -> Arc<SampleBank> {
        let cache = Arc::new(RenderCache::new(Arc::new(CountingRenderer::new())));
        Arc::new(SampleBank::new(1, cache, Arc::new(Materializer::default())))
    }

    fn session(evaluator: &mock::Evaluator) -> Arc<AttachmentSession> {
        Arc::new(AttachmentSession::new(
            1,
            1,
            HostElement::new("editor-1"),
            Arc::new(evaluator.clone()),
        ))
    }

    #[tokio::test]
    async fn test_registers_only_the_delta() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();
        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 1);

        bank.add(SourceReference::with_defaults("b")).await.unwrap();
        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 1);
        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 0);

        assert_eq!(
            evaluator.registration_batches(),
            vec![vec!["unit1_evo_0".to_string()], vec!["unit1_evo_1".to_string()]]
        );
        assert!(!bank.has_unregistered());
        assert_eq!(session.registration_marker(), 2);
    }

    #[tokio::test]
    async fn test_filtered_registration() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();
        bank.add(SourceReference::with_defaults("b")).await.unwrap();

        let only = vec!["unit1_evo_1".to_string()];
        assert_eq!(session.register_pending(&bank, Some(&only), None).await.unwrap(), 1);
        assert!(session.is_registered("unit1_evo_1"));
        assert!(!session.is_registered("unit1_evo_0"));
        assert!(bank.has_unregistered());
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        let session = session(&evaluator);
        evaluator.set_fail_registration(true);

        let sample = bank.add(SourceReference::with_defaults("a")).await.unwrap();
        assert!(matches!(
            session.register_pending(&bank, None, None).await,
            Err(EngineError::Registration { .. })
        ));
        assert_eq!(sample.status(), RegistrationStatus::Failed);
        assert!(bank.has_unregistered());

        evaluator.set_fail_registration(false);
        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 1);
        assert_eq!(sample.status(), RegistrationStatus::Registered);
    }

    #[tokio::test]
    async fn test_concurrent_batches_do_not_overlap() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_millis(20)));
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();
        bank.add(SourceReference::with_defaults("b")).await.unwrap();

        let (first, second) = tokio::join!(
            session.register_pending(&bank, None, None),
            session.register_pending(&bank, None, None)
        );

        assert_eq!(first.unwrap() + second.unwrap(), 2);
        assert_eq!(evaluator.registration_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_discarded_session_is_harmless() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_millis(30)));
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();

        let in_flight = {
            let session = session.clone();
            let bank = bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.discard();

        assert_eq!(in_flight.await.unwrap().unwrap(), 0);
        assert!(session.registered_names().is_empty());

        // Nothing more is ever sent through a discarded session.
        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 0);
        assert_eq!(evaluator.registration_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_removed_during_registration() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_millis(30)));
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();

        let in_flight = {
            let session = session.clone();
            let bank = bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        bank.remove("a");

        assert_eq!(in_flight.await.unwrap().unwrap(), 0);
        assert!(!session.is_registered("unit1_evo_0"));
    }

    #[tokio::test]
    async fn test_bank_cleared_during_registration() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_millis(30)));
        let session = session(&evaluator);

        let old = bank.add(SourceReference::with_defaults("a")).await.unwrap();
        let in_flight = {
            let session = session.clone();
            let bank = bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Clearing resets the counter, so the replacement reuses the old name.
        bank.clear();
        session.forget_all();
        let replacement = bank.add(SourceReference::with_defaults("b")).await.unwrap();
        assert_eq!(replacement.name(), old.name());

        assert_eq!(in_flight.await.unwrap().unwrap(), 0);
        assert!(!session.is_registered("unit1_evo_0"));
        assert_eq!(replacement.status(), RegistrationStatus::Pending);
        assert!(bank.has_unregistered());
        assert_eq!(evaluator.registered_handle("unit1_evo_0").as_ref(), Some(old.handle()));

        assert_eq!(session.register_pending(&bank, None, None).await.unwrap(), 1);
        assert_eq!(
            evaluator.registered_handle("unit1_evo_0").as_ref(),
            Some(replacement.handle())
        );
        assert_eq!(replacement.status(), RegistrationStatus::Registered);
    }

    #[tokio::test]
    async fn test_late_failure_of_discarded_session_leaves_bank_alone() {
        let bank = bank();
        let old_evaluator = mock::Evaluator::get("old-evaluator");
        old_evaluator.set_registration_delay(Some(Duration::from_millis(30)));
        old_evaluator.set_fail_registration(true);
        let old_session = session(&old_evaluator);

        let sample = bank.add(SourceReference::with_defaults("a")).await.unwrap();
        let in_flight = {
            let session = old_session.clone();
            let bank = bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        old_session.discard();

        let fresh_evaluator = mock::Evaluator::get("fresh-evaluator");
        let fresh_session = Arc::new(AttachmentSession::new(
            1,
            2,
            HostElement::new("editor-2"),
            Arc::new(fresh_evaluator.clone()),
        ));
        assert_eq!(fresh_session.register_pending(&bank, None, None).await.unwrap(), 1);
        assert_eq!(sample.status(), RegistrationStatus::Registered);
        assert!(!bank.has_unregistered());

        assert_eq!(in_flight.await.unwrap().unwrap(), 0);
        assert_eq!(sample.status(), RegistrationStatus::Registered);
        assert!(!bank.has_unregistered());
    }

    #[tokio::test]
    async fn test_registration_time_limit() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_secs(3600)));
        let session = session(&evaluator);

        let sample = bank.add(SourceReference::with_defaults("a")).await.unwrap();
        let result = session
            .register_pending(&bank, None, Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Registration {
                source: EvaluatorError::Timeout(_),
                ..
            })
        ));
        assert_eq!(sample.status(), RegistrationStatus::Failed);
        assert!(bank.has_unregistered());
        assert!(!session.is_registered("unit1_evo_0"));

        evaluator.set_registration_delay(None);
        assert_eq!(
            session
                .register_pending(&bank, None, Some(Duration::from_millis(100)))
                .await
                .unwrap(),
            1
        );
        assert_eq!(sample.status(), RegistrationStatus::Registered);
    }

    #[tokio::test]
    async fn test_time_limit_covers_waiting_behind_another_batch() {
        let bank = bank();
        let evaluator = mock::Evaluator::get("mock-evaluator");
        evaluator.set_registration_delay(Some(Duration::from_secs(3600)));
        let session = session(&evaluator);

        bank.add(SourceReference::with_defaults("a")).await.unwrap();
        let stuck = {
            let session = session.clone();
            let bank = bank.clone();
            tokio::spawn(async move { session.register_pending(&bank, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            session.register_pending(&bank, None, Some(Duration::from_millis(10))),
        )
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Registration {
                source: EvaluatorError::Timeout(_),
                ..
            })
        ));
        stuck.abort();
    }
}

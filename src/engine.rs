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
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::bus::{BusMember, CoordinationBus};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::render::{RenderCache, Renderer};
use crate::resource::Materializer;
use crate::unit::{Unit, UnitId, UnitOptions};

/// The application root. Owns the shared render cache, resource materializer and
/// coordination bus, and every unit.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<RenderCache>,
    materializer: Arc<Materializer>,
    bus: Arc<CoordinationBus>,
    units: RwLock<BTreeMap<UnitId, Arc<Unit>>>,
    next_unit_id: AtomicU32,
}

impl Engine {
    /// Creates an engine that renders with the given renderer.
    pub fn new(config: EngineConfig, renderer: Arc<dyn Renderer>) -> Engine {
        let materializer = Materializer::new(config.resource_prefix(), config.silence_threshold());
        let bus = CoordinationBus::new(config.restore_delay());
        info!(
            prefix = config.resource_prefix(),
            registration_timeout = ?config.registration_timeout(),
            restore_delay = ?config.restore_delay(),
            "Engine created"
        );

        Engine {
            config,
            cache: Arc::new(RenderCache::new(renderer)),
            materializer: Arc::new(materializer),
            bus: Arc::new(bus),
            units: RwLock::new(BTreeMap::new()),
            next_unit_id: AtomicU32::new(1),
        }
    }

    /// Creates a new unit and registers it on the bus.
    pub fn create_unit(&self) -> Arc<Unit> {
        let id = self.next_unit_id.fetch_add(1, Ordering::SeqCst);
        let unit = Arc::new(Unit::new(
            id,
            self.cache.clone(),
            self.materializer.clone(),
            UnitOptions {
                registration_timeout: self.config.registration_timeout(),
            },
        ));

        let member: Arc<dyn BusMember> = unit.clone();
        self.bus.register_unit(&member);
        self.units.write().insert(id, unit.clone());

        info!(unit = id, "Unit created");
        unit
    }

    /// Returns the unit with the id.
    pub fn unit(&self, id: UnitId) -> Option<Arc<Unit>> {
        self.units.read().get(&id).cloned()
    }

    /// Returns every unit in id order.
    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.read().values().cloned().collect()
    }

    /// Stops, detaches and removes the unit, releasing its samples.
    pub async fn remove_unit(&self, id: UnitId) -> Result<(), EngineError> {
        let unit = self
            .units
            .write()
            .remove(&id)
            .ok_or(EngineError::UnknownUnit(id))?;
        self.bus.unregister_unit(id);
        unit.dispose().await;

        debug!(
            unit = id,
            live_resources = self.materializer.live_count(),
            "Unit removed"
        );
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<CoordinationBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("units", &self.units.read().keys().collect::<Vec<_>>())
            .field("cache", &self.cache)
            .field("materializer", &self.materializer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::evaluator::{mock, HostElement};
    use crate::render::SourceReference;
    use crate::testutil::CountingRenderer;

    fn engine() -> (Engine, Arc<CountingRenderer>) {
        let renderer = Arc::new(CountingRenderer::new().with_delay(Duration::from_millis(20)));
        (
            Engine::new(EngineConfig::default(), renderer.clone()),
            renderer,
        )
    }

    #[tokio::test]
    async fn test_units_share_one_render() {
        let (engine, renderer) = engine();
        let first = engine.create_unit();
        let second = engine.create_unit();
        assert_eq!((first.id(), second.id()), (1, 2));

        let source = SourceReference::with_defaults("shared");
        let (a, b) = tokio::join!(
            first.add_source(source.clone()),
            second.add_source(source.clone())
        );
        assert_eq!(a.unwrap(), "unit1_evo_0");
        assert_eq!(b.unwrap(), "unit2_evo_0");
        assert_eq!(renderer.calls_for("shared"), 1);

        // Each unit holds its own handle, so removing one leaves the other playable.
        let first_handle = first.bank().get("shared").unwrap().handle().clone();
        let second_handle = second.bank().get("shared").unwrap().handle().clone();
        assert_ne!(first_handle, second_handle);

        first.remove_source("shared").await.unwrap();
        assert!(!engine.materializer().is_live(&first_handle));
        assert!(engine.materializer().is_live(&second_handle));
        assert!(engine.cache().contains(&source));
    }

    #[tokio::test]
    async fn test_remove_unit() {
        let (engine, _) = engine();
        let unit = engine.create_unit();
        let evaluator = mock::Evaluator::get("editor-1");
        unit.attach(HostElement::new("editor-1"), Arc::new(evaluator.clone()))
            .await
            .unwrap();
        unit.add_source(SourceReference::with_defaults("a")).await.unwrap();
        unit.play().await.unwrap();

        engine.remove_unit(unit.id()).await.unwrap();
        assert!(engine.unit(unit.id()).is_none());
        assert!(!engine.bus().is_registered(unit.id()));
        assert!(!evaluator.is_playing());
        assert_eq!(engine.materializer().live_count(), 0);

        assert!(matches!(
            engine.remove_unit(unit.id()).await,
            Err(EngineError::UnknownUnit(_))
        ));
        // Ids are never reused.
        assert_eq!(engine.create_unit().id(), 2);
    }

    #[tokio::test]
    async fn test_solo_through_units() {
        let (engine, _) = engine();
        let mut evaluators = Vec::new();
        for _ in 0..3 {
            let unit = engine.create_unit();
            let evaluator = mock::Evaluator::get(&format!("editor-{}", unit.id()));
            unit.attach(
                HostElement::new(&format!("editor-{}", unit.id())),
                Arc::new(evaluator.clone()),
            )
            .await
            .unwrap();
            unit.add_source(SourceReference::with_defaults(&format!("source-{}", unit.id())))
                .await
                .unwrap();
            evaluators.push(evaluator);
        }
        let units = engine.units();
        units[0].play().await.unwrap();
        units[1].play().await.unwrap();

        engine.bus().solo_unit(1).await.unwrap();
        assert!(units[0].is_solo());
        assert!(units[0].is_playing());
        assert!(!units[1].is_playing());
        assert!(!evaluators[1].is_playing());

        engine.bus().unsolo_unit(1).await.unwrap();
        assert!(!units[0].is_solo());
        assert!(units[1].is_playing());
        assert!(evaluators[1].is_playing());
        assert!(!units[2].is_playing());
        assert!(!evaluators[2].is_playing());
    }

    #[tokio::test]
    async fn test_stop_all_start_all() {
        let (engine, _) = engine();
        let playing = engine.create_unit();
        let idle = engine.create_unit();
        playing
            .add_source(SourceReference::with_defaults("a"))
            .await
            .unwrap();
        idle.add_source(SourceReference::with_defaults("b")).await.unwrap();
        playing.play().await.unwrap();

        engine.bus().stop_all().await;
        assert!(!playing.is_playing());

        engine.bus().start_all().await;
        assert!(playing.is_playing());
        assert!(!idle.is_playing());
    }
}

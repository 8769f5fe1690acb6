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

//! Live-coding unit engine for evolved sound renders.
//!
//! This crate provides:
//! - A process-wide render cache with single-flight rendering per source
//! - Revocable resource handles for rendered audio
//! - Per-unit sample banks with collision-free naming
//! - An attachment protocol that binds a unit to a transient evaluator
//! - Per-unit playback and a coordination bus for stop-all, start-all and solo

pub mod attachment;
pub mod bank;
pub mod bus;
pub mod codegen;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod render;
pub mod resource;
#[cfg(test)]
mod testutil;
pub mod unit;

pub use engine::Engine;
pub use error::EngineError;
pub use render::SourceReference;
pub use unit::{PlaybackStatus, Unit, UnitId};

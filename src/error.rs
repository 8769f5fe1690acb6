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
use crate::config::ConfigError;
use crate::evaluator::EvaluatorError;
use crate::render::RenderError;
use crate::unit::UnitId;

/// Typed error for engine operations so callers can tell a failed render from a
/// rejected registration or broken code without string matching.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Unit {unit} failed to register samples: {source}")]
    Registration {
        unit: UnitId,
        #[source]
        source: EvaluatorError,
    },

    #[error("Unit {unit} failed to evaluate code: {source}")]
    Evaluation {
        unit: UnitId,
        #[source]
        source: EvaluatorError,
    },

    #[error("Evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    #[error("Sample name {0} is already in use")]
    NameCollision(String),

    #[error("Unit {0} does not exist")]
    UnknownUnit(UnitId),

    #[error("Unit {0} is not attached to an evaluator")]
    Detached(UnitId),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

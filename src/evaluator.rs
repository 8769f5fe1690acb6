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
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::resource::ResourceHandle;

pub mod mock;

/// Errors reported by an evaluator adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluatorError {
    #[error("Code rejected: {0}")]
    Code(String),

    #[error("Sample registration rejected: {0}")]
    Registration(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// The pattern-execution engine a unit's code runs against. Adapters implement the
/// whole surface; the engine never probes for optional capabilities.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Replaces the code shown in the evaluator's editor without running it.
    async fn set_code(&self, code: &str) -> Result<(), EvaluatorError>;

    /// Evaluates the code, replacing whatever pattern was running.
    async fn evaluate(&self, code: &str) -> Result<(), EvaluatorError>;

    /// Starts the scheduler.
    async fn start(&self) -> Result<(), EvaluatorError>;

    /// Halts the scheduler and silences output immediately.
    async fn stop(&self) -> Result<(), EvaluatorError>;

    /// Registers named samples so code can refer to them.
    async fn register_samples(
        &self,
        samples: HashMap<String, ResourceHandle>,
    ) -> Result<(), EvaluatorError>;
}

/// The UI element hosting an evaluator. Opaque to the engine apart from its identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostElement {
    id: String,
}

impl HostElement {
    /// Creates a new host element handle.
    pub fn new(id: &str) -> HostElement {
        HostElement { id: id.to_string() }
    }

    /// The element's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for HostElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

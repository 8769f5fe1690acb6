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
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::EvaluatorError;
use crate::resource::ResourceHandle;

#[derive(Default)]
struct State {
    code: String,
    evaluated: Vec<String>,
    registered: HashMap<String, ResourceHandle>,
    registration_batches: Vec<Vec<String>>,
    playing: bool,
    start_calls: usize,
    stop_calls: usize,
    fail_code_containing: Option<String>,
    fail_registration: bool,
    fail_start: bool,
    registration_delay: Option<Duration>,
}

/// A mock evaluator. Doesn't run any patterns, but records everything it is asked to do.
#[derive(Clone)]
pub struct Evaluator {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Evaluator {
    /// Gets a new mock evaluator with the given name.
    pub fn get(name: &str) -> Evaluator {
        Evaluator {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Rejects any code containing the given text.
    pub fn fail_code_containing(&self, text: &str) {
        self.state.lock().fail_code_containing = Some(text.to_string());
    }

    /// Makes sample registration fail until cleared.
    pub fn set_fail_registration(&self, fail: bool) {
        self.state.lock().fail_registration = fail;
    }

    /// Makes start fail until cleared.
    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Delays every registration by the given amount.
    pub fn set_registration_delay(&self, delay: Option<Duration>) {
        self.state.lock().registration_delay = delay;
    }

    /// Returns the code last pushed with set_code.
    pub fn code(&self) -> String {
        self.state.lock().code.clone()
    }

    /// Returns every piece of code evaluated, in order.
    pub fn evaluated(&self) -> Vec<String> {
        self.state.lock().evaluated.clone()
    }

    /// Returns the last evaluated code.
    pub fn last_evaluated(&self) -> Option<String> {
        self.state.lock().evaluated.last().cloned()
    }

    /// True if the scheduler is running.
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Returns the names registered so far.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().registered.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the handle registered under the name.
    pub fn registered_handle(&self, name: &str) -> Option<ResourceHandle> {
        self.state.lock().registered.get(name).cloned()
    }

    /// Returns the names in each successful registration call.
    pub fn registration_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().registration_batches.clone()
    }

    /// Returns how many times start was called.
    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    /// Returns how many times stop was called.
    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

#[async_trait]
impl super::Evaluator for Evaluator {
    async fn set_code(&self, code: &str) -> Result<(), EvaluatorError> {
        self.state.lock().code = code.to_string();
        Ok(())
    }

    async fn evaluate(&self, code: &str) -> Result<(), EvaluatorError> {
        let mut state = self.state.lock();
        if let Some(fail) = &state.fail_code_containing {
            if code.contains(fail.as_str()) {
                return Err(EvaluatorError::Code(format!("unexpected token '{}'", fail)));
            }
        }
        info!(evaluator = self.name, code, "Evaluating (mock)");
        state.evaluated.push(code.to_string());
        Ok(())
    }

    async fn start(&self) -> Result<(), EvaluatorError> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if state.fail_start {
            return Err(EvaluatorError::Transport("scheduler unavailable".to_string()));
        }
        state.playing = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EvaluatorError> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.playing = false;
        Ok(())
    }

    async fn register_samples(
        &self,
        samples: HashMap<String, ResourceHandle>,
    ) -> Result<(), EvaluatorError> {
        let delay = self.state.lock().registration_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_registration {
            return Err(EvaluatorError::Registration(
                "sample map rejected".to_string(),
            ));
        }
        let mut names: Vec<String> = samples.keys().cloned().collect();
        names.sort();
        state.registration_batches.push(names);
        state.registered.extend(samples);
        Ok(())
    }
}

impl fmt::Display for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

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

//! Pattern code derived from a unit's samples, and sample names found in code.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::unit::UnitId;

/// Code that plays nothing. Evaluating it is always safe.
pub const SILENCE: &str = "silence";

/// Gain applied to each generated sample line.
const DEFAULT_GAIN: &str = "0.8";

static SAMPLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bunit\d+_evo_\d+\b").expect("sample name pattern is valid"));

/// Returns the name for a unit's nth sample.
pub fn sample_name(unit: UnitId, index: u64) -> String {
    format!("unit{}_evo_{}", unit, index)
}

/// Generates code that plays every named sample together.
pub fn generate(names: &[String]) -> String {
    match names {
        [] => SILENCE.to_string(),
        [name] => sample_line(name),
        _ => {
            let lines: Vec<String> = names.iter().map(|n| format!("  {}", sample_line(n))).collect();
            format!("stack(\n{}\n)", lines.join(",\n"))
        }
    }
}

fn sample_line(name: &str) -> String {
    format!("s(\"{}\").gain({})", name, DEFAULT_GAIN)
}

/// True if the code plays nothing.
pub fn is_silence(code: &str) -> bool {
    let code = code.trim();
    code.is_empty() || code == SILENCE
}

/// Returns the distinct sample names referenced by the code, in order of first appearance.
pub fn referenced_names(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    SAMPLE_NAME
        .find_iter(code)
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

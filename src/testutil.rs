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
use std::{
    collections::{HashMap, HashSet},
    error::Error,
    f32::consts::PI,
    fs::File,
    path::Path,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;

use crate::render::{AudioBuffer, RenderError, Renderer, SourceReference, UNSHIFTED_PITCH};

const TEST_SAMPLE_RATE: u32 = 44100;
const TEST_FREQUENCY: f32 = 440.0;

/// Generate a mono sine wave at full scale.
pub fn sine(frequency: f32, sample_rate: u32, count: usize) -> Vec<f32> {
    (0..count)
        .map(|i| (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Write mono 32-bit float samples to a wav file.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), Box<dyn Error>> {
    let mut writer = WavWriter::new(
        File::create(path)?,
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Wait for the given async predicate to return true or fail.
pub async fn eventually_async<F, Fut>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = SystemTime::now();
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(3);

    loop {
        let elapsed = start.elapsed();
        if elapsed.is_err() {
            panic!("System time error");
        }
        let elapsed = elapsed.unwrap();

        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate().await {
            return;
        }
        tokio::time::sleep(tick).await;
    }
}

#[derive(Default)]
struct CountingState {
    calls: HashMap<String, usize>,
    failing: HashSet<String>,
    empty: HashSet<String>,
}

/// A renderer that synthesizes a tone for any source and counts how often each source
/// is rendered.
#[derive(Default)]
pub struct CountingRenderer {
    delay: Option<Duration>,
    state: Mutex<CountingState>,
}

impl CountingRenderer {
    pub fn new() -> CountingRenderer {
        CountingRenderer::default()
    }

    /// Makes every render take at least the given time.
    pub fn with_delay(mut self, delay: Duration) -> CountingRenderer {
        self.delay = Some(delay);
        self
    }

    /// Returns how many renders were started for the source id.
    pub fn calls_for(&self, source_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .get(source_id)
            .copied()
            .unwrap_or(0)
    }

    /// Makes renders of the source id fail.
    pub fn fail_source(&self, source_id: &str) {
        self.state.lock().failing.insert(source_id.to_string());
    }

    /// Lets renders of the source id succeed again.
    pub fn heal_source(&self, source_id: &str) {
        self.state.lock().failing.remove(source_id);
    }

    /// Makes renders of the source id produce no audio.
    pub fn empty_source(&self, source_id: &str) {
        self.state.lock().empty.insert(source_id.to_string());
    }
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render(&self, source: &SourceReference) -> Result<AudioBuffer, RenderError> {
        let (failing, empty) = {
            let mut state = self.state.lock();
            *state.calls.entry(source.source_id().to_string()).or_insert(0) += 1;
            (
                state.failing.contains(source.source_id()),
                state.empty.contains(source.source_id()),
            )
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if failing {
            return Err(RenderError::Fetch {
                source_id: source.source_id().to_string(),
                message: "renderer unavailable".to_string(),
            });
        }
        if empty {
            return Ok(AudioBuffer::new(Vec::new(), 1, TEST_SAMPLE_RATE));
        }

        let semitones = (source.pitch() - UNSHIFTED_PITCH) as f32;
        let frequency = TEST_FREQUENCY * 2f32.powf(semitones / 12.0);
        let count = (source.duration().as_secs_f64() * TEST_SAMPLE_RATE as f64) as usize;
        let gain = source.velocity().min(127) as f32 / 127.0;
        let samples = sine(frequency, TEST_SAMPLE_RATE, count)
            .into_iter()
            .map(|s| s * gain)
            .collect();
        Ok(AudioBuffer::new(samples, 1, TEST_SAMPLE_RATE))
    }
}

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
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, warn};

use super::buffer::resample_linear;
use super::{AudioBuffer, RenderError, Renderer, SourceReference, UNSHIFTED_PITCH};

/// File extensions tried, in order, when resolving a source.
const EXTENSIONS: [&str; 4] = ["wav", "flac", "mp3", "ogg"];

/// Renders sources from a directory of pre-rendered evolution output.
/// A source with id `abc` is read from `<root>/abc.wav` (or flac, mp3, ogg).
pub struct FileRenderer {
    root: PathBuf,
}

impl FileRenderer {
    /// Creates a renderer over the given directory.
    pub fn new(root: &Path) -> FileRenderer {
        FileRenderer {
            root: root.to_path_buf(),
        }
    }

    /// Returns the file backing the source, if there is one.
    pub fn resolve(&self, source_id: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", source_id, ext)))
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl Renderer for FileRenderer {
    async fn render(&self, source: &SourceReference) -> Result<AudioBuffer, RenderError> {
        // Ids become file names, so anything that could walk out of the root is rejected.
        if source.source_id().is_empty()
            || source
                .source_id()
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '.')
        {
            return Err(RenderError::NotFound(source.source_id().to_string()));
        }
        source.validate()?;

        let path = self
            .resolve(source.source_id())
            .ok_or_else(|| RenderError::NotFound(source.source_id().to_string()))?;

        let source = source.clone();
        tokio::task::spawn_blocking(move || {
            let decoded = decode_file(&path)?;
            debug!(
                path = ?path,
                frames = decoded.frames(),
                channels = decoded.channel_count(),
                "Decoded source file"
            );
            Ok(apply_render_parameters(&decoded, &source))
        })
        .await
        .map_err(|e| RenderError::Task(e.to_string()))?
    }
}

/// Decodes an entire audio file into memory as interleaved f32 samples.
fn decode_file(path: &Path) -> Result<AudioBuffer, RenderError> {
    let file = File::open(path).map_err(|e| {
        RenderError::Io(Arc::new(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        )))
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let file_path = path.to_string_lossy().to_string();
    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| RenderError::Decode(format!("'{}': {}", file_path, e)))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| RenderError::Decode(format!("'{}': no audio track found", file_path)))?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.ok_or_else(|| {
        RenderError::Decode(format!("'{}': sample rate not specified", file_path))
    })?;
    let mut channel_count = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| RenderError::Decode(format!("'{}': {}", file_path, e)))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(RenderError::Decode(format!("'{}': {}", file_path, e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                // A corrupt packet is skipped rather than failing the whole render.
                warn!(path = %file_path, error = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(RenderError::Decode(format!("'{}': {}", file_path, e))),
        };

        let spec = *decoded.spec();
        if channel_count == 0 {
            channel_count = spec.channels.count() as u16;
        }
        let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buffer.samples());
    }

    if channel_count == 0 || samples.is_empty() {
        return Err(RenderError::Empty(file_path));
    }

    Ok(AudioBuffer::new(samples, channel_count, sample_rate))
}

/// Trims, pitch shifts and scales decoded audio according to the source's render parameters.
fn apply_render_parameters(decoded: &AudioBuffer, source: &SourceReference) -> AudioBuffer {
    let channels = decoded.channel_count() as usize;
    let max_frames = (source.duration().as_secs_f64() * decoded.sample_rate() as f64).round() as usize;
    let frames = decoded.frames().min(max_frames);
    let trimmed = &decoded.samples()[..frames * channels];

    // Playing a stretched buffer at the original rate lowers the pitch, so the ratio is
    // the inverse of the frequency ratio.
    let semitones = (source.pitch() - UNSHIFTED_PITCH) as f64;
    let shifted = if semitones == 0.0 {
        trimmed.to_vec()
    } else {
        resample_linear(trimmed, decoded.channel_count(), 2f64.powf(-semitones / 12.0))
    };

    let gain = source.velocity().min(127) as f32 / 127.0;
    let scaled = shifted.into_iter().map(|s| s * gain).collect();

    AudioBuffer::new(scaled, decoded.channel_count(), decoded.sample_rate())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::{sine, write_wav};

    #[tokio::test]
    async fn test_render_wav() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("genome-1.wav"), &sine(440.0, 44100, 44100), 44100).unwrap();

        let renderer = FileRenderer::new(dir.path());
        let source = SourceReference::new("genome-1", Duration::from_millis(500), 60, 127);
        let buffer = renderer.render(&source).await.unwrap();

        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.sample_rate(), 44100);
        assert_eq!(buffer.frames(), 22050);
        assert!(!buffer.is_silent(0.0001));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FileRenderer::new(dir.path());

        let result = renderer
            .render(&SourceReference::with_defaults("nowhere"))
            .await;
        assert!(matches!(result, Err(RenderError::NotFound(_))));

        let escape = renderer
            .render(&SourceReference::with_defaults("../etc/passwd"))
            .await;
        assert!(matches!(escape, Err(RenderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_pitch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("genome-1.wav"), &sine(440.0, 44100, 4410), 44100).unwrap();
        let renderer = FileRenderer::new(dir.path());

        for pitch in [-5000, -1, 128, i32::MIN] {
            let source = SourceReference::new("genome-1", Duration::from_millis(100), pitch, 100);
            assert!(matches!(
                renderer.render(&source).await,
                Err(RenderError::InvalidParameter { .. })
            ));
        }
        let lowest = SourceReference::new("genome-1", Duration::from_millis(100), 0, 100);
        assert!(renderer.render(&lowest).await.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("noise.wav"), b"definitely not a wav file").unwrap();

        let renderer = FileRenderer::new(dir.path());
        let result = renderer
            .render(&SourceReference::with_defaults("noise"))
            .await;
        assert!(matches!(result, Err(RenderError::Decode(_))));
    }

    #[test]
    fn test_render_parameters() {
        let decoded = AudioBuffer::new(vec![1.0; 1000], 1, 1000);

        // Full velocity, unshifted, trimmed to a quarter second.
        let source = SourceReference::new("x", Duration::from_millis(250), 60, 127);
        let rendered = apply_render_parameters(&decoded, &source);
        assert_eq!(rendered.frames(), 250);
        assert!((rendered.peak() - 1.0).abs() < 0.0001);

        // An octave up halves the length.
        let source = SourceReference::new("x", Duration::from_secs(1), 72, 127);
        assert_eq!(apply_render_parameters(&decoded, &source).frames(), 500);

        // An octave down doubles it.
        let source = SourceReference::new("x", Duration::from_secs(1), 48, 127);
        assert_eq!(apply_render_parameters(&decoded, &source).frames(), 2000);

        // Velocity scales gain.
        let source = SourceReference::new("x", Duration::from_secs(1), 60, 0);
        assert!(apply_render_parameters(&decoded, &source).is_silent(0.0001));
    }
}

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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{crate_version, Parser, Subcommand};
use duration_string::DurationString;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use evolive::config::{EngineConfig, SessionConfig};
use evolive::evaluator::{mock, HostElement};
use evolive::render::{FileRenderer, Renderer, DEFAULT_VELOCITY, UNSHIFTED_PITCH};
use evolive::{Engine, SourceReference};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A live-coding unit engine for evolved sound renders."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Renders a single source from a directory of audio files and prints what came out.
    Render {
        /// The directory holding <source-id>.{wav,flac,mp3,ogg} files.
        directory: String,
        /// The source to render.
        source_id: String,
        /// How long to render, e.g. 1500ms.
        #[arg[short, long]]
        duration: Option<String>,
        /// The MIDI pitch to render at. 60 is unshifted.
        #[arg[short, long]]
        pitch: Option<i32>,
        /// The MIDI velocity to render at.
        #[arg[short, long]]
        velocity: Option<u8>,
    },
    /// Sets up every unit in a session file against mock evaluators and prints the result.
    Session {
        /// The path to the session file.
        config_path: String,
        /// Overrides the renders directory from the session file.
        #[arg[short, long]]
        renders: Option<String>,
    },
    /// Verifies a session file.
    Validate {
        /// The path to the session file.
        config_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            directory,
            source_id,
            duration,
            pitch,
            velocity,
        } => {
            let duration = match duration {
                Some(duration) => DurationString::from_string(duration)?.into(),
                None => evolive::render::DEFAULT_DURATION,
            };
            let source = SourceReference::new(
                &source_id,
                duration,
                pitch.unwrap_or(UNSHIFTED_PITCH),
                velocity.unwrap_or(DEFAULT_VELOCITY),
            );

            let renderer = FileRenderer::new(Path::new(&directory));
            let buffer = renderer.render(&source).await?;
            println!("Rendered {}:", source);
            println!("- Channels: {}", buffer.channel_count());
            println!("- Sample rate: {}", buffer.sample_rate());
            println!("- Frames: {}", buffer.frames());
            println!("- Duration: {:?}", buffer.duration());
            println!("- Peak: {:.4}", buffer.peak());
            if buffer.is_silent(EngineConfig::default().silence_threshold()) {
                println!("- Warning: render is silent");
            }
        }
        Commands::Session {
            config_path,
            renders,
        } => {
            let session = SessionConfig::deserialize(Path::new(&config_path))?;
            let renders = match renders {
                Some(renders) => PathBuf::from(renders),
                None => session
                    .engine()
                    .renders()
                    .map(Path::to_path_buf)
                    .ok_or("no renders directory in the session file or on the command line")?,
            };

            let config = session.engine().clone().with_renders(&renders);
            let engine = Engine::new(config, Arc::new(FileRenderer::new(&renders)));
            let mut evaluators = Vec::new();

            for unit_config in session.units() {
                let unit = engine.create_unit();
                for source in unit_config.sources() {
                    if let Err(e) = unit.add_source(source.to_source_reference()?).await {
                        warn!(unit = unit.id(), source = source.id(), err = %e, "Unable to add source");
                    }
                }
                if let Some(code) = unit_config.code() {
                    unit.set_code(code).await?;
                }

                let name = format!("unit-{}-editor", unit.id());
                let evaluator = mock::Evaluator::get(&name);
                unit.attach(HostElement::new(&name), Arc::new(evaluator.clone()))
                    .await?;
                if unit_config.play() {
                    if let Err(e) = unit.play().await {
                        warn!(unit = unit.id(), err = %e, "Unable to play unit");
                    }
                }
                evaluators.push((unit, evaluator));
            }

            println!("Units (count: {}):", evaluators.len());
            for (unit, evaluator) in evaluators.iter() {
                println!("- Unit {} ({}, {}):", unit.id(), unit.status(), unit.attach_state());
                for sample in unit.bank().samples() {
                    println!(
                        "  - {} <- {} ({})",
                        sample.name(),
                        sample.source(),
                        sample.handle()
                    );
                }
                println!("  Registered: {}", evaluator.registered_names().join(", "));
                println!("  Code:");
                for line in unit.code().lines() {
                    println!("    {}", line);
                }
            }
            println!(
                "Renders: {} cached, {} total, {} bytes",
                engine.cache().len(),
                engine.cache().render_count(),
                engine.cache().total_memory_usage()
            );

            engine.bus().stop_all().await;
        }
        Commands::Validate { config_path } => {
            let session = SessionConfig::deserialize(Path::new(&config_path))?;
            println!("Session {} is valid.", config_path);
            println!(
                "- Renders: {}",
                session
                    .engine()
                    .renders()
                    .map_or("(not set)".to_string(), |p| p.display().to_string())
            );
            for (index, unit) in session.units().iter().enumerate() {
                let sources: Vec<&str> = unit.sources().iter().map(|s| s.id()).collect();
                println!(
                    "- Unit {}: {} source(s) [{}]{}{}",
                    index + 1,
                    sources.len(),
                    sources.join(", "),
                    if unit.code().is_some() { ", custom code" } else { "" },
                    if unit.play() { ", plays on start" } else { "" }
                );
            }
        }
    }

    Ok(())
}

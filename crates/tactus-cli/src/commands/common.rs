//! Shared CLI helpers used across multiple commands.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use crossbeam_channel::Receiver;
use tactus_config::{EngineConfig, HangEscalation, NodeMode, ScopeConfig, ValidationError, find_config};
use tactus_core::graph::AudioDesc;
use tactus_core::recall::{RecallScope, RecallTemplate, Tone};
use tactus_core::task::{AddAudio, StartScope};
use tactus_core::{RecallId, SoundScope, TaskError};
use tactus_io::{EngineContext, EngineSettings, ScopeNode};
use tactus_thread::{HangPolicy, SyncMode, TreeConfig};

/// How long a command waits for the engine to answer a task.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Test-tone options shared by `run` and `render`.
#[derive(Args, Debug, Clone)]
pub struct ToneArgs {
    /// Tone frequencies in Hz (comma separated)
    #[arg(short, long, value_delimiter = ',', default_value = "220,330")]
    pub freq: Vec<f64>,

    /// Peak level of the summed tones
    #[arg(short, long, default_value = "0.5")]
    pub gain: f32,
}

/// Load the configuration named on the command line, or the user default,
/// or the built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match find_config(explicit) {
        Some(path) => {
            tracing::info!("config: loading {}", path.display());
            EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            if let Some(path) = explicit {
                anyhow::bail!("config file '{}' not found", path.display());
            }
            Ok(EngineConfig::default())
        }
    }
}

fn sync_mode(entry: &ScopeConfig) -> SyncMode {
    match entry.mode {
        NodeMode::Synced => SyncMode::Synced,
        NodeMode::FreeRunning => SyncMode::FreeRunning {
            every: entry.every.unwrap_or(1),
        },
        NodeMode::TimeLocked => SyncMode::TimeLocked {
            period: Duration::from_millis(entry.period_ms.unwrap_or(1)),
        },
    }
}

/// Map a validated configuration onto engine settings.
pub fn engine_settings(config: &EngineConfig) -> anyhow::Result<EngineSettings> {
    config.validate()?;
    let scopes = config
        .threads
        .scopes
        .iter()
        .map(|entry| {
            Ok(ScopeNode {
                scope: entry.sound_scope()?,
                mode: sync_mode(entry),
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()?;

    let threads = &config.threads;
    Ok(EngineSettings {
        bpm: config.timing.bpm,
        delay_factor: config.timing.delay_factor,
        loop_range: config.loop_range(),
        scopes,
        output: config.output_scope()?,
        workers: threads.workers,
        tree: TreeConfig {
            hang_after_ticks: threads.hang_after_ticks,
            hang_policy: match threads.hang_policy {
                HangEscalation::Subtree => HangPolicy::Subtree,
                HangEscalation::Tree => HangPolicy::Tree,
            },
            poll_interval: Duration::from_millis(threads.poll_interval_ms),
        },
        watchdog_interval: (threads.watchdog_interval_ms > 0)
            .then(|| Duration::from_millis(threads.watchdog_interval_ms)),
        overdue_after_ticks: config.gc.overdue_after_ticks,
        ring_len: config.audio.ring_len,
    })
}

fn await_reply<T>(engine: &EngineContext, rx: &Receiver<Result<T, TaskError>>, drive: bool) -> anyhow::Result<T> {
    if drive {
        engine.step(REPLY_TIMEOUT)?;
    }
    let reply = rx
        .recv_timeout(REPLY_TIMEOUT)
        .context("engine did not answer in time")?;
    Ok(reply?)
}

/// Add one tone audio per frequency and start each in `scope`.
///
/// `drive` steps the engine by hand, for soundcards without a clock.
pub fn start_tones(
    engine: &EngineContext,
    tones: &ToneArgs,
    scope: SoundScope,
    drive: bool,
) -> anyhow::Result<Vec<RecallId>> {
    if tones.freq.is_empty() {
        anyhow::bail!("no tone frequencies given");
    }
    let presets = engine.presets();
    let amplitude = tones.gain / tones.freq.len() as f32;

    let mut ids = Vec::with_capacity(tones.freq.len());
    for &freq in &tones.freq {
        let (tx, rx) = crossbeam_channel::bounded(1);
        engine.append(
            AddAudio::new(
                AudioDesc::new(format!("tone-{freq}"))
                    .with_audio_channels(u32::from(presets.pcm_channels))
                    .with_pads(0, 1)
                    .with_presets(presets)
                    .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(freq, amplitude)).persistent()),
            )
            .with_reply(tx),
        );
        let audio = await_reply(engine, &rx, drive)?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        engine.append(StartScope::new(audio, scope).with_reply(tx));
        let id = await_reply(engine, &rx, drive)?;
        tracing::debug!("tone {freq} Hz started as {id}");
        ids.push(id);
    }
    Ok(ids)
}

/// Convert a linear level to decibels.
pub fn linear_to_db(level: f32) -> f32 {
    if level <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * level.log10()
    }
}

//! Integration tests for the threaded engine.
//!
//! Offline soundcards are stepped by hand, so these tests are deterministic
//! apart from the free-running and wall-clock cases, which only assert bounds.

use std::time::{Duration, Instant};

use tactus_core::graph::{AudioDesc, AudioId};
use tactus_core::recall::{RecallEvent, RecallScope, RecallTemplate, SoundScope, Tone, Volume};
use tactus_core::task::{AddAudio, RemoveAudio, StartScope};
use tactus_core::Presets;
use tactus_io::{EngineContext, EngineSettings, OfflineSoundcard, ScopeNode, TimerSoundcard};
use tactus_thread::SyncMode;

const STEP: Duration = Duration::from_secs(5);

fn presets() -> Presets {
    Presets {
        samplerate: 48000,
        buffer_size: 256,
        pcm_channels: 2,
        ..Presets::default()
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        watchdog_interval: None,
        ..EngineSettings::default()
    }
}

fn add_tone(engine: &EngineContext, freq: f64) -> AudioId {
    let (tx, rx) = crossbeam_channel::bounded(1);
    engine.append(
        AddAudio::new(
            AudioDesc::new("osc")
                .with_audio_channels(1)
                .with_pads(0, 1)
                .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(freq, 0.2)).persistent()),
        )
        .with_reply(tx),
    );
    engine.step(STEP).unwrap();
    rx.recv().unwrap().unwrap()
}

fn start(engine: &EngineContext, audio: AudioId, scope: SoundScope) -> tactus_core::RecallId {
    let (tx, rx) = crossbeam_channel::bounded(1);
    engine.append(StartScope::new(audio, scope).with_reply(tx));
    engine.step(STEP).unwrap();
    rx.recv().unwrap().unwrap()
}

// ============================================================================
// Offline render
// ============================================================================

#[test]
fn offline_render_records_every_tick() {
    let card = OfflineSoundcard::new(presets());
    let recording = card.recording();
    let engine = EngineContext::init(settings(), card).unwrap();
    let events = engine.subscribe();

    let osc = add_tone(&engine, 440.0);
    let id = start(&engine, osc, SoundScope::Playback);
    engine.run_ticks(8, STEP).unwrap();
    assert!(engine.recall().is_active(id));
    assert_eq!(engine.tick_count(), 10);
    engine.shutdown();

    assert_eq!(recording.frames(), 10 * 256);
    let samples = recording.samples();
    assert!(samples[..512].iter().all(|s| *s == 0.0), "nothing plays before the run starts");
    assert!(samples[512..].iter().any(|s| *s != 0.0));
    assert!(recording.peak() <= 0.2 + 1e-6);

    let received: Vec<_> = events.try_iter().collect();
    assert!(received.contains(&RecallEvent::Done { recall_id: id, audio: osc }));
}

#[test]
fn render_to_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("render.wav");

    let card = OfflineSoundcard::new(presets());
    let recording = card.recording();
    let engine = EngineContext::init(settings(), card).unwrap();
    let osc = add_tone(&engine, 220.0);
    start(&engine, osc, SoundScope::Playback);
    engine.run_ticks(4, STEP).unwrap();
    engine.shutdown();

    recording.write_wav(&path).unwrap();
    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.duration() as usize, recording.frames());
}

#[test]
fn export_runs_do_not_reach_the_soundcard() {
    let card = OfflineSoundcard::new(presets());
    let recording = card.recording();
    let engine = EngineContext::init(settings(), card).unwrap();
    let osc = add_tone(&engine, 440.0);
    let id = start(&engine, osc, SoundScope::Export);
    engine.run_ticks(4, STEP).unwrap();
    assert!(engine.recall().is_active(id));
    engine.shutdown();

    assert!(recording.samples().iter().all(|s| *s == 0.0));
}

// ============================================================================
// Scope threads
// ============================================================================

#[test]
fn unassigned_scopes_are_advanced_by_the_root() {
    let card = OfflineSoundcard::new(presets());
    let recording = card.recording();
    let engine = EngineContext::init(
        EngineSettings {
            scopes: Vec::new(),
            output: SoundScope::Sequencer,
            ..settings()
        },
        card,
    )
    .unwrap();
    assert!(engine.scope_node(SoundScope::Sequencer).is_none());

    let osc = add_tone(&engine, 330.0);
    start(&engine, osc, SoundScope::Sequencer);
    engine.run_ticks(2, STEP).unwrap();
    engine.shutdown();

    assert!(recording.samples().iter().any(|s| *s != 0.0));
}

#[test]
fn pooled_advance_matches_single_thread() {
    fn render(workers: usize) -> Vec<f32> {
        let card = OfflineSoundcard::new(presets());
        let recording = card.recording();
        let engine = EngineContext::init(
            EngineSettings {
                workers,
                ..settings()
            },
            card,
        )
        .unwrap();
        let ids: Vec<_> = [220.0, 330.0, 440.0]
            .into_iter()
            .map(|freq| {
                let osc = add_tone(&engine, freq);
                start(&engine, osc, SoundScope::Playback)
            })
            .collect();
        engine.run_ticks(6, STEP).unwrap();
        assert!(ids.iter().all(|id| engine.recall().is_active(*id)));
        engine.shutdown();
        recording.samples()
    }

    assert_eq!(render(2), render(0));
}

#[test]
fn free_running_scope_is_not_awaited() {
    let engine = EngineContext::init(
        EngineSettings {
            scopes: vec![
                ScopeNode::synced(SoundScope::Playback),
                ScopeNode {
                    scope: SoundScope::Export,
                    mode: SyncMode::FreeRunning { every: 2 },
                },
            ],
            ..settings()
        },
        OfflineSoundcard::new(presets()),
    )
    .unwrap();
    engine.run_ticks(8, STEP).unwrap();

    let export = engine.scope_node(SoundScope::Export).unwrap();
    let deadline = Instant::now() + STEP;
    while engine.tree().stats(export).unwrap().ticks == 0 {
        assert!(Instant::now() < deadline, "free-running scope never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(engine.tree().stats(export).unwrap().ticks <= 4);

    let playback = engine.scope_node(SoundScope::Playback).unwrap();
    assert_eq!(engine.tree().stats(playback).unwrap().ticks, 8);
    engine.shutdown();
}

// ============================================================================
// Reclamation
// ============================================================================

#[test]
fn removed_audio_is_collected_by_the_root() {
    let engine = EngineContext::init(settings(), OfflineSoundcard::new(presets())).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    engine.append(
        AddAudio::new(
            AudioDesc::new("track")
                .with_audio_channels(2)
                .with_pads(1, 1)
                .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(0.5)).persistent()),
        )
        .with_reply(tx),
    );
    engine.step(STEP).unwrap();
    let track = rx.recv().unwrap().unwrap();
    let id = start(&engine, track, SoundScope::Playback);
    engine.run_ticks(2, STEP).unwrap();

    engine.append(RemoveAudio::new(track));
    engine.run_ticks(3, STEP).unwrap();

    assert!(!engine.recall().is_active(id));
    assert_eq!(engine.gc().freed_total(), 4);
    assert_eq!(engine.gc().pending(), 0);
    assert_eq!(engine.with_graph(|g| g.audio_count()), 0);
    engine.shutdown();
}

// ============================================================================
// Wall clock
// ============================================================================

#[test]
fn timer_soundcard_drives_the_engine() {
    let card = TimerSoundcard::new(Presets {
        samplerate: 48000,
        buffer_size: 96,
        ..Presets::default()
    });
    let meter = card.meter();
    let engine = EngineContext::init(settings(), card).unwrap();

    let deadline = Instant::now() + STEP;
    while engine.tick_count() < 5 {
        assert!(Instant::now() < deadline, "clock did not tick");
        std::thread::sleep(Duration::from_millis(1));
    }
    engine.shutdown();
    assert!(meter.buffers() >= 5);
}

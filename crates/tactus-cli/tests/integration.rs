//! Integration tests for tactus-cli.
//!
//! Every test runs the built `tactus` binary with an explicit `--config`, so
//! a configuration in the user's own config directory never leaks in.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Helper to get the path to the `tactus` binary built by cargo.
fn tactus_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tactus"))
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine.toml");
    std::fs::write(&path, body).expect("failed to write config");
    path
}

fn run_with(config: &Path, args: &[&str]) -> Output {
    tactus_bin()
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run tactus")
}

// ---------------------------------------------------------------------------
// `tactus timing`
// ---------------------------------------------------------------------------

#[test]
fn cli_timing_reports_delay_and_subdivision_length() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let output = run_with(
        &config,
        &["timing", "--samplerate", "48000", "--buffer-size", "480", "--bpm", "120"],
    );

    assert!(output.status.success(), "tactus timing failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("12.5000 buffers"), "unexpected delay in:\n{stdout}");
    assert!(stdout.contains("6000.00"), "unexpected subdivision length in:\n{stdout}");
}

#[test]
fn cli_timing_simulates_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let output = run_with(
        &config,
        &["timing", "--samplerate", "48000", "--buffer-size", "480", "--ticks", "3"],
    );

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("attack"));
    // One row per tick after the header.
    let rows = stdout
        .lines()
        .skip_while(|line| !line.contains("attack"))
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .count();
    assert_eq!(rows, 3);
}

#[test]
fn cli_timing_converts_delta_time() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let output = run_with(
        &config,
        &["timing", "--delta-time", "96", "--division", "96", "--bpm", "120"],
    );

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // One quarter note at 120 BPM is half a second.
    assert!(stdout.contains("= 24000 frames"), "unexpected conversion in:\n{stdout}");
}

#[test]
fn cli_timing_rejects_bad_tempo() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let output = run_with(&config, &["timing", "--bpm", "0"]);
    assert!(!output.status.success(), "zero tempo should be rejected");
}

// ---------------------------------------------------------------------------
// `tactus config`
// ---------------------------------------------------------------------------

#[test]
fn cli_config_show_prints_effective_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[timing]\nbpm = 90.0\n");
    let output = run_with(&config, &["config", "show"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("bpm = 90.0"), "missing tempo in:\n{stdout}");
    assert!(stdout.contains("[audio]"));
    assert!(stdout.contains("[[threads.scopes]]"));
}

#[test]
fn cli_config_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let target = dir.path().join("nested").join("fresh.toml");
    let target_str = target.to_str().unwrap();

    let output = run_with(&config, &["config", "init", "--path", target_str]);
    assert!(output.status.success());
    assert!(target.is_file());

    let output = run_with(&config, &["config", "init", "--path", target_str]);
    assert!(!output.status.success(), "second init without --force should fail");

    let output = run_with(&config, &["config", "init", "--path", target_str, "--force"]);
    assert!(output.status.success());
}

#[test]
fn cli_config_check_reports_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let bad = dir.path().join("bad.toml");
    std::fs::write(
        &bad,
        "[[threads.scopes]]\nscope = \"playback\"\n\n[[threads.scopes]]\nscope = \"playback\"\n",
    )
    .unwrap();

    let output = run_with(&config, &["config", "check", bad.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("more than one thread"), "unexpected error:\n{stderr}");

    let output = run_with(&config, &["config", "check", config.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(": ok"));
}

#[test]
fn cli_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_with(&dir.path().join("absent.toml"), &["config", "show"]);
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `tactus render`
// ---------------------------------------------------------------------------

#[test]
fn cli_render_writes_wav() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let wav = dir.path().join("tones.wav");

    let output = run_with(
        &config,
        &["render", "--output", wav.to_str().unwrap(), "--seconds", "0.1", "--freq", "440"],
    );
    assert!(
        output.status.success(),
        "render failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let reader = hound::WavReader::open(&wav).expect("render should write a readable WAV");
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 48000);
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.bits_per_sample, 16);
    // 4800 frames round up to 10 ticks of 512.
    assert_eq!(reader.duration(), 5120);

    let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert!(samples.iter().any(|&s| s != 0), "rendered file is silent");
}

#[test]
fn cli_render_with_free_running_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
        [audio]
        buffer_size = 256

        [threads]
        workers = 2

        [[threads.scopes]]
        scope = "playback"

        [[threads.scopes]]
        scope = "export"
        mode = "free_running"
        every = 2
        "#,
    );
    let wav = dir.path().join("pooled.wav");

    let output = run_with(
        &config,
        &["render", "--output", wav.to_str().unwrap(), "--seconds", "0.05", "--freq", "220,330,440"],
    );
    assert!(
        output.status.success(),
        "render failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(wav.is_file());
}

//! Offline render command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tactus_io::{EngineContext, OfflineSoundcard};

use super::common::{REPLY_TIMEOUT, ToneArgs, engine_settings, linear_to_db, load_config, start_tones};

#[derive(Args)]
pub struct RenderArgs {
    /// Output WAV file
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    tones: ToneArgs,

    /// Length of the render in seconds
    #[arg(short, long, default_value = "2.0")]
    seconds: f64,

    /// Override the configured tempo
    #[arg(long)]
    bpm: Option<f64>,

    /// Per-tick timeout in milliseconds
    #[arg(long, default_value = "2000")]
    tick_timeout_ms: u64,
}

/// Ticks needed to cover `seconds` at the given presets.
fn ticks_for(seconds: f64, samplerate: u32, buffer_size: u32) -> u64 {
    let frames = (seconds.max(0.0) * f64::from(samplerate)).ceil();
    (frames / f64::from(buffer_size)).ceil() as u64
}

pub fn run(args: RenderArgs, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let presets = config.presets()?;
    let mut settings = engine_settings(&config)?;
    if let Some(bpm) = args.bpm {
        settings.bpm = bpm;
    }
    let output = settings.output;
    let timeout = Duration::from_millis(args.tick_timeout_ms).max(REPLY_TIMEOUT);

    let soundcard = OfflineSoundcard::new(presets);
    let recording = soundcard.recording();
    let engine = EngineContext::init(settings, soundcard)?;

    let ids = start_tones(&engine, &args.tones, output, true)?;
    let total = ticks_for(args.seconds, presets.samplerate, presets.buffer_size);

    println!(
        "Rendering {} tone(s) for {:.2} s ({total} ticks of {} frames)...",
        ids.len(),
        args.seconds,
        presets.buffer_size
    );

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );
    pb.set_position(engine.tick_count().min(total));
    while engine.tick_count() < total {
        engine.step(timeout)?;
        pb.set_position(engine.tick_count());
    }
    pb.finish_with_message("done");

    let drain = engine.last_drain();
    let gc = engine.last_gc();
    engine.shutdown();

    println!("\nStats:");
    println!(
        "  Frames: {} ({} Hz, {} channel(s))",
        recording.frames(),
        presets.samplerate,
        presets.pcm_channels
    );
    println!("  Peak:   {:.1} dB", linear_to_db(recording.peak()));
    println!(
        "  Last tick: {} task(s) launched, {} failed, {} recycling(s) pending",
        drain.launched, drain.failed, gc.pending
    );

    println!("\nWriting {}...", args.output.display());
    recording.write_wav(&args.output)?;
    println!("Done!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_cover_the_requested_length() {
        assert_eq!(ticks_for(1.0, 48000, 512), 94);
        assert_eq!(ticks_for(0.0, 48000, 512), 0);
        assert_eq!(ticks_for(2.0, 48000, 512), 188);
        assert_eq!(ticks_for(1.0, 44100, 441), 100);
    }
}

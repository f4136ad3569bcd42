//! Timing inspection command.

use std::path::Path;

use clap::Args;
use tactus_core::TimingConverter;

use super::common::load_config;

#[derive(Args)]
pub struct TimingArgs {
    /// Tempo in beats per minute (defaults to the configured tempo)
    #[arg(long)]
    bpm: Option<f64>,

    /// Subdivision length relative to a sixteenth
    #[arg(long)]
    delay_factor: Option<f64>,

    /// Sample rate override
    #[arg(long)]
    samplerate: Option<u32>,

    /// Buffer size override
    #[arg(long)]
    buffer_size: Option<u32>,

    /// Loop range in subdivisions, as LEFT,RIGHT
    #[arg(long, value_delimiter = ',', num_args = 2)]
    loop_range: Option<Vec<u64>>,

    /// Simulate this many ticks and list the subdivisions each one starts
    #[arg(long, default_value = "0")]
    ticks: u64,

    /// Convert a MIDI delta time (in pulses) to frames
    #[arg(long)]
    delta_time: Option<u64>,

    /// Pulses per quarter note for --delta-time
    #[arg(long, default_value = "96")]
    division: u32,
}

pub fn run(args: TimingArgs, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let mut presets = config.presets()?;
    if let Some(samplerate) = args.samplerate {
        presets.samplerate = samplerate;
    }
    if let Some(buffer_size) = args.buffer_size {
        presets.buffer_size = buffer_size;
    }
    let bpm = args.bpm.unwrap_or(config.timing.bpm);
    let delay_factor = args.delay_factor.unwrap_or(config.timing.delay_factor);

    let mut converter = TimingConverter::from_presets(&presets, bpm, delay_factor)?;
    let loop_range = match args.loop_range.as_deref() {
        Some(&[left, right]) => Some((left, right)),
        Some(_) => anyhow::bail!("--loop-range takes exactly two values"),
        None => config.loop_range(),
    };
    converter.set_loop(loop_range)?;

    println!("Timing at {bpm} BPM, delay factor {delay_factor}:");
    println!("  Sample rate:         {} Hz", presets.samplerate);
    println!("  Buffer size:         {} frames", presets.buffer_size);
    println!("  Tick duration:       {:.3} ms", presets.tick_duration().as_secs_f64() * 1000.0);
    println!("  Delay:               {:.4} buffers", converter.delay());
    println!("  Frames/subdivision:  {:.2}", converter.frames_per_subdivision());
    if let Some((left, right)) = loop_range {
        println!("  Loop:                [{left}, {right})");
    }

    if let Some(delta_time) = args.delta_time {
        let frames = converter.delta_time_to_samples(delta_time, args.division)?;
        let notes = converter.delta_time_to_note_offset(delta_time, args.division)?;
        println!(
            "\n  {delta_time} pulse(s) at {} PPQN = {frames} frames = {notes:.3} subdivision(s)",
            args.division
        );
    }

    if args.ticks > 0 {
        println!("\n  {:>6}  {:>10}  {:>6}  {:>5}  {:>5}", "tick", "offset", "attack", "subs", "note");
        for _ in 0..args.ticks {
            let timing = converter.tick();
            let attack = timing.attack.map_or_else(|| "-".to_string(), |a| a.to_string());
            println!(
                "  {:>6}  {:>10}  {:>6}  {:>5}  {:>5}",
                timing.tick, timing.sample_offset, attack, timing.subdivisions, timing.note_offset
            );
        }
    }

    Ok(())
}

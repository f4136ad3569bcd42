//! Real-time playback command.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use tactus_io::{EngineContext, TimerSoundcard};
use tactus_thread::TreeEvent;

use super::common::{ToneArgs, engine_settings, linear_to_db, load_config, start_tones};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    tones: ToneArgs,

    /// Stop after this many seconds (runs until Ctrl+C if omitted)
    #[arg(short, long)]
    seconds: Option<f64>,

    /// Override the configured tempo
    #[arg(long)]
    bpm: Option<f64>,

    /// Override the configured worker pool size
    #[arg(long)]
    workers: Option<usize>,
}

pub fn run(args: RunArgs, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let presets = config.presets()?;
    let mut settings = engine_settings(&config)?;
    if let Some(bpm) = args.bpm {
        settings.bpm = bpm;
    }
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    let output = settings.output;

    let soundcard = TimerSoundcard::new(presets);
    let meter = soundcard.meter();
    let engine = EngineContext::init(settings, soundcard)?;
    let tree_events = engine.tree_events();

    let ids = start_tones(&engine, &args.tones, output, false)?;

    println!("Running {} tone(s) in scope '{output}'", ids.len());
    println!("  Sample rate: {} Hz", presets.samplerate);
    println!("  Buffer size: {} frames", presets.buffer_size);
    println!("  Tick:        {:.2} ms", presets.tick_duration().as_secs_f64() * 1000.0);
    match args.seconds {
        Some(seconds) => println!("\nStopping after {seconds} s (Ctrl+C to stop early)...\n"),
        None => println!("\nPress Ctrl+C to stop...\n"),
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        for event in tree_events.try_iter() {
            match event {
                TreeEvent::Hang(hang) => {
                    tracing::warn!("{} missed {} tick(s)", hang.name, hang.missed);
                }
                TreeEvent::Panicked { message, .. } => anyhow::bail!("engine thread panicked: {message}"),
                _ => {}
            }
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            let timing = engine.timing();
            println!(
                "  tick {:>6}  note {:>4}  peak {:.1} dB",
                engine.tick_count(),
                timing.note_offset_absolute,
                linear_to_db(meter.peak())
            );
            last_status = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let ticks = engine.tick_count();
    engine.shutdown();

    println!("\nStats:");
    println!("  Ticks:   {ticks}");
    println!("  Buffers: {}", meter.buffers());
    println!("  Peak:    {:.1} dB", linear_to_db(meter.peak()));
    println!("Done!");
    Ok(())
}

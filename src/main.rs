//! roger-transport - 传输核心演示
//!
//! 用模拟 transport 播放文件或测试信号，打印回调统计和诊断；
//! `policy` 子命令列出格式切换的重开策略表。

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use roger_transport::audio::format::{BitOrder, SourceFormat};
use roger_transport::decode::{Playlist, SampleSource, ToneSource};
use roger_transport::session::policy;
use roger_transport::transport::{Clocking, Pace, SimulatedTransport};
use roger_transport::{CapabilitySet, Engine, EngineConfig, Pacing, SessionConfig};

/// 支持的音频文件扩展名
const AUDIO_EXTENSIONS: &[&str] = &["flac", "wav", "aiff", "aif", "mp3"];

/// Real-time audio transport demo
#[derive(Parser)]
#[command(name = "roger-transport")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Target ring fill in milliseconds
    #[arg(short, long, default_value = "500", global = true)]
    buffer_ms: u64,

    /// Frames pulled per transport cycle
    #[arg(long, default_value = "512", global = true)]
    cycle_frames: u32,

    /// Request realtime scheduling for the transport and producer threads
    #[arg(long, global = true)]
    realtime: bool,

    /// Feed frames on a fixed tick instead of free-running against backpressure
    #[arg(long, value_name = "TICKS_PER_SECOND", global = true)]
    clocked: Option<u32>,

    /// Keep the ring running across same-format track changes
    #[arg(long, global = true)]
    gapless: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play audio files or directories through the simulated transport
    Play {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Shuffle playback order
        #[arg(short, long)]
        shuffle: bool,
    },
    /// Generate a test signal
    Tone {
        #[arg(value_enum, default_value = "pcm")]
        kind: ToneKind,

        /// Sample rate (PCM) or bit rate (DSD)
        #[arg(short, long)]
        rate: Option<u32>,

        /// PCM bits per sample
        #[arg(long, default_value = "24")]
        bits: u16,

        #[arg(long, default_value = "1000")]
        frequency: f64,

        #[arg(long, default_value = "3")]
        seconds: f64,
    },
    /// Print the format-change reopen strategy table
    Policy,
}

#[derive(Clone, Copy, ValueEnum)]
enum ToneKind {
    Pcm,
    Dsd,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match &cli.command {
        Commands::Policy => {
            print_policy_table();
            Ok(())
        }
        Commands::Play { paths, shuffle } => {
            let mut files = Vec::new();
            for path in paths {
                collect_audio_files(path, &mut files)?;
            }
            if files.is_empty() {
                anyhow::bail!("no audio files found (supported: {})", AUDIO_EXTENSIONS.join(", "));
            }
            println!("Found {} audio files", files.len());

            let mut playlist = Playlist::from_paths(files);
            if *shuffle {
                playlist.shuffle(&mut rand::thread_rng());
            }
            run(&cli, Box::new(playlist))
        }
        Commands::Tone {
            kind,
            rate,
            bits,
            frequency,
            seconds,
        } => {
            let format = match kind {
                ToneKind::Pcm => SourceFormat::pcm(rate.unwrap_or(48_000), 2, *bits),
                ToneKind::Dsd => SourceFormat::dsd(rate.unwrap_or(2_822_400), 2, BitOrder::MsbFirst),
            };
            println!("Tone: {} at {} Hz for {}s", format, frequency, seconds);
            run(&cli, Box::new(ToneSource::with_seconds(format, *frequency, *seconds)))
        }
    }
}

fn run(cli: &Cli, source: Box<dyn SampleSource>) -> anyhow::Result<()> {
    let config = EngineConfig {
        session: SessionConfig {
            target_fill: Duration::from_millis(cli.buffer_ms.max(10)),
            lock_memory: cli.realtime,
            ..SessionConfig::default()
        },
        pacing: match cli.clocked {
            Some(ticks_per_second) => Pacing::Clocked { ticks_per_second },
            None => Pacing::Freerun,
        },
        realtime_producer: cli.realtime,
        resync_tracks: !cli.gapless,
    };
    let transport = SimulatedTransport::new(
        CapabilitySet::full(),
        cli.cycle_frames,
        Clocking::Threaded {
            pace: Pace::Realtime,
            realtime_priority: cli.realtime,
        },
    );

    let engine = Engine::spawn(transport, source, config).context("failed to start engine")?;
    let diagnostics = engine.diagnostics_handle();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("failed to install Ctrl+C handler")?;

    println!("Press Ctrl+C to stop.\n");
    let mut ticks = 0u32;
    while !engine.is_finished() {
        if interrupted.load(Ordering::SeqCst) {
            println!("\nPlayback interrupted.");
            engine.stop();
            break;
        }
        thread::sleep(Duration::from_millis(100));
        ticks += 1;
        if cli.verbose && ticks % 10 == 0 {
            let d = diagnostics.snapshot();
            println!(
                "[{:?}] mode {} | ring {}/{} | underruns {} | gated {}",
                d.state,
                d.mode.map_or_else(|| "-".to_string(), |m| m.to_string()),
                d.ring_available.map_or_else(|| "-".to_string(), |n| n.to_string()),
                d.ring_capacity,
                d.underruns,
                d.gated_cycles
            );
        }
    }

    let summary = engine.join()?;
    let report = diagnostics.stats_report();
    let d = diagnostics.snapshot();

    println!();
    println!("{}", report);
    println!("Blocks: {} ({} skipped)", summary.blocks, summary.skipped_blocks);
    println!("Frames: {}", summary.frames);
    println!("Underruns: {}", summary.underruns);
    println!(
        "Transitions: {} quick, {} light, {} full ({} escalated)",
        summary.transitions.quick_resumes,
        summary.transitions.light_reopens,
        summary.transitions.full_reopens,
        summary.transitions.escalations
    );
    println!(
        "Staging writes: {} direct, {} scratch, {} bypass",
        summary.staging.direct_writes, summary.staging.scratch_writes, summary.staging.bypass_writes
    );
    if let Some(flush) = summary.last_flush {
        println!(
            "Last full reopen: {} bytes of silence ({:?} at x{}), settle {:?}, total {:?}",
            flush.bytes, flush.silence, flush.multiplier, flush.settle, flush.elapsed
        );
    }
    println!(
        "Retries: {} | drain timeouts: {} | dropped diag events: {}",
        d.retries, d.drain_timeouts, d.dropped_events
    );
    Ok(())
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 展开目录（按文件名排序），文件原样加入
fn collect_audio_files(path: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if !path.is_dir() {
        out.push(path.to_path_buf());
        return Ok(());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && is_audio_file(p))
        .collect();
    files.sort_by(|a, b| a.file_name().unwrap_or_default().cmp(b.file_name().unwrap_or_default()));
    out.extend(files);
    Ok(())
}

fn print_policy_table() {
    let samples = [
        SourceFormat::pcm(44_100, 2, 16),
        SourceFormat::pcm(48_000, 2, 16),
        SourceFormat::dsd(2_822_400, 2, BitOrder::MsbFirst),
        SourceFormat::dsd(3_072_000, 2, BitOrder::MsbFirst),
    ];

    print!("{:<12}", "old \\ new");
    for new in &samples {
        print!("{:<14}", new.class().to_string());
    }
    println!();
    for old in &samples {
        print!("{:<12}", old.class().to_string());
        for new in &samples {
            print!("{:<14}", policy::class_strategy(old.class(), new.class()).to_string());
        }
        println!();
    }
    println!("\nIdentical formats always resume quickly without reopening.");
}

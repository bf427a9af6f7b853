//! 播放引擎
//!
//! 一个生产者线程拥有会话和生产者句柄：
//! 从来源取块，遇到新格式时打开或切换会话，再把帧送进环。
//! 输出回调在 transport 自己的线程上，两者只经环和协调器相连。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio::cadence::FrameCadence;
use crate::config::SessionConfig;
use crate::convert::stage::StageCounters;
use crate::decode::{SampleSource, SourceBlock, SourceError};
use crate::rt;
use crate::session::{
    CancelHandle, Diagnostics, DiagnosticsHandle, FlushRecord, ProducerHandle, SessionError, SessionState,
    TransitionCounters, TransportSession,
};
use crate::transport::Transport;

/// 送帧节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// 尽快送，靠背压限速
    Freerun,
    /// 每个时间片送整数帧（FrameCadence），模拟解码器按实时节拍出数据
    Clocked { ticks_per_second: u32 },
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub pacing: Pacing,
    /// 生产者线程尝试实时调度
    pub realtime_producer: bool,
    /// 同格式换曲时先播完上一曲，再清空环重新预填
    pub resync_tracks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            pacing: Pacing::Freerun,
            realtime_producer: false,
            resync_tracks: true,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to spawn producer thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("producer thread panicked")]
    WorkerPanicked,
}

/// 播放结束后的汇总
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineSummary {
    pub blocks: u64,
    pub frames: u64,
    /// 因能力不匹配跳过的块
    pub skipped_blocks: u64,
    pub transitions: TransitionCounters,
    /// 暂存写入路径统计
    pub staging: StageCounters,
    pub underruns: u64,
    pub last_flush: Option<FlushRecord>,
    /// 来源播完（而非被停止）
    pub completed: bool,
}

struct Control {
    stop: AtomicBool,
    finished: AtomicBool,
}

/// 播放引擎
pub struct Engine {
    worker: Option<JoinHandle<Result<EngineSummary, EngineError>>>,
    control: Arc<Control>,
    diagnostics: DiagnosticsHandle,
    cancel: CancelHandle,
}

impl Engine {
    /// 启动生产者线程，开始播放 `source`
    pub fn spawn<T>(transport: T, source: Box<dyn SampleSource>, config: EngineConfig) -> Result<Self, EngineError>
    where
        T: Transport + 'static,
    {
        let mut session = TransportSession::new(transport, config.session.clone());
        let Some(producer) = session.take_producer() else {
            return Err(SessionError::InvalidState {
                state: session.state(),
                operation: "take producer",
            }
            .into());
        };
        let diagnostics = session.diagnostics_handle();
        let cancel = session.cancel_handle();
        let control = Arc::new(Control {
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let worker_control = Arc::clone(&control);
        let worker = thread::Builder::new()
            .name("engine-producer".into())
            .spawn(move || {
                let result = run(session, producer, source, &config, &worker_control);
                worker_control.finished.store(true, Ordering::Release);
                result
            })
            .map_err(EngineError::Thread)?;

        Ok(Self {
            worker: Some(worker),
            control,
            diagnostics,
            cancel,
        })
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.snapshot()
    }

    pub fn diagnostics_handle(&self) -> DiagnosticsHandle {
        self.diagnostics.clone()
    }

    /// 请求停止；生产者线程随后关闭会话
    pub fn stop(&self) {
        self.control.stop.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::Acquire)
    }

    /// 等待生产者线程结束
    pub fn join(mut self) -> Result<EngineSummary, EngineError> {
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<EngineSummary, EngineError> {
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| EngineError::WorkerPanicked)?,
            None => Err(EngineError::WorkerPanicked),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            if let Err(e) = self.join_worker() {
                log::error!("Engine stopped with error: {}", e);
            }
        }
    }
}

/// 时间片节拍器
struct Pacer {
    cadence: FrameCadence,
    period: Duration,
    next_tick: Instant,
}

impl Pacer {
    fn new(ticks_per_second: u32) -> Self {
        let ticks = ticks_per_second.max(1);
        Self {
            cadence: FrameCadence::new(0, ticks),
            period: Duration::from_nanos(1_000_000_000 / ticks as u64),
            next_tick: Instant::now(),
        }
    }

    /// 等到下一个时间片，返回该片的帧数
    fn tick(&mut self) -> usize {
        let now = Instant::now();
        if now < self.next_tick {
            thread::sleep(self.next_tick - now);
            self.next_tick += self.period;
        } else {
            // 落后超过一片时不补发
            self.next_tick = now + self.period;
        }
        self.cadence.next_frames() as usize
    }
}

fn stopping(control: &Control, producer: &ProducerHandle) -> bool {
    control.stop.load(Ordering::Acquire) || producer.is_cancelled()
}

fn run<T: Transport>(
    mut session: TransportSession<T>,
    mut producer: ProducerHandle,
    mut source: Box<dyn SampleSource>,
    config: &EngineConfig,
    control: &Control,
) -> Result<EngineSummary, EngineError> {
    if config.realtime_producer {
        let outcome = rt::promote_current_thread(Duration::from_millis(10));
        log::debug!("Producer thread priority: {:?}", outcome);
    }

    let mut summary = EngineSummary::default();
    let result = feed(&mut session, &mut producer, source.as_mut(), config, control, &mut summary);

    if result.is_ok() && summary.completed && session.state() == SessionState::Streaming {
        // 播完环里剩余的数据
        let timeout = config.session.target_fill * 2 + config.session.flush_timeout;
        if !producer.wait_drained(timeout) {
            log::warn!("Ring not drained within {:?} at end of stream", timeout);
        }
    }

    summary.transitions = session.counters();
    summary.staging = producer.stage_counters();
    summary.last_flush = session.last_flush();
    summary.underruns = session.diagnostics_handle().underruns();

    let closed = session.close();
    result?;
    closed?;
    log::info!(
        "Playback finished: {} blocks, {} frames, {} underruns",
        summary.blocks,
        summary.frames,
        summary.underruns
    );
    Ok(summary)
}

fn feed<T: Transport>(
    session: &mut TransportSession<T>,
    producer: &mut ProducerHandle,
    source: &mut dyn SampleSource,
    config: &EngineConfig,
    control: &Control,
    summary: &mut EngineSummary,
) -> Result<(), EngineError> {
    let mut pacer = match config.pacing {
        Pacing::Freerun => None,
        Pacing::Clocked { ticks_per_second } => Some(Pacer::new(ticks_per_second)),
    };
    let mut budget = 0usize;

    loop {
        if stopping(control, producer) {
            return Ok(());
        }
        let Some(block) = source.next_block()? else {
            summary.completed = true;
            return Ok(());
        };
        summary.blocks += 1;

        match prepare(session, producer, &block, config) {
            Ok(()) => {}
            Err(SessionError::CapabilityMismatch { format, reason }) => {
                log::warn!("Skipping block in {}: {}", format, reason);
                summary.skipped_blocks += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(pacer) = pacer.as_mut() {
            let fps = block.format.frames_per_second();
            if pacer.cadence.frames_per_second() != fps {
                pacer.cadence.retune(fps);
                budget = 0;
            }
        }

        let mut start = 0;
        while start < block.frames {
            if stopping(control, producer) {
                return Ok(());
            }
            let span = match pacer.as_mut() {
                Some(pacer) => {
                    if budget == 0 {
                        budget = pacer.tick();
                    }
                    budget.min(block.frames - start)
                }
                None => block.frames - start,
            };
            if span == 0 {
                continue;
            }

            let sent = producer.send_frames(&block.data, start, span)?;
            start += sent;
            summary.frames += sent as u64;
            if pacer.is_some() {
                budget -= sent;
            }
        }
    }
}

/// 让会话处于能接收该块的格式
fn prepare<T: Transport>(
    session: &mut TransportSession<T>,
    producer: &mut ProducerHandle,
    block: &SourceBlock,
    config: &EngineConfig,
) -> Result<(), SessionError> {
    match session.source_format() {
        None => session.open(block.format),
        Some(current) if current != block.format => session.change_format(producer, block.format).map(|_| ()),
        Some(_) if block.track_start && config.resync_tracks => {
            // 快速恢复会清空环：上一曲的尾巴先播完
            if !producer.wait_drained(config.session.flush_timeout) {
                log::warn!(
                    "Ring not drained within {:?} at track boundary",
                    config.session.flush_timeout
                );
            }
            session.change_format(producer, block.format).map(|_| ())
        }
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{BitOrder, SourceFormat};
    use crate::decode::{MemorySource, Playlist, ToneSource};
    use crate::transport::{CapabilitySet, Clocking, Pace, SimulatedTransport};

    fn threaded_sim() -> SimulatedTransport {
        SimulatedTransport::new(
            CapabilitySet::full(),
            64,
            Clocking::Threaded {
                pace: Pace::Fixed(Duration::from_millis(1)),
                realtime_priority: false,
            },
        )
    }

    fn fast_config(pacing: Pacing) -> EngineConfig {
        EngineConfig {
            session: SessionConfig::fast(),
            pacing,
            realtime_producer: false,
            resync_tracks: true,
        }
    }

    struct Chain(Vec<Box<dyn SampleSource>>);

    impl SampleSource for Chain {
        fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
            while let Some(first) = self.0.first_mut() {
                if let Some(block) = first.next_block()? {
                    return Ok(Some(block));
                }
                self.0.remove(0);
            }
            Ok(None)
        }
    }

    #[test]
    fn test_plays_source_to_completion() {
        let format = SourceFormat::pcm(44_100, 2, 16);
        let tone = ToneSource::new(format, 440.0, 4_410).block_frames(441);
        let engine = Engine::spawn(threaded_sim(), Box::new(tone), fast_config(Pacing::Freerun)).unwrap();
        let summary = engine.join().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.frames, 4_410);
        assert_eq!(summary.blocks, 10);
    }

    #[test]
    fn test_format_change_reopens() {
        let pcm = SourceFormat::pcm(44_100, 2, 16);
        let dsd = SourceFormat::dsd(2_822_400, 2, BitOrder::MsbFirst);
        let source = Chain(vec![
            Box::new(ToneSource::new(pcm, 440.0, 2_205)),
            Box::new(ToneSource::new(dsd, 440.0, 4_410)),
        ]);
        let engine = Engine::spawn(threaded_sim(), Box::new(source), fast_config(Pacing::Freerun)).unwrap();
        let summary = engine.join().unwrap();
        assert_eq!(summary.frames, 2_205 + 4_410);
        assert_eq!(summary.transitions.full_reopens, 1);
        assert_eq!(summary.last_flush.map(|f| f.multiplier), Some(1));
    }

    #[test]
    fn test_same_format_track_change_resyncs() {
        let format = SourceFormat::pcm(48_000, 2, 16);
        let mut playlist = Playlist::new();
        for tag in 1..=2u8 {
            playlist.push_source(MemorySource::new([SourceBlock::new(format, vec![tag; 4 * 480])]));
        }
        let engine = Engine::spawn(threaded_sim(), Box::new(playlist), fast_config(Pacing::Freerun)).unwrap();
        let summary = engine.join().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.frames, 960);
        assert_eq!(summary.transitions.quick_resumes, 1);
        assert_eq!(summary.transitions.full_reopens, 0);

        let staging = summary.staging;
        assert!(staging.direct_writes + staging.scratch_writes + staging.bypass_writes >= 2);
    }

    #[test]
    fn test_track_resync_can_be_disabled() {
        let format = SourceFormat::pcm(48_000, 2, 16);
        let mut playlist = Playlist::new();
        for tag in 1..=2u8 {
            playlist.push_source(MemorySource::new([SourceBlock::new(format, vec![tag; 4 * 480])]));
        }
        let config = EngineConfig {
            resync_tracks: false,
            ..fast_config(Pacing::Freerun)
        };
        let summary = Engine::spawn(threaded_sim(), Box::new(playlist), config)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(summary.frames, 960);
        assert_eq!(summary.transitions.quick_resumes, 0);
    }

    #[test]
    fn test_unsupported_blocks_skipped() {
        let stereo = SourceFormat::pcm(48_000, 2, 16);
        let surround = SourceFormat::pcm(48_000, 6, 16);
        let source = MemorySource::new([
            SourceBlock::new(surround, vec![0; 12 * 100]),
            SourceBlock::new(stereo, vec![0; 4 * 480]),
        ]);
        let engine = Engine::spawn(threaded_sim(), Box::new(source), fast_config(Pacing::Freerun)).unwrap();
        let summary = engine.join().unwrap();
        assert_eq!(summary.skipped_blocks, 1);
        assert_eq!(summary.frames, 480);
    }

    #[test]
    fn test_stop_interrupts_clocked_playback() {
        let format = SourceFormat::pcm(48_000, 2, 16);
        // 10 秒的信号，按实时节拍送
        let tone = ToneSource::with_seconds(format, 1_000.0, 10.0);
        let engine = Engine::spawn(
            threaded_sim(),
            Box::new(tone),
            fast_config(Pacing::Clocked { ticks_per_second: 1_000 }),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        engine.stop();
        let summary = engine.join().unwrap();
        assert!(!summary.completed);
        assert!(summary.frames < 48_000 * 10);
    }
}

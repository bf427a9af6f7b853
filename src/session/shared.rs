//! 生产者/消费者共享的会话核心
//!
//! - `ConsumerEndpoint`: 交给 transport 的 render 回调，只 pop、计数、入队诊断事件
//! - `ProducerHandle`: 生产者一侧，转换后 push，环满时在消费者的信号上有界等待
//! - `DiagnosticsHandle`: 热路径之外查询状态
//!
//! 两条路径都只经 `Coordinator::try_access` 进入环。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};

use super::error::SessionError;
use super::SessionState;
use crate::audio::format::SourceFormat;
use crate::audio::stats::{PlaybackStats, StatsReport};
use crate::audio::timing::{deadline_after, now_ns};
use crate::audio::RingBuffer;
use crate::config::SessionConfig;
use crate::convert::stage::StageCounters;
use crate::convert::{ConversionMode, ConvertError, Stager};
use crate::diag::{DiagEvent, DiagQueue};
use crate::sync::{CachedSnapshot, Coordinator, FormatSnapshot};
use crate::transport::{RenderRequest, RenderSource};

/// 单次 push 的静音块上限
const SILENCE_CHUNK: usize = 4096;

/// 送入的范围
#[derive(Clone, Copy)]
enum Span {
    /// 所有声道的样本总数
    Samples(usize),
    Frames(usize),
}

/// 出声门控：预填充字节数和稳定截止时刻都满足后打开
pub(crate) struct Gate {
    open: AtomicBool,
    prefill: AtomicUsize,
    release_at_ns: AtomicU64,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            prefill: AtomicUsize::new(0),
            release_at_ns: AtomicU64::new(0),
        }
    }

    /// 关闭门控，等待 `prefill` 字节且 `stabilization` 之后再出声
    pub(crate) fn arm(&self, prefill: usize, stabilization: Duration) {
        self.prefill.store(prefill, Ordering::Relaxed);
        self.release_at_ns
            .store(deadline_after(stabilization), Ordering::Relaxed);
        self.open.store(false, Ordering::Release);
    }

    /// 冲刷或播完剩余数据时直接打开
    pub(crate) fn force_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[inline]
    fn try_open(&self, available: usize) -> bool {
        if available >= self.prefill.load(Ordering::Relaxed)
            && now_ns() >= self.release_at_ns.load(Ordering::Relaxed)
        {
            self.open.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// 热路径之外可读的状态
struct Status {
    state: AtomicU8,
    /// 0 为未选择，否则为 `ConversionMode::ALL` 下标 + 1
    mode: AtomicU8,
    retries: AtomicU64,
    ring_capacity: AtomicUsize,
    cycle_frames: AtomicU32,
    frames_per_second: AtomicU32,
}

pub(crate) struct SharedCore {
    pub(crate) coordinator: Coordinator,
    pub(crate) stats: PlaybackStats,
    pub(crate) diag: Arc<DiagQueue>,
    pub(crate) gate: Gate,
    cancelled: AtomicBool,
    producer_waiting: AtomicBool,
    space: Unparker,
    status: Status,
}

impl SharedCore {
    /// 返回共享核心和生产者一侧的 Parker
    pub(crate) fn new(config: &SessionConfig) -> (Arc<Self>, Parker) {
        let parker = Parker::new();
        let core = Arc::new(Self {
            coordinator: Coordinator::new(RingBuffer::with_min_capacity(0), config.drain),
            stats: PlaybackStats::new(),
            diag: Arc::new(DiagQueue::new(config.diag_capacity)),
            gate: Gate::new(),
            cancelled: AtomicBool::new(false),
            producer_waiting: AtomicBool::new(false),
            space: parker.unparker().clone(),
            status: Status {
                state: AtomicU8::new(SessionState::Closed as u8),
                mode: AtomicU8::new(0),
                retries: AtomicU64::new(0),
                ring_capacity: AtomicUsize::new(0),
                cycle_frames: AtomicU32::new(0),
                frames_per_second: AtomicU32::new(0),
            },
        });
        (core, parker)
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_raw(self.status.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.status.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_mode(&self, mode: Option<ConversionMode>) {
        let raw = mode
            .and_then(|m| ConversionMode::ALL.iter().position(|&x| x == m))
            .map_or(0, |i| i as u8 + 1);
        self.status.mode.store(raw, Ordering::Relaxed);
    }

    fn mode(&self) -> Option<ConversionMode> {
        match self.status.mode.load(Ordering::Relaxed) {
            0 => None,
            n => ConversionMode::ALL.get(n as usize - 1).copied(),
        }
    }

    pub(crate) fn add_retries(&self, n: u32) {
        self.status.retries.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_geometry(&self, ring_capacity: usize, cycle_frames: u32, frames_per_second: u32) {
        self.status.ring_capacity.store(ring_capacity, Ordering::Relaxed);
        self.status.cycle_frames.store(cycle_frames, Ordering::Relaxed);
        self.status
            .frames_per_second
            .store(frames_per_second, Ordering::Relaxed);
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.space.unpark();
    }

    pub(crate) fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// transport 回调端
///
/// 每次 start 新建一个，拥有自己的快照副本
pub(crate) struct ConsumerEndpoint {
    core: Arc<SharedCore>,
    cache: CachedSnapshot,
}

impl ConsumerEndpoint {
    pub(crate) fn new(core: Arc<SharedCore>) -> Self {
        Self {
            core,
            cache: CachedSnapshot::default(),
        }
    }

    #[inline]
    fn last_silence(&self) -> u8 {
        self.cache.get().map_or(0, |s| s.silence)
    }
}

impl RenderSource for ConsumerEndpoint {
    fn render(&mut self, request: &mut RenderRequest<'_>) {
        let core = &*self.core;
        let requested = request.buffer.len();

        let Some(guard) = core.coordinator.try_access() else {
            request.buffer.fill(self.last_silence());
            core.diag.push(DiagEvent::ReconfigureSilence {
                cycle: request.cycle,
            });
            return;
        };
        guard.refresh(&mut self.cache);
        let ring = guard.ring();

        if self.cache.get().is_none() {
            request.buffer.fill(ring.silence());
            return;
        }

        let available = ring.available();
        core.stats.on_callback(available, request.host_time);

        if !core.gate.is_open() {
            if !core.gate.try_open(available) {
                request.buffer.fill(ring.silence());
                core.stats.record_gated();
                return;
            }
            core.diag.push(DiagEvent::GateOpened {
                cycle: request.cycle,
                available,
            });
        }

        let outcome = ring.pop(request.buffer);
        let filled = outcome.filled(requested);
        if outcome.is_underrun() {
            core.stats.record_underrun();
            core.diag.push(DiagEvent::Underrun {
                cycle: request.cycle,
                requested,
                filled,
            });
        }
        core.stats.add_bytes_played(filled as u64);
        drop(guard);

        if filled > 0 && core.producer_waiting.load(Ordering::SeqCst) {
            core.space.unpark();
        }
    }
}

/// 生产者参数
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProducerSettings {
    scratch_frames: usize,
    backpressure_wait: Duration,
    backpressure_timeout: Duration,
    alignment_timeout: Duration,
}

impl From<&SessionConfig> for ProducerSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            scratch_frames: config.scratch_frames,
            backpressure_wait: config.backpressure_wait,
            backpressure_timeout: config.backpressure_timeout,
            alignment_timeout: config.alignment_timeout,
        }
    }
}

/// 生产者句柄
///
/// 每个会话只有一个；格式切换需要它的可变借用，
/// 因此切换期间不会有并发的 push
pub struct ProducerHandle {
    core: Arc<SharedCore>,
    parker: Parker,
    settings: ProducerSettings,
    cache: CachedSnapshot,
    stager: Option<Stager>,
    stager_generation: u64,
    /// 已换下的暂存管线的累计
    retired_counters: StageCounters,
    accepted_bytes: u64,
}

impl ProducerHandle {
    pub(crate) fn new(core: Arc<SharedCore>, parker: Parker, settings: ProducerSettings) -> Self {
        Self {
            core,
            parker,
            settings,
            cache: CachedSnapshot::default(),
            stager: None,
            stager_generation: 0,
            retired_counters: StageCounters::default(),
            accepted_bytes: 0,
        }
    }

    pub(crate) fn belongs_to(&self, core: &Arc<SharedCore>) -> bool {
        Arc::ptr_eq(&self.core, core)
    }

    /// 会话正在关闭，生产循环应退出
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// 当前源格式（最近一次看到的快照）
    pub fn format(&self) -> Option<SourceFormat> {
        self.cache.get().map(|s| s.source)
    }

    pub fn accepted_bytes(&self) -> u64 {
        self.accepted_bytes
    }

    /// 会话开始以来各写入路径的累计次数
    pub fn stage_counters(&self) -> StageCounters {
        let mut total = self.retired_counters;
        if let Some(stager) = self.stager.as_ref() {
            total.absorb(stager.counters());
        }
        total
    }

    fn stager_for(&mut self, snapshot: &FormatSnapshot, generation: u64) -> Result<&mut Stager, ConvertError> {
        let stager = match self.stager.take() {
            Some(stager) if self.stager_generation == generation => stager,
            retired => {
                if let Some(old) = retired {
                    self.retired_counters.absorb(old.counters());
                }
                // 新快照即新曲目：对齐检测从头开始
                let samples = self.settings.alignment_timeout.as_secs_f64()
                    * snapshot.source.frames_per_second() as f64
                    * snapshot.source.channels as f64;
                let stager = Stager::new(
                    &snapshot.source,
                    &snapshot.wire,
                    snapshot.kernel,
                    self.settings.scratch_frames,
                    samples as u64,
                )?;
                self.stager_generation = generation;
                stager
            }
        };
        Ok(self.stager.insert(stager))
    }

    /// 环满时等待消费者腾出空间（有界）
    fn wait_for_space(&self, limit: Duration) {
        self.core.producer_waiting.store(true, Ordering::SeqCst);
        self.parker
            .park_timeout(self.settings.backpressure_wait.min(limit));
        self.core.producer_waiting.store(false, Ordering::Relaxed);
    }

    /// 送入一块源格式字节，返回接受的字节数
    ///
    /// `sample_count` 为所有声道的样本总数。环满时按背压策略等待，
    /// 持续没有进展超过 `backpressure_timeout` 就返回部分写入；
    /// 会话取消时立即返回
    pub fn send_audio(&mut self, bytes: &[u8], sample_count: usize) -> Result<usize, SessionError> {
        let (frames, frame_bytes) = self.send_inner(bytes, 0, Span::Samples(sample_count))?;
        Ok(frames * frame_bytes)
    }

    /// 从块内第 `start` 帧起送入最多 `frames` 帧，返回接受的帧数
    ///
    /// 平面布局的块只能按帧续传，部分写入后用它继续
    pub fn send_frames(&mut self, bytes: &[u8], start: usize, frames: usize) -> Result<usize, SessionError> {
        self.send_inner(bytes, start, Span::Frames(frames))
            .map(|(frames, _)| frames)
    }

    fn send_inner(&mut self, bytes: &[u8], start: usize, span: Span) -> Result<(usize, usize), SessionError> {
        let core = Arc::clone(&self.core);
        let mut done = 0;
        let mut frame_bytes = 0;
        let mut wanted = 0;
        let mut stall_deadline = Instant::now() + self.settings.backpressure_timeout;

        loop {
            if core.is_cancelled() {
                break;
            }

            let staged = match core.coordinator.try_access() {
                Some(guard) => {
                    guard.refresh(&mut self.cache);
                    let Some(snapshot) = self.cache.get().copied() else {
                        if done > 0 {
                            break;
                        }
                        return Err(SessionError::InvalidState {
                            state: core.state(),
                            operation: "send audio",
                        });
                    };
                    let stager = self.stager_for(&snapshot, self.cache.generation())?;

                    frame_bytes = stager.input_frame_bytes();
                    let block_frames = bytes.len() / frame_bytes;
                    let requested = match span {
                        Span::Samples(n) => n / snapshot.source.channels.max(1) as usize,
                        Span::Frames(n) => n,
                    };
                    wanted = requested.min(block_frames.saturating_sub(start));
                    if done >= wanted {
                        break;
                    }
                    stager.stage(guard.ring(), bytes, block_frames, start + done, wanted - done)
                }
                None => 0,
            };

            if staged > 0 {
                done += staged;
                stall_deadline = Instant::now() + self.settings.backpressure_timeout;
                continue;
            }

            let now = Instant::now();
            if now >= stall_deadline {
                core.diag.push(DiagEvent::BackpressureTimeout {
                    requested: wanted * frame_bytes,
                    accepted: done * frame_bytes,
                });
                break;
            }
            self.wait_for_space(stall_deadline - now);
        }

        self.accepted_bytes += (done * frame_bytes) as u64;
        Ok((done, frame_bytes))
    }

    /// 按线上静音字节写入 `len` 字节（向下对齐到整帧），返回写入字节数
    pub fn push_silence(&mut self, len: usize) -> usize {
        let core = Arc::clone(&self.core);
        let mut pushed = 0;
        let mut stall_deadline = Instant::now() + self.settings.backpressure_timeout;

        loop {
            if core.is_cancelled() {
                break;
            }

            let written = match core.coordinator.try_access() {
                Some(guard) => {
                    guard.refresh(&mut self.cache);
                    let Some(snapshot) = self.cache.get() else {
                        break;
                    };
                    let frame = snapshot.wire_frame_bytes().max(1);
                    let target = len / frame * frame;
                    if pushed >= target {
                        break;
                    }

                    let ring = guard.ring();
                    let chunk = (target - pushed).min(ring.free()).min(SILENCE_CHUNK) / frame * frame;
                    if chunk == 0 {
                        0
                    } else {
                        let block = [ring.silence(); SILENCE_CHUNK];
                        ring.push(&block[..chunk])
                    }
                }
                None => 0,
            };

            if written > 0 {
                pushed += written;
                stall_deadline = Instant::now() + self.settings.backpressure_timeout;
                continue;
            }

            let now = Instant::now();
            if now >= stall_deadline {
                break;
            }
            self.wait_for_space(stall_deadline - now);
        }
        pushed
    }

    /// 打开门控，等待环被播空，超时返回 false
    pub fn wait_drained(&mut self, timeout: Duration) -> bool {
        self.core.gate.force_open();
        let deadline = Instant::now() + timeout;
        loop {
            let drained = self
                .core
                .coordinator
                .try_access()
                .map(|guard| guard.ring().available() == 0);
            if drained == Some(true) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline || self.core.is_cancelled() {
                return false;
            }
            self.wait_for_space(deadline - now);
        }
    }
}

/// 从其他线程请求生产者退出
///
/// 只置取消标志并唤醒背压等待；transport 的停止和释放仍由 `close` 完成
#[derive(Clone)]
pub struct CancelHandle {
    core: Arc<SharedCore>,
}

impl CancelHandle {
    pub(crate) fn new(core: Arc<SharedCore>) -> Self {
        Self { core }
    }

    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }
}

/// 诊断快照
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub state: SessionState,
    pub underruns: u64,
    pub gated_cycles: u64,
    pub callbacks: u64,
    pub bytes_played: u64,
    /// 重配置进行中时为 None
    pub ring_available: Option<usize>,
    pub ring_capacity: usize,
    pub mode: Option<ConversionMode>,
    pub retries: u64,
    pub generation: u64,
    pub dropped_events: u64,
    pub drain_timeouts: u64,
}

/// 热路径之外的只读视图
#[derive(Clone)]
pub struct DiagnosticsHandle {
    core: Arc<SharedCore>,
}

impl DiagnosticsHandle {
    pub(crate) fn new(core: Arc<SharedCore>) -> Self {
        Self { core }
    }

    pub fn snapshot(&self) -> Diagnostics {
        let core = &*self.core;
        Diagnostics {
            state: core.state(),
            underruns: core.stats.underrun_count(),
            gated_cycles: core.stats.gated_count(),
            callbacks: core.stats.callback_count(),
            bytes_played: core.stats.bytes_played(),
            ring_available: core
                .coordinator
                .try_access()
                .map(|guard| guard.ring().available()),
            ring_capacity: core.status.ring_capacity.load(Ordering::Relaxed),
            mode: core.mode(),
            retries: core.status.retries.load(Ordering::Relaxed),
            generation: core.coordinator.generation(),
            dropped_events: core.diag.dropped(),
            drain_timeouts: core.coordinator.drain_timeouts(),
        }
    }

    /// 当前在途访问数
    pub fn in_flight(&self) -> usize {
        self.core.coordinator.active()
    }

    pub fn underruns(&self) -> u64 {
        self.core.stats.underrun_count()
    }

    pub fn stats_report(&self) -> StatsReport {
        self.core.stats.report(
            self.core.status.cycle_frames.load(Ordering::Relaxed),
            self.core.status.frames_per_second.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{BitOrder, Endianness, WireFormat, WireKind};
    use crate::convert::{DsdMode, Kernel, Pack24Align, PcmMode};

    fn pcm16(rate: u32) -> FormatSnapshot {
        let source = SourceFormat::pcm(rate, 2, 16);
        let wire = WireFormat {
            sample_rate: rate,
            channels: 2,
            bytes_per_sample: 2,
            kind: WireKind::Pcm { float: false },
        };
        FormatSnapshot::new(
            source,
            wire,
            Kernel::best(ConversionMode::Pcm(PcmMode::Bypass), Pack24Align::Lsb),
        )
    }

    fn setup(snapshot: FormatSnapshot, ring: usize) -> (Arc<SharedCore>, ProducerHandle) {
        let config = SessionConfig {
            backpressure_wait: Duration::from_millis(1),
            backpressure_timeout: Duration::from_millis(20),
            ..SessionConfig::fast()
        };
        let (core, parker) = SharedCore::new(&config);
        {
            let mut guard = core.coordinator.reconfigure().unwrap();
            guard.resize_ring(ring);
            guard.publish(Some(snapshot));
        }
        let producer = ProducerHandle::new(Arc::clone(&core), parker, ProducerSettings::from(&config));
        (core, producer)
    }

    fn render(consumer: &mut ConsumerEndpoint, len: usize, cycle: u64) -> Vec<u8> {
        let mut buffer = vec![0xEEu8; len];
        consumer.render(&mut RenderRequest {
            buffer: &mut buffer,
            cycle,
            host_time: 0,
        });
        buffer
    }

    #[test]
    fn test_gate_holds_until_prefill() {
        let (core, mut producer) = setup(pcm16(48_000), 256);
        core.gate.arm(32, Duration::ZERO);
        let mut consumer = ConsumerEndpoint::new(Arc::clone(&core));

        assert_eq!(producer.send_audio(&[7u8; 16], 8).unwrap(), 16);
        assert_eq!(render(&mut consumer, 8, 0), vec![0u8; 8]);
        assert_eq!(core.stats.gated_count(), 1);

        assert_eq!(producer.send_audio(&[7u8; 16], 8).unwrap(), 16);
        assert_eq!(render(&mut consumer, 8, 1), vec![7u8; 8]);
        assert_eq!(core.stats.underrun_count(), 0);
    }

    #[test]
    fn test_underrun_fills_silence_and_counts() {
        let mut dsd = pcm16(44_100);
        dsd.silence = 0x69;
        let (core, mut producer) = setup(dsd, 256);
        core.gate.force_open();
        let mut consumer = ConsumerEndpoint::new(Arc::clone(&core));

        producer.send_audio(&[1u8; 4], 2).unwrap();
        let out = render(&mut consumer, 8, 0);
        assert_eq!(out, [1, 1, 1, 1, 0x69, 0x69, 0x69, 0x69]);
        assert_eq!(core.stats.underrun_count(), 1);
        assert_eq!(core.stats.bytes_played(), 4);
    }

    #[test]
    fn test_reconfiguration_renders_silence() {
        let (core, _producer) = setup(pcm16(48_000), 256);
        core.gate.force_open();
        let mut consumer = ConsumerEndpoint::new(Arc::clone(&core));
        render(&mut consumer, 4, 0);

        let guard = core.coordinator.reconfigure().unwrap();
        assert_eq!(render(&mut consumer, 4, 1), vec![0u8; 4]);
        drop(guard);
        assert_eq!(core.diag.pop(), Some(DiagEvent::Underrun { cycle: 0, requested: 4, filled: 0 }));
        assert_eq!(core.diag.pop(), Some(DiagEvent::ReconfigureSilence { cycle: 1 }));
    }

    #[test]
    fn test_backpressure_returns_partial_write() {
        let (core, mut producer) = setup(pcm16(48_000), 64);
        let block = vec![3u8; 128];
        let started = Instant::now();
        // 64 字节的环只能放下 15 帧
        assert_eq!(producer.send_audio(&block, 64).unwrap(), 60);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(matches!(
            core.diag.pop(),
            Some(DiagEvent::BackpressureTimeout { requested: 128, accepted: 60 })
        ));
    }

    #[test]
    fn test_consumer_wakes_blocked_producer() {
        let (core, mut producer) = setup(pcm16(48_000), 64);
        core.gate.force_open();
        let mut consumer = ConsumerEndpoint::new(Arc::clone(&core));

        let drainer = std::thread::spawn(move || {
            for cycle in 0..40 {
                render(&mut consumer, 16, cycle);
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let block = vec![5u8; 160];
        assert_eq!(producer.send_audio(&block, 80).unwrap(), 160);
        drainer.join().unwrap();
    }

    #[test]
    fn test_silence_push_is_frame_aligned() {
        let source = SourceFormat::dsd(2_822_400, 2, BitOrder::MsbFirst);
        let wire = WireFormat {
            sample_rate: 2_822_400,
            channels: 2,
            bytes_per_sample: 4,
            kind: WireKind::Dsd {
                bit_order: BitOrder::MsbFirst,
                endianness: Endianness::Big,
            },
        };
        let snapshot = FormatSnapshot::new(
            source,
            wire,
            Kernel::best(ConversionMode::Dsd(DsdMode::Passthrough), Pack24Align::Lsb),
        );
        let (core, mut producer) = setup(snapshot, 1024);
        assert_eq!(producer.push_silence(100), 96);

        let guard = core.coordinator.try_access().unwrap();
        let mut out = vec![0u8; 96];
        guard.ring().pop(&mut out);
        assert!(out.iter().all(|&b| b == 0x69));
    }

    #[test]
    fn test_cancel_stops_producer() {
        let (core, mut producer) = setup(pcm16(48_000), 64);
        core.cancel();
        assert_eq!(producer.send_audio(&[0u8; 16], 8).unwrap(), 0);
        assert!(producer.is_cancelled());
    }

    #[test]
    fn test_send_before_open_is_invalid() {
        let config = SessionConfig::fast();
        let (core, parker) = SharedCore::new(&config);
        let mut producer = ProducerHandle::new(core, parker, ProducerSettings::from(&config));
        assert!(matches!(
            producer.send_audio(&[0u8; 4], 2),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_mode_roundtrip_in_status() {
        let config = SessionConfig::fast();
        let (core, _parker) = SharedCore::new(&config);
        for mode in ConversionMode::ALL {
            core.set_mode(Some(mode));
            assert_eq!(core.mode(), Some(mode));
        }
        core.set_mode(None);
        assert_eq!(core.mode(), None);
    }
}

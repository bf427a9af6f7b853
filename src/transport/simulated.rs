//! 进程内模拟 transport
//!
//! 按 transport 约定工作：在自己的 "transport-io" 线程上以固定节拍调用 render，
//! 周期字节数随当前线上格式变化。也可以用 Manual 模式由测试线程逐周期驱动。
//!
//! 额外提供故障注入（连接/重新协商失败）、事件记录、输出捕获，
//! 以及在 release 时调用的探针，用来检查释放窗口内没有在途访问。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{CapabilitySet, RenderRequest, RenderSource, Transport, TransportError};
use crate::audio::format::WireFormat;
use crate::audio::timing::now_ticks;
use crate::rt::{promote_current_thread, PriorityOutcome};

/// 回调节拍
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// 按 cycle_frames / 帧率 的真实周期
    Realtime,
    /// 固定间隔（测试加速用）
    Fixed(Duration),
}

/// 回调由谁驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clocking {
    Threaded { pace: Pace, realtime_priority: bool },
    /// 只在 `SimHandle::pump` 时回调
    Manual,
}

/// 记录下来的 transport 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    CapabilitiesQueried,
    Connected(WireFormat),
    ConnectFailed(TransportError),
    Renegotiated(WireFormat),
    RenegotiateFailed(TransportError),
    Started,
    Stopped,
    /// `in_flight` 为释放时探针读到的在途访问数
    Released { in_flight: usize, streaming: bool },
}

type ReleaseProbe = Box<dyn Fn() -> usize + Send>;

struct SimState {
    events: Mutex<Vec<SimEvent>>,
    capabilities: Mutex<CapabilitySet>,
    connect_failures: Mutex<VecDeque<TransportError>>,
    renegotiate_failures: Mutex<VecDeque<TransportError>>,
    release_probe: Mutex<Option<ReleaseProbe>>,
    capture: Mutex<Vec<u8>>,
    capture_limit: AtomicUsize,
    manual_source: Mutex<Option<Box<dyn RenderSource>>>,
    priority: Mutex<Option<PriorityOutcome>>,

    frame_bytes: AtomicUsize,
    frames_per_second: AtomicU32,
    cycles: AtomicU64,
    connected: AtomicBool,
    streaming: AtomicBool,
}

// 模拟设备侧的簿记，锁中毒时继续使用内部数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimState {
    fn record(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    fn set_format(&self, format: &WireFormat) {
        self.frame_bytes
            .store(format.bytes_per_frame(), Ordering::Release);
        self.frames_per_second
            .store(format.frames_per_second(), Ordering::Release);
    }

    fn period(&self, cycle_frames: u32) -> Duration {
        let fps = self.frames_per_second.load(Ordering::Acquire).max(1);
        Duration::from_nanos(cycle_frames as u64 * 1_000_000_000 / fps as u64)
    }

    fn run_cycle(&self, source: &mut dyn RenderSource, buffer: &mut Vec<u8>, cycle_frames: u32) {
        let len = cycle_frames as usize * self.frame_bytes.load(Ordering::Acquire);
        if buffer.len() < len {
            buffer.resize(len, 0);
        }
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let mut request = RenderRequest {
            buffer: &mut buffer[..len],
            cycle,
            host_time: now_ticks(),
        };
        source.render(&mut request);

        let limit = self.capture_limit.load(Ordering::Relaxed);
        if limit > 0 {
            let mut capture = lock(&self.capture);
            let room = limit.saturating_sub(capture.len());
            capture.extend_from_slice(&buffer[..len.min(room)]);
        }
    }
}

/// 测试/观测句柄，与 transport 共享状态
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<SimState>,
    cycle_frames: u32,
}

impl SimHandle {
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.state.events).clear();
    }

    /// 之后 n 次 connect 依次返回 `error`
    pub fn fail_next_connects(&self, n: usize, error: TransportError) {
        lock(&self.state.connect_failures).extend(std::iter::repeat(error).take(n));
    }

    /// 之后 n 次 renegotiate 依次返回 `error`
    pub fn fail_next_renegotiations(&self, n: usize, error: TransportError) {
        lock(&self.state.renegotiate_failures).extend(std::iter::repeat(error).take(n));
    }

    pub fn set_capabilities(&self, capabilities: CapabilitySet) {
        *lock(&self.state.capabilities) = capabilities;
    }

    /// release 时调用，返回值记录在 `SimEvent::Released`
    pub fn set_release_probe(&self, probe: impl Fn() -> usize + Send + 'static) {
        *lock(&self.state.release_probe) = Some(Box::new(probe));
    }

    /// 捕获输出，最多 `limit` 字节
    pub fn enable_capture(&self, limit: usize) {
        self.state.capture_limit.store(limit, Ordering::Relaxed);
    }

    pub fn take_capture(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.state.capture))
    }

    /// Manual 模式下驱动 n 个周期，返回实际运行的周期数
    pub fn pump(&self, n: usize) -> usize {
        let mut slot = lock(&self.state.manual_source);
        let Some(source) = slot.as_mut() else {
            return 0;
        };
        let mut buffer = Vec::new();
        for _ in 0..n {
            self.state
                .run_cycle(source.as_mut(), &mut buffer, self.cycle_frames);
        }
        n
    }

    pub fn cycles(&self) -> u64 {
        self.state.cycles.load(Ordering::Relaxed)
    }

    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    /// 回调线程的调度提升结果
    pub fn priority(&self) -> Option<PriorityOutcome> {
        *lock(&self.state.priority)
    }
}

pub struct SimulatedTransport {
    state: Arc<SimState>,
    clocking: Clocking,
    cycle_frames: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedTransport {
    pub fn new(capabilities: CapabilitySet, cycle_frames: u32, clocking: Clocking) -> Self {
        Self {
            state: Arc::new(SimState {
                events: Mutex::new(Vec::new()),
                capabilities: Mutex::new(capabilities),
                connect_failures: Mutex::new(VecDeque::new()),
                renegotiate_failures: Mutex::new(VecDeque::new()),
                release_probe: Mutex::new(None),
                capture: Mutex::new(Vec::new()),
                capture_limit: AtomicUsize::new(0),
                manual_source: Mutex::new(None),
                priority: Mutex::new(None),
                frame_bytes: AtomicUsize::new(0),
                frames_per_second: AtomicU32::new(0),
                cycles: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
            }),
            clocking,
            cycle_frames: cycle_frames.max(1),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
            cycle_frames: self.cycle_frames,
        }
    }

    fn spawn_io_thread(
        &mut self,
        mut source: Box<dyn RenderSource>,
        pace: Pace,
        realtime_priority: bool,
    ) -> Result<(), TransportError> {
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let cycle_frames = self.cycle_frames;
        running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("transport-io".into())
            .spawn(move || {
                if realtime_priority {
                    let outcome = promote_current_thread(state.period(cycle_frames));
                    *lock(&state.priority) = Some(outcome);
                }

                let mut buffer = Vec::new();
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    state.run_cycle(source.as_mut(), &mut buffer, cycle_frames);
                    match pace {
                        Pace::Realtime => {
                            next += state.period(cycle_frames);
                            let now = Instant::now();
                            if next > now {
                                thread::sleep(next - now);
                            } else {
                                next = now;
                            }
                        }
                        Pace::Fixed(interval) => thread::sleep(interval),
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                TransportError::Failure(format!("failed to spawn io thread: {}", e))
            })?;

        self.thread = Some(handle);
        Ok(())
    }
}

impl Transport for SimulatedTransport {
    fn query_capabilities(&mut self) -> Result<CapabilitySet, TransportError> {
        self.state.record(SimEvent::CapabilitiesQueried);
        Ok(*lock(&self.state.capabilities))
    }

    fn connect(&mut self, format: &WireFormat) -> Result<(), TransportError> {
        if self.state.connected.load(Ordering::Acquire) {
            return Err(TransportError::Failure("already connected".into()));
        }
        if let Some(error) = lock(&self.state.connect_failures).pop_front() {
            self.state.record(SimEvent::ConnectFailed(error.clone()));
            return Err(error);
        }
        if !lock(&self.state.capabilities).supports(format) {
            let error = TransportError::Rejected(format.to_string());
            self.state.record(SimEvent::ConnectFailed(error.clone()));
            return Err(error);
        }

        self.state.set_format(format);
        self.state.connected.store(true, Ordering::Release);
        self.state.record(SimEvent::Connected(*format));
        Ok(())
    }

    fn renegotiate(&mut self, format: &WireFormat) -> Result<(), TransportError> {
        if !self.state.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = lock(&self.state.renegotiate_failures).pop_front() {
            self.state.record(SimEvent::RenegotiateFailed(error.clone()));
            return Err(error);
        }
        if !lock(&self.state.capabilities).supports(format) {
            let error = TransportError::Rejected(format.to_string());
            self.state.record(SimEvent::RenegotiateFailed(error.clone()));
            return Err(error);
        }

        self.state.set_format(format);
        self.state.record(SimEvent::Renegotiated(*format));
        Ok(())
    }

    fn start(&mut self, source: Box<dyn RenderSource>) -> Result<(), TransportError> {
        if !self.state.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        if self.state.streaming.load(Ordering::Acquire) {
            return Err(TransportError::AlreadyStreaming);
        }

        match self.clocking {
            Clocking::Threaded {
                pace,
                realtime_priority,
            } => self.spawn_io_thread(source, pace, realtime_priority)?,
            Clocking::Manual => *lock(&self.state.manual_source) = Some(source),
        }

        self.state.streaming.store(true, Ordering::Release);
        self.state.record(SimEvent::Started);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        if !self.state.streaming.load(Ordering::Acquire) {
            return Ok(());
        }

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                return Err(TransportError::Failure("io thread panicked".into()));
            }
        }
        // pump 持锁期间不会被取走
        lock(&self.state.manual_source).take();

        self.state.streaming.store(false, Ordering::Release);
        self.state.record(SimEvent::Stopped);
        Ok(())
    }

    fn release(&mut self) -> Result<(), TransportError> {
        let in_flight = lock(&self.state.release_probe)
            .as_ref()
            .map_or(0, |probe| probe());
        let streaming = self.state.streaming.load(Ordering::Acquire);
        self.state.record(SimEvent::Released {
            in_flight,
            streaming,
        });

        if streaming {
            return Err(TransportError::StillStreaming);
        }
        self.state.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn cycle_frames(&self) -> u32 {
        self.cycle_frames
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::WireKind;

    struct Counter(u8);

    impl RenderSource for Counter {
        fn render(&mut self, request: &mut RenderRequest<'_>) {
            request.buffer.fill(self.0);
            self.0 = self.0.wrapping_add(1);
        }
    }

    fn wire() -> WireFormat {
        WireFormat {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 2,
            kind: WireKind::Pcm { float: false },
        }
    }

    #[test]
    fn test_manual_pump_and_capture() {
        let mut sim = SimulatedTransport::new(CapabilitySet::full(), 4, Clocking::Manual);
        let handle = sim.handle();
        handle.enable_capture(1024);

        sim.connect(&wire()).unwrap();
        sim.start(Box::new(Counter(0))).unwrap();
        assert_eq!(handle.pump(3), 3);
        assert_eq!(handle.cycles(), 3);

        let capture = handle.take_capture();
        assert_eq!(capture.len(), 3 * 16);
        assert_eq!(&capture[16..32], &[1u8; 16]);

        sim.stop().unwrap();
        assert_eq!(handle.pump(1), 0);
        sim.release().unwrap();
        assert!(matches!(
            handle.events().last(),
            Some(SimEvent::Released { streaming: false, .. })
        ));
    }

    #[test]
    fn test_release_while_streaming_is_refused() {
        let mut sim = SimulatedTransport::new(CapabilitySet::full(), 4, Clocking::Manual);
        sim.connect(&wire()).unwrap();
        sim.start(Box::new(Counter(0))).unwrap();
        assert_eq!(sim.release(), Err(TransportError::StillStreaming));
    }

    #[test]
    fn test_injected_failures() {
        let mut sim = SimulatedTransport::new(CapabilitySet::full(), 4, Clocking::Manual);
        let handle = sim.handle();
        handle.fail_next_connects(2, TransportError::Busy);
        assert_eq!(sim.connect(&wire()), Err(TransportError::Busy));
        assert_eq!(sim.connect(&wire()), Err(TransportError::Busy));
        assert!(sim.connect(&wire()).is_ok());
    }

    #[test]
    fn test_threaded_stop_joins() {
        let mut sim = SimulatedTransport::new(
            CapabilitySet::full(),
            64,
            Clocking::Threaded {
                pace: Pace::Fixed(Duration::from_millis(1)),
                realtime_priority: false,
            },
        );
        let handle = sim.handle();
        sim.connect(&wire()).unwrap();
        sim.start(Box::new(Counter(0))).unwrap();
        thread::sleep(Duration::from_millis(20));
        sim.stop().unwrap();
        let cycles = handle.cycles();
        assert!(cycles > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(handle.cycles(), cycles);
    }
}

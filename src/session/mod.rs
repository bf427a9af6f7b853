//! 传输会话状态机
//!
//! ```text
//! Closed --open--> Opening --ready--> Streaming
//! Streaming --change_format--> Reconfiguring --> Streaming
//! any --close--> Closing --> Closed
//! ```
//!
//! 格式切换按策略表走三条路径之一：
//! - 快速恢复：清空环，跳过稳定延迟
//! - 轻量重开：持有 ReconfigureGuard 重新协商，调整环大小，不释放 transport
//! - 完全重开：按旧速率倍数冲刷静音，停止，静默后释放，等待，重新获取
//!
//! 关闭顺序固定：通知生产者，join 生产者线程，停止回调，
//! 确认没有在途访问，最后才释放 transport。

mod error;
pub mod negotiate;
pub mod policy;
pub mod retry;
mod shared;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use error::SessionError;
pub use negotiate::StreamPlan;
pub use policy::ReopenStrategy;
pub use shared::{CancelHandle, Diagnostics, DiagnosticsHandle, ProducerHandle};

use crate::audio::format::{SourceFormat, WireFormat};
use crate::config::SessionConfig;
use crate::diag::DiagDrain;
use crate::sync::{FormatSnapshot, ReconfigureGuard};
use crate::transport::{CapabilitySet, Transport};

use retry::with_retry;
use shared::{ConsumerEndpoint, ProducerSettings, SharedCore};

/// 诊断事件的排空间隔
const DIAG_DRAIN_INTERVAL: Duration = Duration::from_millis(20);

/// 会话状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed = 0,
    Opening = 1,
    Streaming = 2,
    Reconfiguring = 3,
    Closing = 4,
}

impl SessionState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Opening,
            2 => Self::Streaming,
            3 => Self::Reconfiguring,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// 最近一次完全重开的冲刷记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRecord {
    /// 旧格式的速率倍数
    pub multiplier: u32,
    /// 冲刷静音时长
    pub silence: Duration,
    /// 实际写入的静音字节数
    pub bytes: usize,
    /// 释放后等待时长
    pub settle: Duration,
    /// 整个重开耗时
    pub elapsed: Duration,
}

/// 各类切换的计数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransitionCounters {
    pub quick_resumes: u64,
    pub light_reopens: u64,
    pub full_reopens: u64,
    /// 轻量重开协商失败升级为完全重开的次数
    pub escalations: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFormat {
    source: SourceFormat,
    plan: StreamPlan,
}

pub struct TransportSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    core: Arc<SharedCore>,
    producer: Option<ProducerHandle>,
    workers: Vec<JoinHandle<()>>,
    active: Option<ActiveFormat>,
    capabilities: Option<CapabilitySet>,
    counters: TransitionCounters,
    last_flush: Option<FlushRecord>,
    diag_drain: Option<DiagDrain>,
    connected: bool,
    streaming: bool,
}

impl<T: Transport> TransportSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (core, parker) = SharedCore::new(&config);
        let producer = ProducerHandle::new(Arc::clone(&core), parker, ProducerSettings::from(&config));
        Self {
            transport,
            config,
            core,
            producer: Some(producer),
            workers: Vec::new(),
            active: None,
            capabilities: None,
            counters: TransitionCounters::default(),
            last_flush: None,
            diag_drain: None,
            connected: false,
            streaming: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// 取出唯一的生产者句柄
    pub fn take_producer(&mut self) -> Option<ProducerHandle> {
        self.producer.take()
    }

    /// 登记生产者线程，关闭时先 join 它再释放 transport
    pub fn attach_worker(&mut self, worker: JoinHandle<()>) {
        self.workers.push(worker);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn source_format(&self) -> Option<SourceFormat> {
        self.active.map(|a| a.source)
    }

    pub fn wire_format(&self) -> Option<WireFormat> {
        self.active.map(|a| a.plan.wire)
    }

    pub fn plan(&self) -> Option<StreamPlan> {
        self.active.map(|a| a.plan)
    }

    pub fn counters(&self) -> TransitionCounters {
        self.counters
    }

    pub fn last_flush(&self) -> Option<FlushRecord> {
        self.last_flush
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics_handle().snapshot()
    }

    pub fn diagnostics_handle(&self) -> DiagnosticsHandle {
        DiagnosticsHandle::new(Arc::clone(&self.core))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.core))
    }

    /// Closed → Opening → Streaming
    pub fn open(&mut self, format: SourceFormat) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Closed {
            return Err(SessionError::InvalidState {
                state,
                operation: "open",
            });
        }

        self.core.set_state(SessionState::Opening);
        self.core.reset_cancel();
        log::info!("Opening transport session for {}", format);

        match self.open_inner(format) {
            Ok(()) => {
                self.core.set_state(SessionState::Streaming);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to open transport session: {}", e);
                self.abandon();
                Err(e)
            }
        }
    }

    fn open_inner(&mut self, format: SourceFormat) -> Result<(), SessionError> {
        self.ensure_diag_drain()?;
        let caps = self.query_capabilities()?;
        let plan = negotiate::plan(&format, &caps)?;
        self.connect(&plan.wire)?;

        let core = Arc::clone(&self.core);
        let mut guard = core.coordinator.reconfigure()?;
        let stabilization = self.config.stabilization_for(plan.wire.bytes_per_second());
        self.install(&mut guard, format, plan, stabilization);
        drop(guard);

        self.start()
    }

    /// 切换到新格式，返回实际执行的策略
    ///
    /// 需要生产者句柄的可变借用：冲刷静音由会话经它写入
    pub fn change_format(
        &mut self,
        producer: &mut ProducerHandle,
        format: SourceFormat,
    ) -> Result<ReopenStrategy, SessionError> {
        if !producer.belongs_to(&self.core) {
            return Err(SessionError::ForeignProducer);
        }
        let state = self.state();
        let Some(active) = self.active.filter(|_| state == SessionState::Streaming) else {
            return Err(SessionError::InvalidState {
                state,
                operation: "change format",
            });
        };

        let strategy = policy::choose(&active.source, &format);
        // 先协商，不匹配时原来的流保持不动
        let caps = match self.capabilities {
            Some(caps) => caps,
            None => self.query_capabilities()?,
        };
        let plan = negotiate::plan(&format, &caps)?;

        log::info!(
            "Format change {} -> {} ({} -> {}): {}",
            active.source,
            format,
            active.source.class(),
            format.class(),
            strategy
        );
        self.core.set_state(SessionState::Reconfiguring);

        let result = match strategy {
            ReopenStrategy::QuickResume => self.quick_resume().map(|()| strategy),
            ReopenStrategy::LightReopen => self.light_reopen(producer, format, plan),
            ReopenStrategy::FullReopen => self
                .full_reopen(producer, format, plan)
                .map(|()| ReopenStrategy::FullReopen),
        };

        match result {
            Ok(ran) => {
                match ran {
                    ReopenStrategy::QuickResume => self.counters.quick_resumes += 1,
                    ReopenStrategy::LightReopen => self.counters.light_reopens += 1,
                    ReopenStrategy::FullReopen => self.counters.full_reopens += 1,
                }
                self.core.set_state(SessionState::Streaming);
                Ok(ran)
            }
            // 重配置没能开始，环和流都没动过
            Err(e @ SessionError::Coordinator(_)) if self.streaming => {
                log::error!("Format change aborted, keeping {}: {}", active.source, e);
                self.core.set_state(SessionState::Streaming);
                Err(e)
            }
            Err(e) => {
                log::error!("Format change failed, closing session: {}", e);
                self.abandon();
                Err(e)
            }
        }
    }

    fn quick_resume(&mut self) -> Result<(), SessionError> {
        let Some(active) = self.active else {
            return Ok(());
        };
        let core = Arc::clone(&self.core);
        let mut guard = core.coordinator.reconfigure()?;
        guard.reset_ring();
        // 重新发布同一快照：生产者据代计数重建暂存管线
        guard.publish(Some(FormatSnapshot::new(active.source, active.plan.wire, active.plan.kernel)));

        let wire = active.plan.wire;
        let prefill = self.config.prefill_bytes(
            wire.bytes_per_second(),
            wire.bytes_per_frame(),
            guard.ring().capacity(),
        );
        self.core.gate.arm(prefill, Duration::ZERO);
        drop(guard);

        log::info!("Quick resume: ring cleared, prefill {} bytes", prefill);
        Ok(())
    }

    fn light_reopen(
        &mut self,
        producer: &mut ProducerHandle,
        format: SourceFormat,
        plan: StreamPlan,
    ) -> Result<ReopenStrategy, SessionError> {
        // resize 会清空游标：旧格式已接受的数据先播完
        if self.streaming && !producer.wait_drained(self.config.flush_timeout) {
            log::warn!(
                "Ring not drained within {:?} before renegotiation, dropping the rest",
                self.config.flush_timeout
            );
        }

        let core = Arc::clone(&self.core);
        let mut guard = core.coordinator.reconfigure()?;

        let transport = &mut self.transport;
        let (result, retries) = with_retry(self.config.reconfigure_retry, "Renegotiation", || {
            transport.renegotiate(&plan.wire)
        });
        self.core.add_retries(retries);

        match result {
            Ok(()) => {
                let stabilization = self.config.stabilization_for(plan.wire.bytes_per_second());
                self.install(&mut guard, format, plan, stabilization);
                Ok(ReopenStrategy::LightReopen)
            }
            Err(e) => {
                drop(guard);
                log::warn!("Renegotiation failed ({}), escalating to full reopen", e);
                self.counters.escalations += 1;
                self.full_reopen(producer, format, plan)?;
                Ok(ReopenStrategy::FullReopen)
            }
        }
    }

    fn full_reopen(
        &mut self,
        producer: &mut ProducerHandle,
        format: SourceFormat,
        plan: StreamPlan,
    ) -> Result<(), SessionError> {
        let started = Instant::now();
        let old = self.active;
        let old_multiplier = old.map_or(1, |a| a.source.rate_multiplier());
        let settle = self.config.settle_delay * old_multiplier.max(format.rate_multiplier());

        // 1. 旧格式静音把 transport 侧已接受的数据推出去
        let silence = self.config.flush_silence * old_multiplier;
        let mut flushed = 0;
        if let (Some(old), true) = (old, self.streaming) {
            flushed = producer.push_silence(bytes_for(&old.plan.wire, silence));
            if !producer.wait_drained(self.config.flush_timeout) {
                log::warn!(
                    "Flush silence not drained within {:?}, continuing",
                    self.config.flush_timeout
                );
            }
        }

        // 2. 停止回调
        self.stop_transport()?;

        // 3. 确认没有在途访问后释放
        let core = Arc::clone(&self.core);
        let guard = core.coordinator.reconfigure()?;
        self.release_transport()?;
        drop(guard);

        // 4. 按数据率放大的等待
        thread::sleep(settle);

        // 5. 重新获取
        self.connect(&plan.wire)?;
        let mut guard = core.coordinator.reconfigure()?;
        let stabilization = self.config.stabilization_for(plan.wire.bytes_per_second());
        self.install(&mut guard, format, plan, stabilization);
        drop(guard);
        self.start()?;

        let record = FlushRecord {
            multiplier: old_multiplier,
            silence,
            bytes: flushed,
            settle,
            elapsed: started.elapsed(),
        };
        log::info!(
            "Full reopen done in {:?}: flushed {} bytes ({:?} at x{}), settled {:?}",
            record.elapsed,
            record.bytes,
            record.silence,
            record.multiplier,
            record.settle
        );
        self.last_flush = Some(record);
        Ok(())
    }

    /// 关闭会话；重复调用无副作用
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed && self.workers.is_empty() && !self.connected {
            return Ok(());
        }
        self.core.set_state(SessionState::Closing);
        log::info!("Closing transport session");

        // 1. 通知生产者
        self.core.cancel();

        // 2. 等待生产者线程退出
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Producer worker panicked");
            }
        }

        // 3-5. 停止、静默、释放
        let result = self.teardown();

        if let Some(mut drain) = self.diag_drain.take() {
            drain.shutdown();
        }
        self.core.set_state(SessionState::Closed);
        log::info!("Transport session closed");
        result
    }

    /// 出错后的收尾：不 join 生产者
    fn abandon(&mut self) {
        self.core.set_state(SessionState::Closing);
        if let Err(e) = self.teardown() {
            log::error!("Teardown after failure incomplete: {}", e);
        }
        self.core.set_state(SessionState::Closed);
    }

    fn teardown(&mut self) -> Result<(), SessionError> {
        // stop 失败时回调可能仍在进行，不能释放
        self.stop_transport()?;

        let core = Arc::clone(&self.core);
        let mut guard = core.coordinator.reconfigure()?;
        let released = self.release_transport();
        guard.reset_ring();
        guard.publish(None);
        drop(guard);

        self.active = None;
        self.core.set_mode(None);
        released
    }

    fn ensure_diag_drain(&mut self) -> Result<(), SessionError> {
        if self.diag_drain.is_none() {
            let drain = DiagDrain::spawn(Arc::clone(&self.core.diag), DIAG_DRAIN_INTERVAL)
                .map_err(|source| SessionError::Thread {
                    name: "diag-drain",
                    source,
                })?;
            self.diag_drain = Some(drain);
        }
        Ok(())
    }

    fn query_capabilities(&mut self) -> Result<CapabilitySet, SessionError> {
        let transport = &mut self.transport;
        let (result, retries) = with_retry(self.config.open_retry, "Capability query", || {
            transport.query_capabilities()
        });
        self.core.add_retries(retries);
        let caps = result.map_err(SessionError::transport("capability query"))?;
        self.capabilities = Some(caps);
        Ok(caps)
    }

    fn connect(&mut self, wire: &WireFormat) -> Result<(), SessionError> {
        let transport = &mut self.transport;
        let (result, retries) = with_retry(self.config.open_retry, "Connect", || transport.connect(wire));
        self.core.add_retries(retries);
        result.map_err(SessionError::transport("connect"))?;
        self.connected = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SessionError> {
        let consumer = ConsumerEndpoint::new(Arc::clone(&self.core));
        self.transport
            .start(Box::new(consumer))
            .map_err(SessionError::transport("start"))?;
        self.streaming = true;
        Ok(())
    }

    fn stop_transport(&mut self) -> Result<(), SessionError> {
        if self.streaming {
            self.transport
                .stop()
                .map_err(SessionError::transport("stop"))?;
            self.streaming = false;
        }
        Ok(())
    }

    fn release_transport(&mut self) -> Result<(), SessionError> {
        if self.connected {
            self.transport
                .release()
                .map_err(SessionError::transport("release"))?;
            self.connected = false;
        }
        Ok(())
    }

    /// 在重配置守卫下装入新格式：调整环、发布快照、布置门控
    fn install(
        &mut self,
        guard: &mut ReconfigureGuard<'_>,
        source: SourceFormat,
        plan: StreamPlan,
        stabilization: Duration,
    ) {
        let wire = plan.wire;
        let cycle_frames = self.transport.cycle_frames();
        let cycle_bytes = cycle_frames as usize * wire.bytes_per_frame();
        let capacity = guard.resize_ring(self.config.ring_bytes(wire.bytes_per_second(), cycle_bytes));
        if self.config.lock_memory && !guard.ring().is_memory_locked() && !guard.ring_mut().lock_memory() {
            log::debug!("Ring buffer stays pageable");
        }
        guard.publish(Some(FormatSnapshot::new(source, wire, plan.kernel)));

        let prefill = self
            .config
            .prefill_bytes(wire.bytes_per_second(), wire.bytes_per_frame(), capacity);
        self.core.gate.arm(prefill, stabilization);
        self.core.set_mode(Some(plan.mode()));
        self.core
            .set_geometry(capacity, cycle_frames, wire.frames_per_second());
        self.active = Some(ActiveFormat { source, plan });

        log::info!(
            "Streaming {} as {} via {} (ring {} bytes, prefill {} bytes, stabilization {:?})",
            source,
            wire,
            plan.mode(),
            capacity,
            prefill,
            stabilization
        );
    }
}

impl<T: Transport> Drop for TransportSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Transport session closed with error: {}", e);
        }
    }
}

/// `duration` 时长对应的线上字节数
fn bytes_for(wire: &WireFormat, duration: Duration) -> usize {
    (wire.bytes_per_second() as u128 * duration.as_nanos() / 1_000_000_000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Clocking, SimEvent, SimulatedTransport, TransportError};

    fn manual_session() -> (TransportSession<SimulatedTransport>, crate::transport::SimHandle) {
        let sim = SimulatedTransport::new(CapabilitySet::full(), 64, Clocking::Manual);
        let handle = sim.handle();
        (TransportSession::new(sim, SessionConfig::fast()), handle)
    }

    #[test]
    fn test_open_sizes_ring_for_fill_time() {
        let (mut session, _) = manual_session();
        session.open(SourceFormat::pcm(44_100, 2, 16)).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let diag = session.diagnostics();
        // 100ms × 176 400 B/s 向上取整到 2 的幂
        assert_eq!(diag.ring_capacity, 32_768);
        assert!(diag.mode.is_some());
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_open_twice_is_invalid() {
        let (mut session, _) = manual_session();
        session.open(SourceFormat::pcm(48_000, 2, 16)).unwrap();
        assert!(matches!(
            session.open(SourceFormat::pcm(48_000, 2, 16)),
            Err(SessionError::InvalidState {
                state: SessionState::Streaming,
                ..
            })
        ));
    }

    #[test]
    fn test_change_format_requires_streaming() {
        let (mut session, _) = manual_session();
        let mut producer = session.take_producer().unwrap();
        assert!(session.take_producer().is_none());
        assert!(matches!(
            session.change_format(&mut producer, SourceFormat::pcm(48_000, 2, 16)),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_foreign_producer_rejected() {
        let (mut a, _) = manual_session();
        let (mut b, _) = manual_session();
        a.open(SourceFormat::pcm(48_000, 2, 16)).unwrap();
        let mut foreign = b.take_producer().unwrap();
        assert!(matches!(
            a.change_format(&mut foreign, SourceFormat::pcm(48_000, 2, 24)),
            Err(SessionError::ForeignProducer)
        ));
    }

    #[test]
    fn test_open_failure_releases_and_closes() {
        let (mut session, handle) = manual_session();
        handle.fail_next_connects(1, TransportError::Rejected("busy elsewhere".into()));
        assert!(session.open(SourceFormat::pcm(48_000, 2, 16)).is_err());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!handle.is_connected());

        session.open(SourceFormat::pcm(48_000, 2, 16)).unwrap();
        assert!(handle.is_streaming());
    }

    #[test]
    fn test_close_is_idempotent_and_ordered() {
        let (mut session, handle) = manual_session();
        session.open(SourceFormat::pcm(48_000, 2, 16)).unwrap();
        session.close().unwrap();
        session.close().unwrap();

        let events = handle.events();
        let stopped = events.iter().position(|e| *e == SimEvent::Stopped).unwrap();
        let released = events
            .iter()
            .position(|e| matches!(e, SimEvent::Released { .. }))
            .unwrap();
        assert!(stopped < released);
        assert_eq!(
            events[released],
            SimEvent::Released {
                in_flight: 0,
                streaming: false
            }
        );
        assert_eq!(events.iter().filter(|e| matches!(e, SimEvent::Released { .. })).count(), 1);
    }

    #[test]
    fn test_bytes_for_duration() {
        let wire = WireFormat {
            sample_rate: 2_822_400,
            channels: 2,
            bytes_per_sample: 4,
            kind: crate::audio::format::WireKind::Dsd {
                bit_order: crate::audio::format::BitOrder::MsbFirst,
                endianness: crate::audio::format::Endianness::Big,
            },
        };
        assert_eq!(bytes_for(&wire, Duration::from_millis(100)), 70_560);
    }
}

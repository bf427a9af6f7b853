//! 热路径诊断
//!
//! 消费者回调里不能写日志：事件先压入有界无锁队列，
//! 由低优先级的 diag-drain 线程转成 log 记录。队列满时丢弃并计数。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// 热路径事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagEvent {
    /// pop 不足，`filled` 之后为静音
    Underrun {
        cycle: u64,
        requested: usize,
        filled: usize,
    },
    /// 重配置进行中，本周期输出静音
    ReconfigureSilence { cycle: u64 },
    /// 门控结束，开始出声
    GateOpened { cycle: u64, available: usize },
    /// 生产者背压超时，只接受了部分数据
    BackpressureTimeout { requested: usize, accepted: usize },
}

/// 事件队列（生产者/消费者共享）
pub struct DiagQueue {
    queue: ArrayQueue<DiagEvent>,
    dropped: AtomicU64,
}

impl DiagQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// 非阻塞；队列满时丢弃
    #[inline]
    pub fn push(&self, event: DiagEvent) {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<DiagEvent> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn emit(event: DiagEvent) {
    match event {
        DiagEvent::Underrun {
            cycle,
            requested,
            filled,
        } => log::warn!(
            "Underrun at cycle {}: {} of {} bytes, rest filled with silence",
            cycle,
            filled,
            requested
        ),
        DiagEvent::ReconfigureSilence { cycle } => {
            log::debug!("Cycle {} rendered silence during reconfiguration", cycle)
        }
        DiagEvent::GateOpened { cycle, available } => {
            log::info!("Playback released at cycle {} ({} bytes buffered)", cycle, available)
        }
        DiagEvent::BackpressureTimeout {
            requested,
            accepted,
        } => log::warn!(
            "Backpressure timeout: accepted {} of {} bytes",
            accepted,
            requested
        ),
    }
}

/// 把队列里现有的事件全部写入日志，返回条数
pub fn drain_into_log(queue: &DiagQueue) -> usize {
    let mut n = 0;
    while let Some(event) = queue.pop() {
        emit(event);
        n += 1;
    }
    n
}

/// 后台排空线程
pub struct DiagDrain {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DiagDrain {
    /// 启动 diag-drain 线程，每 `interval` 排空一次
    pub fn spawn(queue: Arc<DiagQueue>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("diag-drain".into())
            .spawn(move || {
                if !crate::rt::lower_current_thread() {
                    log::debug!("Diagnostics thread keeps default priority");
                }
                let mut reported_drops = 0;
                loop {
                    drain_into_log(&queue);

                    let dropped = queue.dropped();
                    if dropped != reported_drops {
                        log::warn!("{} diagnostic events dropped (queue full)", dropped - reported_drops);
                        reported_drops = dropped;
                    }

                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    thread::park_timeout(interval);
                }
                drain_into_log(&queue);
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// 停止并等待线程退出（退出前排空剩余事件）
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Diagnostics thread panicked");
            }
        }
    }
}

impl Drop for DiagDrain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! 访问守卫与重配置守卫
//!
//! 协调器拥有环形缓冲区和快照发布点，只能经守卫访问：
//! - AccessGuard：每次 push/pop 进入。标志已置位时直接放弃，不碰计数；
//!   否则先递增活跃计数，再复查标志，已置位则回退
//! - ReconfigureGuard：置位标志，自旋等待活跃计数归零，
//!   之后独占环与快照；drop 时清除标志
//!
//! 入口递增与写者读计数都用 SeqCst，保证两边至少有一方看到对方。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};
use thiserror::Error;

use super::snapshot::{CachedSnapshot, FormatSnapshot, SnapshotCell};
use crate::audio::ring_buffer::RingBuffer;
use crate::config::DrainPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("in-flight ring access did not drain within {waited:?} ({active} still active)")]
    DrainTimeout { waited: Duration, active: usize },

    #[error("another reconfiguration is already in progress")]
    Busy,
}

pub struct Coordinator {
    ring: UnsafeCell<RingBuffer>,
    snapshot: SnapshotCell,
    active: CachePadded<AtomicUsize>,
    reconfiguring: CachePadded<AtomicBool>,
    policy: DrainPolicy,
    drain_timeouts: AtomicU64,
}

// 环的可变访问只经 ReconfigureGuard，且此时没有 AccessGuard
unsafe impl Sync for Coordinator {}
unsafe impl Send for Coordinator {}

impl Coordinator {
    pub fn new(ring: RingBuffer, policy: DrainPolicy) -> Self {
        Self {
            ring: UnsafeCell::new(ring),
            snapshot: SnapshotCell::new(),
            active: CachePadded::new(AtomicUsize::new(0)),
            reconfiguring: CachePadded::new(AtomicBool::new(false)),
            policy,
            drain_timeouts: AtomicU64::new(0),
        }
    }

    /// 进入热路径。重配置进行中返回 None
    #[inline]
    pub fn try_access(&self) -> Option<AccessGuard<'_>> {
        if self.reconfiguring.load(Ordering::Acquire) {
            return None;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        if self.reconfiguring.load(Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(AccessGuard { coord: self })
    }

    /// 进入重配置，等待所有在途访问退出
    ///
    /// 超过软超时记录严重日志；超过硬上限则放弃，清除标志，
    /// 环保持原样
    pub fn reconfigure(&self) -> Result<ReconfigureGuard<'_>, CoordinatorError> {
        if self
            .reconfiguring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoordinatorError::Busy);
        }

        let start = Instant::now();
        let backoff = Backoff::new();
        let mut warned = false;

        loop {
            let active = self.active.load(Ordering::SeqCst);
            if active == 0 {
                break;
            }

            let waited = start.elapsed();
            if waited >= self.policy.hard_timeout {
                self.reconfiguring.store(false, Ordering::SeqCst);
                self.drain_timeouts.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "Reconfiguration aborted: {} ring accessors still active after {:?}",
                    active,
                    waited
                );
                return Err(CoordinatorError::DrainTimeout { waited, active });
            }
            if !warned && waited >= self.policy.soft_timeout {
                warned = true;
                log::error!(
                    "Ring accessors appear wedged: {} active after {:?}, still waiting",
                    active,
                    waited
                );
            }
            backoff.snooze();
        }

        Ok(ReconfigureGuard { coord: self })
    }

    /// 当前在途访问数
    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguring.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    pub fn drain_timeouts(&self) -> u64 {
        self.drain_timeouts.load(Ordering::Relaxed)
    }
}

/// 热路径访问权
pub struct AccessGuard<'a> {
    coord: &'a Coordinator,
}

impl AccessGuard<'_> {
    #[inline]
    pub fn ring(&self) -> &RingBuffer {
        unsafe { &*self.coord.ring.get() }
    }

    /// 代计数变化时刷新本地快照，返回是否刷新
    #[inline]
    pub fn refresh(&self, cache: &mut CachedSnapshot) -> bool {
        unsafe { self.coord.snapshot.refresh(cache) }
    }
}

impl Drop for AccessGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.coord.active.fetch_sub(1, Ordering::Release);
    }
}

/// 重配置独占权
pub struct ReconfigureGuard<'a> {
    coord: &'a Coordinator,
}

impl ReconfigureGuard<'_> {
    pub fn ring(&self) -> &RingBuffer {
        unsafe { &*self.coord.ring.get() }
    }

    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        unsafe { &mut *self.coord.ring.get() }
    }

    pub fn resize_ring(&mut self, min_capacity: usize) -> usize {
        let ring = self.ring_mut();
        ring.resize(min_capacity);
        ring.capacity()
    }

    pub fn reset_ring(&mut self) {
        self.ring_mut().reset();
    }

    /// 发布新快照（同时更新环的静音字节），返回新的代计数
    pub fn publish(&mut self, snapshot: Option<FormatSnapshot>) -> u64 {
        if let Some(s) = &snapshot {
            self.ring_mut().set_silence(s.silence);
        }
        unsafe { self.coord.snapshot.publish(snapshot) }
    }

    /// 在途访问数（持有期间恒为 0）
    pub fn active(&self) -> usize {
        self.coord.active()
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        self.coord.reconfiguring.store(false, Ordering::Release);
    }
}

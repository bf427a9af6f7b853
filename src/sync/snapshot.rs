//! 格式快照与代计数发布
//!
//! 写入只发生在 ReconfigureGuard 之下（此时没有任何 AccessGuard），
//! 写完所有字段后才递增代计数。读者只比较一次代计数，
//! 不一致时才复制整个快照。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::audio::format::{SourceFormat, WireFormat};
use crate::convert::{ConversionMode, Kernel};

/// 一个格式周期内不变的参数
#[derive(Clone, Copy, Debug)]
pub struct FormatSnapshot {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
    pub is_dsd: bool,
    pub mode: ConversionMode,
    /// 已按指令集选好的内核
    pub kernel: Kernel,
    pub source: SourceFormat,
    pub wire: WireFormat,
    pub silence: u8,
}

impl FormatSnapshot {
    pub fn new(source: SourceFormat, wire: WireFormat, kernel: Kernel) -> Self {
        Self {
            sample_rate: wire.sample_rate,
            channels: wire.channels,
            bytes_per_sample: wire.bytes_per_sample,
            is_dsd: wire.is_dsd(),
            mode: kernel.mode,
            kernel,
            source,
            wire,
            silence: wire.silence_byte(),
        }
    }

    #[inline]
    pub fn wire_frame_bytes(&self) -> usize {
        self.wire.bytes_per_frame()
    }
}

/// 发布点
pub struct SnapshotCell {
    generation: AtomicU64,
    value: UnsafeCell<Option<FormatSnapshot>>,
}

unsafe impl Sync for SnapshotCell {}

impl SnapshotCell {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            value: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 调用方必须持有重配置独占权
    pub(super) unsafe fn publish(&self, snapshot: Option<FormatSnapshot>) -> u64 {
        *self.value.get() = snapshot;
        self.generation.fetch_add(1, Ordering::Release) + 1
    }

    /// 代计数不一致时刷新缓存，返回是否刷新
    ///
    /// 调用方必须持有 AccessGuard
    #[inline]
    pub(super) unsafe fn refresh(&self, cache: &mut CachedSnapshot) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        if generation == cache.generation {
            return false;
        }
        cache.snapshot = *self.value.get();
        cache.generation = generation;
        true
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 线程本地的快照副本
#[derive(Clone, Copy, Debug, Default)]
pub struct CachedSnapshot {
    generation: u64,
    snapshot: Option<FormatSnapshot>,
}

impl CachedSnapshot {
    #[inline]
    pub fn get(&self) -> Option<&FormatSnapshot> {
        self.snapshot.as_ref()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

//! Lock-free Single-Producer Single-Consumer 字节环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：push/pop 不分配，只在 resize 时重新分配
//! - 缓存友好：读写游标各自独占一个 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 游标始终保存为 `[0, capacity)` 内的值：
//! - `available = (write - read) & mask`
//! - `free = capacity - available - 1`（保留一个字节区分满/空）
//!
//! push/pop 在回绕处拆成两段拷贝；不跨界时第二段长度为 0，
//! 不对长度做分支。
//!
//! resize/reset 需要 `&mut self`，只能在重配置守卫下拿到。

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 最小容量，保证 `free` 在空缓冲区时至少为 1
const MIN_CAPACITY: usize = 2;

/// pop 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopOutcome {
    /// 请求的字节全部来自缓冲区
    Complete,
    /// 只取到 `filled` 字节，其余已用静音填充
    Short { filled: usize },
    /// 缓冲区为空，整段都是静音
    Empty,
}

impl PopOutcome {
    /// 是否应计为一次欠载
    #[inline]
    pub fn is_underrun(self) -> bool {
        !matches!(self, Self::Complete)
    }

    /// 从缓冲区实际取出的字节数
    #[inline]
    pub fn filled(self, requested: usize) -> usize {
        match self {
            Self::Complete => requested,
            Self::Short { filled } => filled,
            Self::Empty => 0,
        }
    }
}

/// SPSC 无锁字节环形缓冲区
///
/// 内存布局保证：
/// - write_pos 和 read_pos 各自独占一个 cache line
/// - 可选 mlock 防止 page fault
///
/// 只允许一个线程调用 push/direct_write_region/commit_direct_write，
/// 一个线程调用 pop。
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: usize,
    /// 欠载时填充的字节
    silence: u8,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: bool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

fn alloc_storage(capacity: usize) -> Box<[UnsafeCell<u8>]> {
    (0..capacity).map(|_| UnsafeCell::new(0u8)).collect()
}

impl RingBuffer {
    /// 创建至少能容纳 `min_capacity` 字节的缓冲区（向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        let capacity = Self::round_capacity(min_capacity);
        Self {
            buffer: alloc_storage(capacity),
            capacity,
            mask: capacity - 1,
            silence: 0,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: false,
        }
    }

    /// 实际容量：不小于 n 的最小 2 的幂，下限为 2
    #[inline]
    pub fn round_capacity(n: usize) -> usize {
        n.max(MIN_CAPACITY).next_power_of_two()
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> 与 u8 布局相同
        self.buffer.as_ptr() as *mut u8
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 失败不致命，只记录日志。返回是否已锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.capacity;

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }

        self.memory_locked = false;
        log::debug!("Ring buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }

    /// 写入字节（生产者调用）
    ///
    /// 只写入能放下的部分，返回实际写入的字节数。wait-free
    #[inline]
    pub fn push(&self, data: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read) & self.mask;
        let free = self.capacity - used - 1;
        let n = data.len().min(free);

        let first = n.min(self.capacity - write);
        unsafe {
            let base = self.base_ptr();
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(write), first);
            ptr::copy_nonoverlapping(data.as_ptr().add(first), base, n - first);
        }

        self.write_pos
            .store((write + n) & self.mask, Ordering::Release);
        n
    }

    /// 读取恰好 `dest.len()` 字节（消费者调用）
    ///
    /// 数据不足时未填充的尾部写入静音字节。wait-free
    #[inline]
    pub fn pop(&self, dest: &mut [u8]) -> PopOutcome {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let available = write.wrapping_sub(read) & self.mask;
        let n = dest.len().min(available);

        let first = n.min(self.capacity - read);
        unsafe {
            let base = self.base_ptr();
            ptr::copy_nonoverlapping(base.add(read), dest.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(base, dest.as_mut_ptr().add(first), n - first);
        }
        dest[n..].fill(self.silence);

        self.read_pos.store((read + n) & self.mask, Ordering::Release);

        if n == dest.len() {
            PopOutcome::Complete
        } else if n == 0 {
            PopOutcome::Empty
        } else {
            PopOutcome::Short { filled: n }
        }
    }

    /// 零拷贝写入：返回从写游标开始、长度为 `needed` 的连续可写区域
    ///
    /// 区域跨越数组末尾或空间不足时返回 None。
    /// 写完后调用 `commit_direct_write`（生产者调用）
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn direct_write_region(&self, needed: usize) -> Option<&mut [u8]> {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read) & self.mask;
        let free = self.capacity - used - 1;
        if needed > free || needed > self.capacity - write {
            return None;
        }

        // [write, write + needed) 属于空闲区，消费者不会读到
        Some(unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(write), needed) })
    }

    /// 提交 `direct_write_region` 中已写入的 `len` 字节
    #[inline]
    pub fn commit_direct_write(&self, len: usize) {
        let write = self.write_pos.load(Ordering::Relaxed);
        debug_assert!(len <= self.free(), "commit past free space");
        debug_assert!(write + len <= self.capacity, "commit across wrap");
        self.write_pos
            .store((write + len) & self.mask, Ordering::Release);
    }

    /// 当前可读字节数
    #[inline]
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read) & self.mask
    }

    /// 当前可写字节数
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.available() - 1
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn mask(&self) -> usize {
        self.mask
    }

    #[inline]
    pub fn silence(&self) -> u8 {
        self.silence
    }

    /// 填充百分比（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available() as f64 / (self.capacity - 1) as f64
    }

    /// 设置欠载填充字节
    pub fn set_silence(&mut self, silence: u8) {
        self.silence = silence;
    }

    /// 丢弃所有内容，游标归零
    pub fn reset(&mut self) {
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
    }

    /// 调整容量（向上取整到 2 的幂）并重置游标
    ///
    /// 容量不变时不重新分配。原先锁定的内存会在新缓冲区上重新锁定
    pub fn resize(&mut self, min_capacity: usize) {
        let capacity = Self::round_capacity(min_capacity);
        if capacity != self.capacity {
            let relock = self.memory_locked;
            self.unlock_memory();
            self.buffer = alloc_storage(capacity);
            self.capacity = capacity;
            self.mask = capacity - 1;
            if relock {
                self.lock_memory();
            }
            log::debug!("Ring buffer resized to {} bytes", capacity);
        }
        self.reset();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

//! 单调时钟
//!
//! macOS 上直接读 mach_absolute_time，其它平台用进程内的 Instant 基准。
//! 门控截止时间、回调间隔统计和 RT 策略参数都以此为准

use std::sync::OnceLock;
use std::time::Duration;
#[cfg(not(target_os = "macos"))]
use std::time::Instant;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct mach_timebase_info_t {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut mach_timebase_info_t) -> i32;
    }
}

/// Mach timebase 信息（全局缓存，只初始化一次）
static TIMEBASE: OnceLock<TimebaseInfo> = OnceLock::new();

#[cfg(not(target_os = "macos"))]
static EPOCH: OnceLock<Instant> = OnceLock::new();

#[derive(Clone, Copy)]
struct TimebaseInfo {
    numer: u32,
    denom: u32,
}

impl TimebaseInfo {
    #[cfg(target_os = "macos")]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| {
            let mut info = mach::mach_timebase_info_t { numer: 0, denom: 0 };
            unsafe { mach::mach_timebase_info(&mut info) };
            TimebaseInfo {
                numer: info.numer,
                denom: info.denom,
            }
        })
    }

    // 非 macOS 的 tick 就是纳秒
    #[cfg(not(target_os = "macos"))]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| TimebaseInfo { numer: 1, denom: 1 })
    }
}

/// ticks → 纳秒
///
/// Apple Silicon 上 timebase 通常是 125/3
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let info = TimebaseInfo::get();
    (ticks as u128 * info.numer as u128 / info.denom as u128) as u64
}

/// 纳秒 → ticks，用于 THREAD_TIME_CONSTRAINT_POLICY 等需要 ticks 的 API
#[inline]
pub fn ns_to_ticks(ns: u64) -> u64 {
    let info = TimebaseInfo::get();
    (ns as u128 * info.denom as u128 / info.numer as u128) as u64
}

#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

#[cfg(not(target_os = "macos"))]
#[inline]
pub fn now_ticks() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    // 加 1 保证首次读数非零，0 在统计里表示“无时间戳”
    epoch.elapsed().as_nanos() as u64 + 1
}

/// 当前时间（纳秒，单调）
#[inline]
pub fn now_ns() -> u64 {
    ticks_to_ns(now_ticks())
}

/// `after` 之后的截止时刻（纳秒）
#[inline]
pub fn deadline_after(after: Duration) -> u64 {
    now_ns().saturating_add(after.as_nanos() as u64)
}

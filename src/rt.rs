//! 线程调度优先级
//!
//! - macOS: THREAD_TIME_CONSTRAINT_POLICY（不需要 root），失败回退到 nice 值
//! - Linux: SCHED_FIFO，没有权限时回退到负 nice 值
//!
//! 都不是致命错误，调用方只记录结果。

use std::time::Duration;

/// 提升结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOutcome {
    /// Mach 时间约束策略
    TimeConstraint { period: Duration },
    /// POSIX 实时调度
    Fifo { priority: i32 },
    /// 只调整了 nice 值
    Nice(i32),
    /// 保持默认调度
    Unchanged,
}

impl PriorityOutcome {
    pub fn is_realtime(self) -> bool {
        matches!(self, Self::TimeConstraint { .. } | Self::Fifo { .. })
    }
}

/// 回退时使用的 nice 值
#[cfg(any(target_os = "macos", target_os = "linux"))]
const FALLBACK_NICE: i32 = -10;

/// 诊断等后台线程使用的 nice 值
#[cfg(target_os = "linux")]
const BACKGROUND_NICE: i32 = 10;

/// 把当前线程提升为实时调度
///
/// `period`: 线程的工作周期（如 transport 回调周期），不低于 1ms。
/// computation 取周期的一半，constraint 等于周期
#[cfg(target_os = "macos")]
pub fn promote_current_thread(period: Duration) -> PriorityOutcome {
    use crate::audio::timing::ns_to_ticks;

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: u32,
    }

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    extern "C" {
        fn pthread_mach_thread_np(thread: libc::pthread_t) -> u32;
        fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *const std::ffi::c_void,
            count: u32,
        ) -> i32;
    }

    let period_ns = (period.as_nanos() as u64).max(1_000_000);
    let computation_ns = period_ns / 2;

    let period_ticks = ns_to_ticks(period_ns) as u32;
    let policy = ThreadTimeConstraintPolicy {
        period: period_ticks,
        computation: ns_to_ticks(computation_ns) as u32,
        constraint: period_ticks,
        preemptible: 1,
    };

    let result = unsafe {
        let thread = pthread_mach_thread_np(libc::pthread_self());
        thread_policy_set(
            thread,
            THREAD_TIME_CONSTRAINT_POLICY,
            &policy as *const _ as *const std::ffi::c_void,
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };

    if result == 0 {
        PriorityOutcome::TimeConstraint {
            period: Duration::from_nanos(period_ns),
        }
    } else if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, FALLBACK_NICE) } == 0 {
        PriorityOutcome::Nice(FALLBACK_NICE)
    } else {
        PriorityOutcome::Unchanged
    }
}

#[cfg(target_os = "linux")]
pub fn promote_current_thread(_period: Duration) -> PriorityOutcome {
    let priority = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) } + 10;
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let result =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result == 0 {
        return PriorityOutcome::Fifo { priority };
    }

    if set_thread_nice(FALLBACK_NICE) {
        PriorityOutcome::Nice(FALLBACK_NICE)
    } else {
        PriorityOutcome::Unchanged
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn promote_current_thread(_period: Duration) -> PriorityOutcome {
    PriorityOutcome::Unchanged
}

/// 降低当前线程优先级（诊断输出等后台线程）
#[cfg(target_os = "macos")]
pub fn lower_current_thread() -> bool {
    // QOS_CLASS_UTILITY
    const QOS_CLASS_UTILITY: u32 = 0x11;

    extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
    }

    unsafe { pthread_set_qos_class_self_np(QOS_CLASS_UTILITY, 0) == 0 }
}

#[cfg(target_os = "linux")]
pub fn lower_current_thread() -> bool {
    set_thread_nice(BACKGROUND_NICE)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn lower_current_thread() -> bool {
    false
}

/// Linux 上 setpriority 作用于 tid 时只影响该线程
#[cfg(target_os = "linux")]
fn set_thread_nice(nice: i32) -> bool {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_is_non_fatal() {
        let outcome = std::thread::spawn(|| promote_current_thread(Duration::from_millis(10)))
            .join()
            .unwrap();
        // 无权限时只会降级，不会失败
        let _ = outcome.is_realtime();
    }

    #[test]
    fn test_lower_in_worker_thread() {
        std::thread::spawn(lower_current_thread).join().unwrap();
    }
}

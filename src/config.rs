//! 会话配置
//!
//! 全部是带 Default 的普通结构体，CLI 参数映射到这里

use std::time::Duration;

/// 有界重试：固定间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

/// 重配置等待在途访问退出的时限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// 超过后记录严重日志，继续等待
    pub soft_timeout: Duration,
    /// 超过后放弃本次重配置
    pub hard_timeout: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            soft_timeout: Duration::from_millis(50),
            hard_timeout: Duration::from_secs(2),
        }
    }
}

/// 传输会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 环形缓冲区目标填充时长（与采样率无关）
    pub target_fill: Duration,
    /// 开始出声前需要的预填充比例（相对 target_fill）
    pub prefill_ratio: f64,
    /// 连接后的稳定延迟基准（按 176.4 kB/s 计），随带宽线性放大
    pub stabilization: Duration,
    /// 稳定延迟上限
    pub max_stabilization: Duration,
    /// 完全重开时冲刷的静音时长基准（乘以速率倍数）
    pub flush_silence: Duration,
    /// 释放后重新获取前的等待基准（乘以速率倍数）
    pub settle_delay: Duration,
    /// 等待冲刷静音播完的上限
    pub flush_timeout: Duration,
    /// 首次打开 / 完全重开时的连接重试
    pub open_retry: RetryPolicy,
    /// 轻量重开时的重新协商重试
    pub reconfigure_retry: RetryPolicy,
    pub drain: DrainPolicy,
    /// 背压时单次等待的上限
    pub backpressure_wait: Duration,
    /// 背压总等待上限，超过后返回部分写入
    pub backpressure_timeout: Duration,
    /// 单次暂存的最大帧数
    pub scratch_frames: usize,
    /// 24-bit 对齐检测的超时（音频时长）
    pub alignment_timeout: Duration,
    /// 诊断队列容量
    pub diag_capacity: usize,
    /// mlock 环形缓冲区
    pub lock_memory: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_fill: Duration::from_millis(500),
            prefill_ratio: 0.5,
            stabilization: Duration::from_millis(200),
            max_stabilization: Duration::from_secs(2),
            flush_silence: Duration::from_millis(100),
            settle_delay: Duration::from_millis(50),
            flush_timeout: Duration::from_secs(2),
            open_retry: RetryPolicy::new(5, Duration::from_millis(200)),
            reconfigure_retry: RetryPolicy::new(3, Duration::from_millis(20)),
            drain: DrainPolicy::default(),
            backpressure_wait: Duration::from_millis(2),
            backpressure_timeout: Duration::from_millis(100),
            scratch_frames: 4096,
            alignment_timeout: Duration::from_secs(2),
            diag_capacity: 1024,
            lock_memory: false,
        }
    }
}

/// 以 CD 码率为 1 倍
pub const REFERENCE_BYTES_PER_SECOND: u64 = 176_400;

impl SessionConfig {
    /// 测试/仿真用：所有等待缩短
    pub fn fast() -> Self {
        Self {
            target_fill: Duration::from_millis(100),
            stabilization: Duration::from_millis(5),
            max_stabilization: Duration::from_millis(50),
            flush_silence: Duration::from_millis(20),
            settle_delay: Duration::from_millis(5),
            flush_timeout: Duration::from_millis(500),
            open_retry: RetryPolicy::new(3, Duration::from_millis(5)),
            reconfigure_retry: RetryPolicy::new(2, Duration::from_millis(2)),
            drain: DrainPolicy {
                soft_timeout: Duration::from_millis(20),
                hard_timeout: Duration::from_millis(500),
            },
            backpressure_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// 环形缓冲区字节数：目标填充时长 × 码率，至少两个周期
    pub fn ring_bytes(&self, bytes_per_second: u64, cycle_bytes: usize) -> usize {
        let target = (bytes_per_second as f64 * self.target_fill.as_secs_f64()).ceil() as usize;
        target.max(cycle_bytes * 2)
    }

    /// 预填充字节数，对齐到整帧
    ///
    /// 用未取整的目标字节计算，填充时长不随容量取整变化
    pub fn prefill_bytes(&self, bytes_per_second: u64, frame_bytes: usize, capacity: usize) -> usize {
        let target = bytes_per_second as f64 * self.target_fill.as_secs_f64();
        let raw = (target * self.prefill_ratio.clamp(0.0, 1.0)) as usize;
        let frame_bytes = frame_bytes.max(1);
        let aligned = raw / frame_bytes * frame_bytes;
        aligned.min(capacity.saturating_sub(1) / frame_bytes * frame_bytes)
    }

    /// 按带宽放大的稳定延迟
    pub fn stabilization_for(&self, bytes_per_second: u64) -> Duration {
        let scale = (bytes_per_second as f64 / REFERENCE_BYTES_PER_SECOND as f64).max(1.0);
        let ns = (self.stabilization.as_nanos() as f64 * scale).round() as u64;
        Duration::from_nanos(ns).min(self.max_stabilization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_time_constant_across_rates() {
        let cfg = SessionConfig::default();
        for bps in [176_400u64, 384_000, 1_411_200, 705_600] {
            let bytes = cfg.ring_bytes(bps, 512);
            let secs = bytes as f64 / bps as f64;
            assert!((secs - 0.5).abs() < 0.001, "bps={} secs={}", bps, secs);
        }
    }

    #[test]
    fn test_prefill_aligned_to_frames() {
        let cfg = SessionConfig::default();
        // 44.1k/24bit/stereo: 264_600 B/s，半秒的一半
        let prefill = cfg.prefill_bytes(264_600, 6, 262_144);
        assert_eq!(prefill % 6, 0);
        assert_eq!(prefill, 66_150);
    }

    #[test]
    fn test_stabilization_scaling() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.stabilization_for(88_200), Duration::from_millis(200));
        assert_eq!(cfg.stabilization_for(176_400), Duration::from_millis(200));
        assert_eq!(cfg.stabilization_for(352_800), Duration::from_millis(400));
        // DSD256 被上限截断
        assert_eq!(cfg.stabilization_for(2_822_400), Duration::from_secs(2));
    }
}

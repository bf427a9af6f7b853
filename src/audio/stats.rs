//! 播放统计模块
//!
//! 在消费者回调中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::timing::{now_ticks, ticks_to_ns};

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const SAMPLE_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct PlaybackStats {
    callback_count: AtomicU64,
    last_sampled_ticks: AtomicU64,

    // 存储 interval（单位：ticks，后处理时转换）
    interval_buffer: Box<[AtomicU64; SAMPLE_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 水位，单位字节
    water_level_buffer: Box<[AtomicUsize; SAMPLE_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    /// 门控期间（预填充/稳定延迟）输出静音的回调数
    gated_count: AtomicU64,

    bytes_played: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            last_sampled_ticks: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            gated_count: AtomicU64::new(0),
            bytes_played: AtomicU64::new(0),
        }
    }

    /// 在 render callback 内调用
    ///
    /// `host_time`: transport 给出的时间戳（ticks），为 0 时回退到 now_ticks()。
    /// `water_level`: 当前环形缓冲区可读字节数，只在采样点记录
    #[inline]
    pub fn on_callback(&self, water_level: usize, host_time: u64) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let now = if host_time > 0 { host_time } else { now_ticks() };
            let last = self.last_sampled_ticks.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last);
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % SAMPLE_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }

            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % SAMPLE_BUFFER_SIZE;
            self.water_level_buffer[idx].store(water_level, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gated(&self) {
        self.gated_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_played(&self, bytes: u64) {
        self.bytes_played.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gated_count(&self) -> u64 {
        self.gated_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_played(&self) -> u64 {
        self.bytes_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `cycle_frames`/`frames_per_second` 用于计算期望的回调间隔
    pub fn report(&self, cycle_frames: u32, frames_per_second: u32) -> StatsReport {
        let expected_interval_ns = if frames_per_second > 0 {
            (cycle_frames as u64 * 1_000_000_000) / frames_per_second as u64
        } else {
            0
        };
        let expected_sampled_interval_ns = expected_interval_ns * SAMPLE_INTERVAL;

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&ticks| ticks > 0)
            .map(ticks_to_ns)
            .collect();

        let water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&level| level > 0)
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats {
                min_ns: 0,
                max_ns: 0,
                avg_ns: 0,
            },
        };

        let water_stats = WaterLevelStats {
            min: water_levels.iter().copied().min().unwrap_or(0),
            max: water_levels.iter().copied().max().unwrap_or(0),
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            water_stats,
            underrun_count: self.underrun_count(),
            gated_count: self.gated_count(),
            bytes_played: self.bytes_played(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.last_sampled_ticks.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.gated_count.store(0, Ordering::Relaxed);
        self.bytes_played.store(0, Ordering::Relaxed);

        for i in 0..SAMPLE_BUFFER_SIZE {
            self.interval_buffer[i].store(0, Ordering::Relaxed);
            self.water_level_buffer[i].store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub gated_count: u64,
    pub bytes_played: u64,
}

#[derive(Debug)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Transport Statistics")?;
        writeln!(f, "====================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(
            f,
            "Stats sample interval: every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Callback Timing (per {} callbacks):",
            self.sample_interval
        )?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(
            f,
            "    Min: {:.2} ms",
            self.interval_stats.min_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Max: {:.2} ms",
            self.interval_stats.max_ns as f64 / 1_000_000.0
        )?;
        writeln!(
            f,
            "    Avg: {:.2} ms",
            self.interval_stats.avg_ns as f64 / 1_000_000.0
        )?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            jitter_ns as f64 / 1_000_000.0,
            jitter_pct
        )?;
        writeln!(f)?;

        writeln!(f, "Ring Buffer Water Level:")?;
        writeln!(f, "  Min: {} bytes", self.water_stats.min)?;
        writeln!(f, "  Max: {} bytes", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Gated callbacks: {}", self.gated_count)?;
        writeln!(f, "Bytes played: {}", self.bytes_played)?;

        Ok(())
    }
}

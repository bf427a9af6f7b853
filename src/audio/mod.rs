//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 字节传递
//! - Format: 源格式、线上格式、格式类别
//! - Cadence: 整数帧节拍
//! - Timing: 单调时钟
//! - Stats: 播放统计

pub mod cadence;
pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use cadence::FrameCadence;
pub use format::{
    BitOrder, ClockFamily, Endianness, FormatClass, SampleEncoding, SampleLayout, SourceFormat,
    StreamKind, WireFormat, WireKind,
};
pub use ring_buffer::{PopOutcome, RingBuffer};
pub use stats::{PlaybackStats, StatsReport};

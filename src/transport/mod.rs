//! Transport 抽象
//!
//! transport 在自己的线程上按硬件节拍拉取数据：
//! - `RenderSource::render` 是唯一的回调，缓冲区由调用方分配
//! - `Transport` 描述连接生命周期：查询能力、连接、重新协商、启动、停止、释放
//!
//! `stop` 返回之后不能再有 render 调用正在进行或将要发生；
//! 会话依赖这一点在释放前完成静默。

pub mod simulated;

use thiserror::Error;

use crate::audio::format::{BitOrder, Endianness, WireFormat, WireKind};

pub use simulated::{Clocking, Pace, SimEvent, SimHandle, SimulatedTransport};

/// 一次拉取请求
pub struct RenderRequest<'a> {
    /// 必须恰好写满
    pub buffer: &'a mut [u8],
    /// transport 的周期序号
    pub cycle: u64,
    /// 硬件时间戳（ticks），未知时为 0
    pub host_time: u64,
}

/// transport 回调
///
/// 不能阻塞、分配或无界循环，数据不足时写静音
pub trait RenderSource: Send {
    fn render(&mut self, request: &mut RenderRequest<'_>);
}

/// transport 支持的格式（位掩码）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub pcm_formats: u32,
    pub dsd_formats: u32,
    /// 第 n-1 位表示支持 n 声道
    pub channel_mask: u32,
    pub max_pcm_rate: u32,
    pub max_dsd_rate: u32,
}

impl CapabilitySet {
    pub const PCM_S16: u32 = 1 << 0;
    pub const PCM_S24: u32 = 1 << 1;
    pub const PCM_S32: u32 = 1 << 2;
    pub const PCM_F32: u32 = 1 << 3;

    pub const DSD_MSB_BIG: u32 = 1 << 0;
    pub const DSD_MSB_LITTLE: u32 = 1 << 1;
    pub const DSD_LSB_BIG: u32 = 1 << 2;
    pub const DSD_LSB_LITTLE: u32 = 1 << 3;

    /// 立体声、全部格式
    pub fn full() -> Self {
        Self {
            pcm_formats: Self::PCM_S16 | Self::PCM_S24 | Self::PCM_S32 | Self::PCM_F32,
            dsd_formats: Self::DSD_MSB_BIG
                | Self::DSD_MSB_LITTLE
                | Self::DSD_LSB_BIG
                | Self::DSD_LSB_LITTLE,
            channel_mask: 0b11,
            max_pcm_rate: 384_000,
            max_dsd_rate: 2_822_400 * 4,
        }
    }

    #[inline]
    pub fn supports_channels(&self, channels: u16) -> bool {
        (1..=32).contains(&channels) && self.channel_mask & (1 << (channels - 1)) != 0
    }

    /// PCM 样本位
    pub fn pcm_bit(bytes_per_sample: u16, float: bool) -> Option<u32> {
        match (bytes_per_sample, float) {
            (2, false) => Some(Self::PCM_S16),
            (3, false) => Some(Self::PCM_S24),
            (4, false) => Some(Self::PCM_S32),
            (4, true) => Some(Self::PCM_F32),
            _ => None,
        }
    }

    pub fn dsd_bit(bit_order: BitOrder, endianness: Endianness) -> u32 {
        match (bit_order, endianness) {
            (BitOrder::MsbFirst, Endianness::Big) => Self::DSD_MSB_BIG,
            (BitOrder::MsbFirst, Endianness::Little) => Self::DSD_MSB_LITTLE,
            (BitOrder::LsbFirst, Endianness::Big) => Self::DSD_LSB_BIG,
            (BitOrder::LsbFirst, Endianness::Little) => Self::DSD_LSB_LITTLE,
        }
    }

    /// 完整检查一个线上格式
    pub fn supports(&self, wire: &WireFormat) -> bool {
        if !self.supports_channels(wire.channels) {
            return false;
        }
        match wire.kind {
            WireKind::Pcm { float } => {
                wire.sample_rate <= self.max_pcm_rate
                    && Self::pcm_bit(wire.bytes_per_sample, float)
                        .is_some_and(|bit| self.pcm_formats & bit != 0)
            }
            WireKind::Dsd {
                bit_order,
                endianness,
            } => {
                wire.bytes_per_sample == 4
                    && wire.sample_rate <= self.max_dsd_rate
                    && self.dsd_formats & Self::dsd_bit(bit_order, endianness) != 0
            }
        }
    }
}

/// Transport 错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport busy")]
    Busy,

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("format rejected by transport: {0}")]
    Rejected(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("transport already streaming")]
    AlreadyStreaming,

    #[error("transport still streaming")]
    StillStreaming,

    #[error("transport failure: {0}")]
    Failure(String),
}

impl TransportError {
    /// 是否值得按重试策略再试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Unavailable(_))
    }
}

/// 底层流式 transport
pub trait Transport: Send {
    fn query_capabilities(&mut self) -> Result<CapabilitySet, TransportError>;

    /// 获取 transport 并按格式建立连接
    fn connect(&mut self, format: &WireFormat) -> Result<(), TransportError>;

    /// 不释放连接，直接切换格式
    fn renegotiate(&mut self, format: &WireFormat) -> Result<(), TransportError>;

    /// 开始拉取回调
    fn start(&mut self, source: Box<dyn RenderSource>) -> Result<(), TransportError>;

    /// 停止回调；返回后不会再调用 render
    fn stop(&mut self) -> Result<(), TransportError>;

    /// 释放连接
    fn release(&mut self) -> Result<(), TransportError>;

    /// 每个周期拉取的帧数
    fn cycle_frames(&self) -> u32;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn query_capabilities(&mut self) -> Result<CapabilitySet, TransportError> {
        (**self).query_capabilities()
    }

    fn connect(&mut self, format: &WireFormat) -> Result<(), TransportError> {
        (**self).connect(format)
    }

    fn renegotiate(&mut self, format: &WireFormat) -> Result<(), TransportError> {
        (**self).renegotiate(format)
    }

    fn start(&mut self, source: Box<dyn RenderSource>) -> Result<(), TransportError> {
        (**self).start(source)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        (**self).stop()
    }

    fn release(&mut self) -> Result<(), TransportError> {
        (**self).release()
    }

    fn cycle_frames(&self) -> u32 {
        (**self).cycle_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsd(order: BitOrder, endianness: Endianness, rate: u32) -> WireFormat {
        WireFormat {
            sample_rate: rate,
            channels: 2,
            bytes_per_sample: 4,
            kind: WireKind::Dsd {
                bit_order: order,
                endianness,
            },
        }
    }

    #[test]
    fn test_capability_masks() {
        let caps = CapabilitySet {
            dsd_formats: CapabilitySet::DSD_LSB_LITTLE,
            ..CapabilitySet::full()
        };
        assert!(caps.supports(&dsd(BitOrder::LsbFirst, Endianness::Little, 2_822_400)));
        assert!(!caps.supports(&dsd(BitOrder::MsbFirst, Endianness::Big, 2_822_400)));
        assert!(!caps.supports(&dsd(BitOrder::LsbFirst, Endianness::Little, 2_822_400 * 8)));

        let pcm = WireFormat {
            sample_rate: 44_100,
            channels: 6,
            bytes_per_sample: 2,
            kind: WireKind::Pcm { float: false },
        };
        assert!(!caps.supports(&pcm));
        assert!(caps.supports(&WireFormat { channels: 2, ..pcm }));
        assert!(!caps.supports_channels(0));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Busy.is_retryable());
        assert!(TransportError::Unavailable("link down".into()).is_retryable());
        assert!(!TransportError::Rejected("rate".into()).is_retryable());
        assert!(!TransportError::StillStreaming.is_retryable());
    }
}

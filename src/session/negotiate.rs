//! 能力协商：源格式 + transport 能力 → 线上格式 + 转换内核

use crate::audio::format::{BitOrder, Endianness, SampleEncoding, SourceFormat, StreamKind, WireFormat, WireKind};
use crate::convert::{select_dsd_mode, select_pcm_mode, ConversionMode, Kernel, Pack24Align};
use crate::transport::CapabilitySet;

use super::error::SessionError;

/// 一个源格式的传输方案
#[derive(Debug, Clone, Copy)]
pub struct StreamPlan {
    pub wire: WireFormat,
    pub kernel: Kernel,
}

impl StreamPlan {
    pub fn mode(&self) -> ConversionMode {
        self.kernel.mode
    }
}

fn mismatch(format: &SourceFormat, reason: &'static str) -> SessionError {
    SessionError::CapabilityMismatch {
        format: *format,
        reason,
    }
}

/// 选出第一个 transport 支持且能转换到的线上格式
pub fn plan(source: &SourceFormat, caps: &CapabilitySet) -> Result<StreamPlan, SessionError> {
    if !caps.supports_channels(source.channels) {
        return Err(mismatch(source, "channel count not supported"));
    }

    let plan = match source.kind {
        StreamKind::Dsd(order) => plan_dsd(source, order, caps)?,
        StreamKind::Pcm => plan_pcm(source, caps)?,
    };
    debug_assert!(caps.supports(&plan.wire));
    Ok(plan)
}

fn plan_dsd(source: &SourceFormat, order: BitOrder, caps: &CapabilitySet) -> Result<StreamPlan, SessionError> {
    if source.sample_rate > caps.max_dsd_rate {
        return Err(mismatch(source, "DSD rate above transport maximum"));
    }
    if source.container_bytes != 4 {
        return Err(mismatch(source, "DSD must arrive in 32-bit words"));
    }

    // 优先不需要位反转，其次不需要字节交换
    let preference = [
        (order, Endianness::Big),
        (order, Endianness::Little),
        (order.flipped(), Endianness::Big),
        (order.flipped(), Endianness::Little),
    ];
    let (bit_order, endianness) = preference
        .into_iter()
        .find(|&(o, e)| caps.dsd_formats & CapabilitySet::dsd_bit(o, e) != 0)
        .ok_or_else(|| mismatch(source, "no DSD bit order/endianness in common"))?;

    let mode = select_dsd_mode(order, bit_order, endianness);
    Ok(StreamPlan {
        wire: WireFormat {
            sample_rate: source.sample_rate,
            channels: source.channels,
            bytes_per_sample: 4,
            kind: WireKind::Dsd {
                bit_order,
                endianness,
            },
        },
        kernel: Kernel::best(ConversionMode::Dsd(mode), Pack24Align::FALLBACK),
    })
}

fn plan_pcm(source: &SourceFormat, caps: &CapabilitySet) -> Result<StreamPlan, SessionError> {
    if source.sample_rate > caps.max_pcm_rate {
        return Err(mismatch(source, "PCM rate above transport maximum"));
    }

    // (线上字节数, 是否浮点)，按偏好排列
    let candidates: &[(u16, bool)] = match (source.encoding, source.container_bytes) {
        (SampleEncoding::Float, _) => &[(4, true)],
        (SampleEncoding::Int, 2) => &[(2, false), (4, false)],
        (SampleEncoding::Int, 3 | 4) if source.bits_per_sample == 24 => &[(3, false)],
        (SampleEncoding::Int, 4) => &[(4, false)],
        _ => &[],
    };

    for &(bytes, float) in candidates {
        let supported = CapabilitySet::pcm_bit(bytes, float)
            .is_some_and(|bit| caps.pcm_formats & bit != 0);
        if !supported {
            continue;
        }
        if let Ok(mode) = select_pcm_mode(source, bytes, float) {
            return Ok(StreamPlan {
                wire: WireFormat {
                    sample_rate: source.sample_rate,
                    channels: source.channels,
                    bytes_per_sample: bytes,
                    kind: WireKind::Pcm { float },
                },
                kernel: Kernel::best(ConversionMode::Pcm(mode), Pack24Align::FALLBACK),
            });
        }
    }

    Err(mismatch(
        source,
        if source.encoding == SampleEncoding::Float {
            "transport lacks float capability"
        } else {
            "no PCM sample format in common"
        },
    ))
}

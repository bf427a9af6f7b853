//! 格式转换引擎
//!
//! 每个格式/曲目只选一次转换函数：
//! 1. `select_dsd_mode` / `select_pcm_mode` 决定转换模式
//! 2. `Kernel::select` 按启动时检测到的向量指令集取出函数指针
//! 3. 热路径上只调用函数指针，不对样本做任何分支
//!
//! 每种模式都有标量实现；AVX2 (x86_64) / NEON (aarch64) 路径
//! 与标量输出逐字节一致。

pub mod align;
pub mod dsd;
pub mod lut;
pub mod pcm;
pub mod stage;

use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

use crate::audio::format::{BitOrder, Endianness, SampleEncoding, SampleLayout, SourceFormat};

pub use align::{AlignReason, AlignmentDetector, Pack24Align};
pub use stage::Stager;

/// DSD 转换模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DsdMode {
    Passthrough,
    BitReverseOnly,
    ByteSwapOnly,
    BitReverseAndSwap,
}

/// PCM 转换模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PcmMode {
    DirectCopy,
    Pack24,
    Upsample16To32,
    /// 源字节直接入环，不经过暂存区
    Bypass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversionMode {
    Dsd(DsdMode),
    Pcm(PcmMode),
}

impl ConversionMode {
    pub const ALL: [ConversionMode; 8] = [
        Self::Dsd(DsdMode::Passthrough),
        Self::Dsd(DsdMode::BitReverseOnly),
        Self::Dsd(DsdMode::ByteSwapOnly),
        Self::Dsd(DsdMode::BitReverseAndSwap),
        Self::Pcm(PcmMode::DirectCopy),
        Self::Pcm(PcmMode::Pack24),
        Self::Pcm(PcmMode::Upsample16To32),
        Self::Pcm(PcmMode::Bypass),
    ];
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dsd(mode) => write!(f, "DSD {:?}", mode),
            Self::Pcm(mode) => write!(f, "PCM {:?}", mode),
        }
    }
}

/// 转换相关错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("no conversion from {bits}-bit/{container}B source to {wire_bytes}B wire samples")]
    UnsupportedPcm {
        bits: u16,
        container: u16,
        wire_bytes: u16,
    },

    #[error("floating-point source requires a float-capable transport")]
    FloatNotSupported,

    #[error("unsupported sample container size: {0} bytes")]
    UnsupportedContainer(u16),

    #[error("source and wire disagree on stream kind")]
    KindMismatch,

    #[error("kernel maps {input}B source frames to {produced}B, wire expects {expected}B")]
    FrameSizeMismatch {
        input: usize,
        produced: usize,
        expected: usize,
    },
}

/// DSD 模式选择
///
/// 源字节按时间顺序排列（大端 word），只看比特顺序是否一致
/// 以及线上 word 是否为小端
pub fn select_dsd_mode(source: BitOrder, target: BitOrder, target_endianness: Endianness) -> DsdMode {
    match (source == target, target_endianness) {
        (true, Endianness::Big) => DsdMode::Passthrough,
        (false, Endianness::Big) => DsdMode::BitReverseOnly,
        (true, Endianness::Little) => DsdMode::ByteSwapOnly,
        (false, Endianness::Little) => DsdMode::BitReverseAndSwap,
    }
}

/// 是否允许跳过暂存区
///
/// 压缩源、浮点源、平面布局一律不走 Bypass
pub fn bypass_eligible(source: &SourceFormat) -> bool {
    !source.compressed
        && source.encoding == SampleEncoding::Int
        && source.layout == SampleLayout::Interleaved
}

/// PCM 模式选择
///
/// `wire_bytes`: 线上每样本字节数；`wire_float`: 线上是否为 f32
pub fn select_pcm_mode(
    source: &SourceFormat,
    wire_bytes: u16,
    wire_float: bool,
) -> Result<PcmMode, ConvertError> {
    if source.encoding == SampleEncoding::Float || wire_float {
        return match (source.encoding, source.container_bytes, wire_bytes, wire_float) {
            (SampleEncoding::Float, 4, 4, true) => Ok(PcmMode::DirectCopy),
            (SampleEncoding::Float, ..) => Err(ConvertError::FloatNotSupported),
            _ => Err(ConvertError::UnsupportedPcm {
                bits: source.bits_per_sample,
                container: source.container_bytes,
                wire_bytes,
            }),
        };
    }

    match (source.bits_per_sample, source.container_bytes, wire_bytes) {
        (16, 2, 4) => Ok(PcmMode::Upsample16To32),
        (24, 4, 3) => Ok(PcmMode::Pack24),
        (16, 2, 2) | (24, 3, 3) | (32, 4, 4) if bypass_eligible(source) => Ok(PcmMode::Bypass),
        (16, 2, 2) | (24, 3, 3) | (32, 4, 4) => Ok(PcmMode::DirectCopy),
        (bits, container, wire_bytes) => Err(ConvertError::UnsupportedPcm {
            bits,
            container,
            wire_bytes,
        }),
    }
}

/// 向量指令集
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorIsa {
    Scalar,
    Avx2,
    Neon,
}

static DETECTED_ISA: OnceLock<VectorIsa> = OnceLock::new();

/// 启动时检测一次，之后只读缓存
pub fn detect_isa() -> VectorIsa {
    *DETECTED_ISA.get_or_init(|| {
        let isa = probe_isa();
        log::debug!("Conversion kernels: {:?}", isa);
        isa
    })
}

#[cfg(all(target_arch = "x86_64", target_endian = "little"))]
fn probe_isa() -> VectorIsa {
    if std::is_x86_feature_detected!("avx2") {
        VectorIsa::Avx2
    } else {
        VectorIsa::Scalar
    }
}

#[cfg(all(target_arch = "aarch64", target_endian = "little"))]
fn probe_isa() -> VectorIsa {
    if std::arch::is_aarch64_feature_detected!("neon") {
        VectorIsa::Neon
    } else {
        VectorIsa::Scalar
    }
}

#[cfg(not(any(
    all(target_arch = "x86_64", target_endian = "little"),
    all(target_arch = "aarch64", target_endian = "little")
)))]
fn probe_isa() -> VectorIsa {
    VectorIsa::Scalar
}

/// 转换函数：`src`/`dst` 长度已按单位对齐
pub type ConvertFn = fn(&[u8], &mut [u8]);

/// 选定的转换内核
#[derive(Clone, Copy)]
pub struct Kernel {
    pub mode: ConversionMode,
    pub isa: VectorIsa,
    pub align: Option<Pack24Align>,
    run: ConvertFn,
    /// 每个单位的输入字节数
    pub in_bytes: usize,
    /// 每个单位的输出字节数
    pub out_bytes: usize,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("mode", &self.mode)
            .field("isa", &self.isa)
            .field("align", &self.align)
            .field("in_bytes", &self.in_bytes)
            .field("out_bytes", &self.out_bytes)
            .finish()
    }
}

impl Kernel {
    /// 按模式和指令集取内核。Pack24 之外 `align` 被忽略
    pub fn select(mode: ConversionMode, align: Pack24Align, isa: VectorIsa) -> Self {
        let (in_bytes, out_bytes) = match mode {
            ConversionMode::Dsd(_) => (4, 4),
            ConversionMode::Pcm(PcmMode::DirectCopy | PcmMode::Bypass) => (1, 1),
            ConversionMode::Pcm(PcmMode::Upsample16To32) => (2, 4),
            ConversionMode::Pcm(PcmMode::Pack24) => (4, 3),
        };
        let align = matches!(mode, ConversionMode::Pcm(PcmMode::Pack24)).then_some(align);
        let (run, isa) = kernel_fn(mode, align.unwrap_or(Pack24Align::FALLBACK), isa);
        Self {
            mode,
            isa,
            align,
            run,
            in_bytes,
            out_bytes,
        }
    }

    /// 用检测到的指令集选择
    pub fn best(mode: ConversionMode, align: Pack24Align) -> Self {
        Self::select(mode, align, detect_isa())
    }

    /// 转换尽可能多的完整单位，返回单位数
    #[inline]
    pub fn run(&self, src: &[u8], dst: &mut [u8]) -> usize {
        let n = (src.len() / self.in_bytes).min(dst.len() / self.out_bytes);
        (self.run)(&src[..n * self.in_bytes], &mut dst[..n * self.out_bytes]);
        n
    }

    /// 输入字节数换算成输出字节数
    #[inline]
    pub fn output_len(&self, input_len: usize) -> usize {
        input_len / self.in_bytes * self.out_bytes
    }
}

/// 模式 × 指令集 → 函数指针
///
/// DirectCopy、Bypass、Passthrough 三个纯拷贝模式没有单独的 SIMD 变体：
/// `copy_from_slice` 落到编译器的 memcpy，本身就是各指令集下的向量路径，
/// 表中登记为该指令集的实现，不算缺项。
/// 请求的指令集不可用时返回标量实现，并报告实际使用的指令集
fn kernel_fn(mode: ConversionMode, align: Pack24Align, isa: VectorIsa) -> (ConvertFn, VectorIsa) {
    use ConversionMode::{Dsd, Pcm};

    let scalar: ConvertFn = match (mode, align) {
        (Dsd(DsdMode::Passthrough), _) => dsd::passthrough_scalar,
        (Dsd(DsdMode::BitReverseOnly), _) => dsd::bit_reverse_scalar,
        (Dsd(DsdMode::ByteSwapOnly), _) => dsd::byte_swap_scalar,
        (Dsd(DsdMode::BitReverseAndSwap), _) => dsd::bit_reverse_and_swap_scalar,
        (Pcm(PcmMode::DirectCopy | PcmMode::Bypass), _) => pcm::direct_copy_scalar,
        (Pcm(PcmMode::Upsample16To32), _) => pcm::upsample_16_to_32_scalar,
        (Pcm(PcmMode::Pack24), Pack24Align::Lsb) => pcm::pack24_lsb_scalar,
        (Pcm(PcmMode::Pack24), Pack24Align::Msb) => pcm::pack24_msb_scalar,
    };

    match isa {
        VectorIsa::Scalar => (scalar, VectorIsa::Scalar),
        VectorIsa::Avx2 => avx2_fn(mode, align).map_or((scalar, VectorIsa::Scalar), |f| (f, isa)),
        VectorIsa::Neon => neon_fn(mode, align).map_or((scalar, VectorIsa::Scalar), |f| (f, isa)),
    }
}

#[cfg(all(target_arch = "x86_64", target_endian = "little"))]
fn avx2_fn(mode: ConversionMode, align: Pack24Align) -> Option<ConvertFn> {
    use ConversionMode::{Dsd, Pcm};

    if !std::is_x86_feature_detected!("avx2") {
        return None;
    }
    Some(match (mode, align) {
        // 拷贝即向量路径
        (Dsd(DsdMode::Passthrough), _) => dsd::passthrough_scalar,
        (Dsd(DsdMode::BitReverseOnly), _) => dsd::avx2::bit_reverse,
        (Dsd(DsdMode::ByteSwapOnly), _) => dsd::avx2::byte_swap,
        (Dsd(DsdMode::BitReverseAndSwap), _) => dsd::avx2::bit_reverse_and_swap,
        (Pcm(PcmMode::DirectCopy | PcmMode::Bypass), _) => pcm::direct_copy_scalar,
        (Pcm(PcmMode::Upsample16To32), _) => pcm::avx2::upsample_16_to_32,
        (Pcm(PcmMode::Pack24), Pack24Align::Lsb) => pcm::avx2::pack24_lsb,
        (Pcm(PcmMode::Pack24), Pack24Align::Msb) => pcm::avx2::pack24_msb,
    })
}

#[cfg(not(all(target_arch = "x86_64", target_endian = "little")))]
fn avx2_fn(_mode: ConversionMode, _align: Pack24Align) -> Option<ConvertFn> {
    None
}

#[cfg(all(target_arch = "aarch64", target_endian = "little"))]
fn neon_fn(mode: ConversionMode, align: Pack24Align) -> Option<ConvertFn> {
    use ConversionMode::{Dsd, Pcm};

    if !std::arch::is_aarch64_feature_detected!("neon") {
        return None;
    }
    Some(match (mode, align) {
        // 拷贝即向量路径
        (Dsd(DsdMode::Passthrough), _) => dsd::passthrough_scalar,
        (Dsd(DsdMode::BitReverseOnly), _) => dsd::neon::bit_reverse,
        (Dsd(DsdMode::ByteSwapOnly), _) => dsd::neon::byte_swap,
        (Dsd(DsdMode::BitReverseAndSwap), _) => dsd::neon::bit_reverse_and_swap,
        (Pcm(PcmMode::DirectCopy | PcmMode::Bypass), _) => pcm::direct_copy_scalar,
        (Pcm(PcmMode::Upsample16To32), _) => pcm::neon::upsample_16_to_32,
        (Pcm(PcmMode::Pack24), Pack24Align::Lsb) => pcm::neon::pack24_lsb,
        (Pcm(PcmMode::Pack24), Pack24Align::Msb) => pcm::neon::pack24_msb,
    })
}

#[cfg(not(all(target_arch = "aarch64", target_endian = "little")))]
fn neon_fn(_mode: ConversionMode, _align: Pack24Align) -> Option<ConvertFn> {
    None
}

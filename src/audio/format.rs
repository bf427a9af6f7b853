//! 音频格式描述
//!
//! 两侧格式：
//! - SourceFormat: 解码器交给生产者的原始字节布局
//! - WireFormat: transport 期望的线上字节布局
//!
//! DSD 约定：sample_rate 为单声道比特率（DSD64 = 2_822_400），
//! 一帧 = 每声道一个 32-bit word（32 个 DSD bit）

use std::fmt;

/// DSD 比特顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitOrder {
    /// DFF：每字节最早的 bit 在最高位
    MsbFirst,
    /// DSF：每字节最早的 bit 在最低位
    LsbFirst,
}

impl BitOrder {
    pub fn flipped(self) -> Self {
        match self {
            Self::MsbFirst => Self::LsbFirst,
            Self::LsbFirst => Self::MsbFirst,
        }
    }
}

/// 线上 32-bit word 的字节序
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// 最早的字节在 word 的最高位，内存顺序 = 时间顺序
    Big,
    /// 每 4 字节内部倒序
    Little,
}

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    Int,
    Float,
}

/// 源数据布局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SampleLayout {
    /// LRLRLR...
    #[default]
    Interleaved,
    /// 每声道连续一段：LLLL...RRRR...
    Planar,
}

/// 流类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Pcm,
    Dsd(BitOrder),
}

/// 时钟族：44.1k 系 / 48k 系
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockFamily {
    Base44k1,
    Base48k,
}

impl ClockFamily {
    pub fn of_rate(rate: u32) -> Self {
        // DSD64 = 44100 * 64，同样落在 44.1k 系
        if rate % 11_025 == 0 {
            Self::Base44k1
        } else {
            Self::Base48k
        }
    }

    pub fn base_rate(self) -> u32 {
        match self {
            Self::Base44k1 => 44_100,
            Self::Base48k => 48_000,
        }
    }
}

/// 格式类别，重开策略表的键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatClass {
    Pcm(ClockFamily),
    Dsd(ClockFamily),
}

impl fmt::Display for FormatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, family) = match self {
            Self::Pcm(family) => ("PCM", family),
            Self::Dsd(family) => ("DSD", family),
        };
        let family = match family {
            ClockFamily::Base44k1 => "44.1k",
            ClockFamily::Base48k => "48k",
        };
        write!(f, "{} {}", kind, family)
    }
}

/// 解码器交出的源格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 有效位数（DSD 为 1）
    pub bits_per_sample: u16,
    /// 每个样本在缓冲区中占用的字节数
    pub container_bytes: u16,
    pub encoding: SampleEncoding,
    pub layout: SampleLayout,
    /// 来自压缩编码（FLAC/MP3 等）
    pub compressed: bool,
    pub kind: StreamKind,
}

impl SourceFormat {
    /// 交织整数 PCM，容器紧凑（24-bit 占 3 字节）
    pub fn pcm(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            container_bytes: bits_per_sample.div_ceil(8),
            encoding: SampleEncoding::Int,
            layout: SampleLayout::Interleaved,
            compressed: false,
            kind: StreamKind::Pcm,
        }
    }

    /// 32-bit 浮点 PCM
    pub fn pcm_float(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: SampleEncoding::Float,
            ..Self::pcm(sample_rate, channels, 32)
        }
    }

    /// 交织 DSD，每声道以 32-bit word 为单位
    pub fn dsd(sample_rate: u32, channels: u16, bit_order: BitOrder) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 1,
            container_bytes: 4,
            encoding: SampleEncoding::Int,
            layout: SampleLayout::Interleaved,
            compressed: false,
            kind: StreamKind::Dsd(bit_order),
        }
    }

    pub fn with_container(mut self, container_bytes: u16) -> Self {
        self.container_bytes = container_bytes;
        self
    }

    pub fn planar(mut self) -> Self {
        self.layout = SampleLayout::Planar;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    #[inline]
    pub fn is_dsd(&self) -> bool {
        matches!(self.kind, StreamKind::Dsd(_))
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.container_bytes as usize * self.channels as usize
    }

    /// 每秒帧数（DSD 为每秒 word 数）
    #[inline]
    pub fn frames_per_second(&self) -> u32 {
        match self.kind {
            StreamKind::Pcm => self.sample_rate,
            StreamKind::Dsd(_) => self.sample_rate / 32,
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.frames_per_second() as u64 * self.bytes_per_frame() as u64
    }

    pub fn class(&self) -> FormatClass {
        let family = ClockFamily::of_rate(self.sample_rate);
        match self.kind {
            StreamKind::Pcm => FormatClass::Pcm(family),
            StreamKind::Dsd(_) => FormatClass::Dsd(family),
        }
    }

    /// 相对时钟族基准的倍率，最小为 1
    ///
    /// PCM: 88.2k → 2；DSD: DSD128 → 2
    pub fn rate_multiplier(&self) -> u32 {
        let base = ClockFamily::of_rate(self.sample_rate).base_rate();
        let base = match self.kind {
            StreamKind::Pcm => base,
            StreamKind::Dsd(_) => base * 64,
        };
        (self.sample_rate / base).max(1)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StreamKind::Pcm => write!(
                f,
                "PCM {}Hz {}ch {}bit/{}B {:?} {:?}{}",
                self.sample_rate,
                self.channels,
                self.bits_per_sample,
                self.container_bytes,
                self.encoding,
                self.layout,
                if self.compressed { " (compressed)" } else { "" }
            ),
            StreamKind::Dsd(order) => write!(
                f,
                "DSD{}{} {}ch {:?} {:?}",
                self.rate_multiplier() * 64,
                match ClockFamily::of_rate(self.sample_rate) {
                    ClockFamily::Base44k1 => "",
                    ClockFamily::Base48k => " (48k)",
                },
                self.channels,
                order,
                self.layout
            ),
        }
    }
}

/// transport 线上格式的样本类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireKind {
    Pcm { float: bool },
    Dsd { bit_order: BitOrder, endianness: Endianness },
}

/// transport 线上格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 线上每样本字节数（PCM 2/3/4，DSD 固定 4）
    pub bytes_per_sample: u16,
    pub kind: WireKind,
}

impl WireFormat {
    #[inline]
    pub fn is_dsd(&self) -> bool {
        matches!(self.kind, WireKind::Dsd { .. })
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample as usize * self.channels as usize
    }

    #[inline]
    pub fn frames_per_second(&self) -> u32 {
        match self.kind {
            WireKind::Pcm { .. } => self.sample_rate,
            WireKind::Dsd { .. } => self.sample_rate / 32,
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.frames_per_second() as u64 * self.bytes_per_frame() as u64
    }

    /// 欠载/冲刷时填充的静音字节
    ///
    /// DSD 静音图样 0x69 为 MSB-first，LSB-first 线上为其位反转 0x96
    pub fn silence_byte(&self) -> u8 {
        match self.kind {
            WireKind::Pcm { .. } => 0x00,
            WireKind::Dsd { bit_order: BitOrder::MsbFirst, .. } => 0x69,
            WireKind::Dsd { bit_order: BitOrder::LsbFirst, .. } => 0x96,
        }
    }

    pub fn class(&self) -> FormatClass {
        let family = ClockFamily::of_rate(self.sample_rate);
        match self.kind {
            WireKind::Pcm { .. } => FormatClass::Pcm(family),
            WireKind::Dsd { .. } => FormatClass::Dsd(family),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WireKind::Pcm { float } => write!(
                f,
                "{}Hz {}ch {}B{}",
                self.sample_rate,
                self.channels,
                self.bytes_per_sample,
                if float { " float" } else { "" }
            ),
            WireKind::Dsd { bit_order, endianness } => write!(
                f,
                "DSD {}Hz {}ch {:?}/{:?}",
                self.sample_rate, self.channels, bit_order, endianness
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_family() {
        assert_eq!(ClockFamily::of_rate(44_100), ClockFamily::Base44k1);
        assert_eq!(ClockFamily::of_rate(88_200), ClockFamily::Base44k1);
        assert_eq!(ClockFamily::of_rate(48_000), ClockFamily::Base48k);
        assert_eq!(ClockFamily::of_rate(192_000), ClockFamily::Base48k);
        assert_eq!(ClockFamily::of_rate(2_822_400), ClockFamily::Base44k1);
        assert_eq!(ClockFamily::of_rate(3_072_000), ClockFamily::Base48k);
    }

    #[test]
    fn test_rate_multiplier() {
        assert_eq!(SourceFormat::pcm(44_100, 2, 16).rate_multiplier(), 1);
        assert_eq!(SourceFormat::pcm(176_400, 2, 24).rate_multiplier(), 4);
        assert_eq!(SourceFormat::pcm(96_000, 2, 24).rate_multiplier(), 2);
        let dsd64 = SourceFormat::dsd(2_822_400, 2, BitOrder::MsbFirst);
        let dsd128 = SourceFormat::dsd(5_644_800, 2, BitOrder::MsbFirst);
        assert_eq!(dsd64.rate_multiplier(), 1);
        assert_eq!(dsd128.rate_multiplier(), 2);
    }

    #[test]
    fn test_dsd_display_names_multiple() {
        let dsd64 = SourceFormat::dsd(2_822_400, 2, BitOrder::MsbFirst);
        assert!(dsd64.to_string().starts_with("DSD64 2ch"));
        let dsd64_48k = SourceFormat::dsd(3_072_000, 2, BitOrder::MsbFirst);
        assert!(dsd64_48k.to_string().starts_with("DSD64 (48k) 2ch"));
        let dsd256 = SourceFormat::dsd(11_289_600, 2, BitOrder::LsbFirst);
        assert!(dsd256.to_string().starts_with("DSD256 "));
    }

    #[test]
    fn test_frame_sizes() {
        let pcm = SourceFormat::pcm(44_100, 2, 24);
        assert_eq!(pcm.container_bytes, 3);
        assert_eq!(pcm.bytes_per_frame(), 6);
        assert_eq!(pcm.bytes_per_second(), 44_100 * 6);

        let dsd = SourceFormat::dsd(2_822_400, 2, BitOrder::LsbFirst);
        assert_eq!(dsd.frames_per_second(), 88_200);
        assert_eq!(dsd.bytes_per_second(), 2_822_400 / 8 * 2);
    }

    #[test]
    fn test_silence_byte() {
        let pcm = WireFormat {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 3,
            kind: WireKind::Pcm { float: false },
        };
        assert_eq!(pcm.silence_byte(), 0);

        let msb = WireFormat {
            sample_rate: 2_822_400,
            channels: 2,
            bytes_per_sample: 4,
            kind: WireKind::Dsd {
                bit_order: BitOrder::MsbFirst,
                endianness: Endianness::Big,
            },
        };
        assert_eq!(msb.silence_byte(), 0x69);
        let lsb = WireFormat {
            kind: WireKind::Dsd {
                bit_order: BitOrder::LsbFirst,
                endianness: Endianness::Little,
            },
            ..msb
        };
        assert_eq!(lsb.silence_byte(), 0x69u8.reverse_bits());
    }
}

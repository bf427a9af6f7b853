//! 暂存管线：源字节 → 线上字节 → 环形缓冲区
//!
//! 每个曲目构造一次：
//! - 平面布局按容器大小选一个交织函数
//! - Pack24 带对齐检测器，判定前逐样本按较小的解释打包，判定后换内核
//! - Bypass 直接 push 源字节
//! - 其余模式优先写入环的连续区域（零拷贝），否则经暂存区 push

use crate::audio::format::{SampleLayout, SourceFormat, WireFormat};
use crate::audio::ring_buffer::RingBuffer;

use super::{pcm, AlignmentDetector, ConversionMode, ConvertError, Kernel, Pack24Align, PcmMode};

/// 平面 → 交织
///
/// `planes`: 各声道依次排列，每个平面 `plane_frames` 帧；
/// 从第 `start` 帧开始，写满 `dst`
pub type InterleaveFn =
    fn(planes: &[u8], plane_frames: usize, channels: usize, start: usize, dst: &mut [u8]);

fn interleave<const N: usize>(
    planes: &[u8],
    plane_frames: usize,
    channels: usize,
    start: usize,
    dst: &mut [u8],
) {
    let stride = plane_frames * N;
    for (f, frame) in dst.chunks_exact_mut(N * channels).enumerate() {
        for (c, sample) in frame.chunks_exact_mut(N).enumerate() {
            let at = c * stride + (start + f) * N;
            sample.copy_from_slice(&planes[at..at + N]);
        }
    }
}

/// 按容器字节数选交织函数
pub fn interleaver(container_bytes: u16) -> Result<InterleaveFn, ConvertError> {
    match container_bytes {
        1 => Ok(interleave::<1>),
        2 => Ok(interleave::<2>),
        3 => Ok(interleave::<3>),
        4 => Ok(interleave::<4>),
        8 => Ok(interleave::<8>),
        other => Err(ConvertError::UnsupportedContainer(other)),
    }
}

/// 写入路径统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageCounters {
    pub direct_writes: u64,
    pub scratch_writes: u64,
    pub bypass_writes: u64,
}

impl StageCounters {
    pub fn absorb(&mut self, other: StageCounters) {
        self.direct_writes += other.direct_writes;
        self.scratch_writes += other.scratch_writes;
        self.bypass_writes += other.bypass_writes;
    }
}

pub struct Stager {
    kernel: Kernel,
    channels: usize,
    in_frame: usize,
    out_frame: usize,
    interleave: Option<InterleaveFn>,
    detector: Option<AlignmentDetector>,
    scratch: Vec<u8>,
    planar: Vec<u8>,
    max_frames: usize,
    counters: StageCounters,
}

impl Stager {
    /// `scratch_frames`: 单次暂存的最大帧数；
    /// `alignment_timeout_samples`: Pack24 对齐检测最多检查的样本数
    pub fn new(
        source: &SourceFormat,
        wire: &WireFormat,
        kernel: Kernel,
        scratch_frames: usize,
        alignment_timeout_samples: u64,
    ) -> Result<Self, ConvertError> {
        if source.is_dsd() != wire.is_dsd() {
            return Err(ConvertError::KindMismatch);
        }

        let in_frame = source.bytes_per_frame();
        let out_frame = wire.bytes_per_frame();
        let produced = kernel.output_len(in_frame);
        if produced != out_frame || in_frame % kernel.in_bytes != 0 {
            return Err(ConvertError::FrameSizeMismatch {
                input: in_frame,
                produced,
                expected: out_frame,
            });
        }

        let interleave = match source.layout {
            SampleLayout::Interleaved => None,
            SampleLayout::Planar => Some(interleaver(source.container_bytes)?),
        };

        let detector = matches!(kernel.mode, ConversionMode::Pcm(PcmMode::Pack24))
            .then(|| AlignmentDetector::new(alignment_timeout_samples));

        let max_frames = scratch_frames.max(1);
        let planar = if interleave.is_some() {
            vec![0u8; max_frames * in_frame]
        } else {
            Vec::new()
        };

        Ok(Self {
            kernel,
            channels: source.channels as usize,
            in_frame,
            out_frame,
            interleave,
            detector,
            scratch: vec![0u8; max_frames * out_frame],
            planar,
            max_frames,
            counters: StageCounters::default(),
        })
    }

    pub fn input_frame_bytes(&self) -> usize {
        self.in_frame
    }

    pub fn counters(&self) -> StageCounters {
        self.counters
    }

    /// 对齐仍未判定
    pub fn alignment_pending(&self) -> bool {
        self.detector
            .as_ref()
            .is_some_and(|d| d.decision().is_none())
    }

    /// 把 `block` 中第 `start` 帧起最多 `count` 帧转换后写入环
    ///
    /// `block_frames` 是整块的帧数（平面布局据此定位各声道）。
    /// 只写能完整放下的帧，返回写入的帧数
    pub fn stage(
        &mut self,
        ring: &RingBuffer,
        block: &[u8],
        block_frames: usize,
        start: usize,
        count: usize,
    ) -> usize {
        let fit = ring.free() / self.out_frame;
        let n = count.min(fit).min(self.max_frames);
        if n == 0 {
            return 0;
        }

        let input: &[u8] = match self.interleave {
            Some(interleave) => {
                let dst = &mut self.planar[..n * self.in_frame];
                interleave(block, block_frames, self.channels, start, dst);
                dst
            }
            None => &block[start * self.in_frame..(start + n) * self.in_frame],
        };

        if let Some(detector) = self.detector.as_mut() {
            if detector.decision().is_none() {
                if let Some(align) = detector.observe(input) {
                    if let Some((_, reason)) = detector.decision() {
                        log::info!("24-bit container alignment: {:?} ({:?})", align, reason);
                    }
                    if self.kernel.align != Some(align) {
                        self.kernel = Kernel::select(self.kernel.mode, align, self.kernel.isa);
                    }
                }
            }
        }

        // 判定前逐样本取较小的解释
        let provisional = self
            .detector
            .as_ref()
            .is_some_and(|d| d.decision().is_none());
        let out_len = n * self.out_frame;

        if matches!(self.kernel.mode, ConversionMode::Pcm(PcmMode::Bypass)) {
            let written = ring.push(input);
            debug_assert_eq!(written, out_len);
            self.counters.bypass_writes += 1;
            return n;
        }

        match ring.direct_write_region(out_len) {
            Some(region) => {
                convert(&self.kernel, provisional, input, region);
                ring.commit_direct_write(out_len);
                self.counters.direct_writes += 1;
            }
            None => {
                let staged = &mut self.scratch[..out_len];
                convert(&self.kernel, provisional, input, staged);
                let written = ring.push(staged);
                debug_assert_eq!(written, out_len);
                self.counters.scratch_writes += 1;
            }
        }
        n
    }

    /// 当前 Pack24 对齐
    pub fn pack24_align(&self) -> Option<Pack24Align> {
        self.kernel.align
    }
}

#[inline]
fn convert(kernel: &Kernel, provisional: bool, input: &[u8], out: &mut [u8]) {
    if provisional {
        pcm::pack24_provisional_scalar(input, out);
    } else {
        kernel.run(input, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{BitOrder, Endianness, WireKind};
    use crate::convert::{select_dsd_mode, select_pcm_mode, DsdMode, VectorIsa};

    fn pcm_wire(rate: u32, channels: u16, bytes: u16) -> WireFormat {
        WireFormat {
            sample_rate: rate,
            channels,
            bytes_per_sample: bytes,
            kind: WireKind::Pcm { float: false },
        }
    }

    fn drain(ring: &RingBuffer) -> Vec<u8> {
        let mut out = vec![0u8; ring.available()];
        ring.pop(&mut out);
        out
    }

    #[test]
    fn test_interleave_planar() {
        let planes = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]; // L: 1..6 R: 7..12, 16-bit
        let mut dst = [0u8; 8];
        interleave::<2>(&planes, 3, 2, 1, &mut dst);
        assert_eq!(dst, [3, 4, 9, 10, 5, 6, 11, 12]);
        assert!(interleaver(5).is_err());
    }

    #[test]
    fn test_bypass_pushes_source_bytes() {
        let source = SourceFormat::pcm(44_100, 2, 16);
        let wire = pcm_wire(44_100, 2, 2);
        let mode = select_pcm_mode(&source, 2, false).unwrap();
        assert_eq!(mode, PcmMode::Bypass);
        let kernel = Kernel::best(ConversionMode::Pcm(mode), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 64, 1_000).unwrap();

        let ring = RingBuffer::with_min_capacity(1024);
        let block: Vec<u8> = (0..40u8).collect();
        assert_eq!(stager.stage(&ring, &block, 10, 0, 10), 10);
        assert_eq!(drain(&ring), block);
        assert_eq!(stager.counters().bypass_writes, 1);
    }

    #[test]
    fn test_stage_only_whole_frames_fit() {
        let source = SourceFormat::pcm(44_100, 2, 16);
        let wire = pcm_wire(44_100, 2, 4);
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::Upsample16To32), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 64, 1_000).unwrap();

        // free = 31 字节，8 字节一帧
        let ring = RingBuffer::with_min_capacity(32);
        let block = vec![0x11u8; 4 * 10];
        assert_eq!(stager.stage(&ring, &block, 10, 0, 10), 3);
        assert_eq!(ring.available(), 24);
    }

    #[test]
    fn test_scratch_path_across_wrap() {
        let source = SourceFormat::dsd(2_822_400, 2, BitOrder::LsbFirst);
        let wire = WireFormat {
            sample_rate: 2_822_400,
            channels: 2,
            bytes_per_sample: 4,
            kind: WireKind::Dsd {
                bit_order: BitOrder::MsbFirst,
                endianness: Endianness::Big,
            },
        };
        let mode = select_dsd_mode(BitOrder::LsbFirst, BitOrder::MsbFirst, Endianness::Big);
        assert_eq!(mode, DsdMode::BitReverseOnly);
        let kernel = Kernel::select(ConversionMode::Dsd(mode), Pack24Align::Lsb, VectorIsa::Scalar);
        let mut stager = Stager::new(&source, &wire, kernel, 64, 1_000).unwrap();

        let ring = RingBuffer::with_min_capacity(64);
        let block = vec![0x01u8; 8 * 5];
        // 先推进游标，让下一次写入跨界
        assert_eq!(stager.stage(&ring, &block, 5, 0, 5), 5);
        drain(&ring);
        assert_eq!(stager.stage(&ring, &block, 5, 0, 5), 5);
        assert_eq!(stager.counters().scratch_writes, 1);
        assert!(drain(&ring).iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_pack24_detects_msb_and_switches() {
        let source = SourceFormat::pcm(96_000, 1, 24).with_container(4);
        let wire = pcm_wire(96_000, 1, 3);
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::Pack24), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 256, 96_000).unwrap();
        assert!(stager.alignment_pending());

        let values: Vec<i32> = (1..=64).map(|i| i * 100_003).collect();
        let block: Vec<u8> = values.iter().flat_map(|v| (v << 8).to_le_bytes()).collect();
        let ring = RingBuffer::with_min_capacity(1024);
        assert_eq!(stager.stage(&ring, &block, 64, 0, 64), 64);

        assert!(!stager.alignment_pending());
        assert_eq!(stager.pack24_align(), Some(Pack24Align::Msb));
        let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()[..3].to_vec()).collect();
        assert_eq!(drain(&ring), expected);
    }

    #[test]
    fn test_pack24_quiet_msb_intro_not_amplified() {
        // 幅度低于 2^15 的高位对齐样本两种解释都成立，检测器一直未判定
        let source = SourceFormat::pcm(96_000, 1, 24).with_container(4).planar();
        let wire = pcm_wire(96_000, 1, 3);
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::Pack24), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 256, 96_000).unwrap();

        let values: Vec<i32> = (1..=64).map(|i| i * 30).collect();
        let block: Vec<u8> = values.iter().flat_map(|v| (v << 8).to_le_bytes()).collect();
        let ring = RingBuffer::with_min_capacity(1024);
        assert_eq!(stager.stage(&ring, &block, 64, 0, 64), 64);

        assert!(stager.alignment_pending());
        let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()[..3].to_vec()).collect();
        assert_eq!(drain(&ring), expected);
    }

    #[test]
    fn test_pack24_pending_keeps_lsb_samples() {
        let source = SourceFormat::pcm(96_000, 1, 24).with_container(4);
        let wire = pcm_wire(96_000, 1, 3);
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::Pack24), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 256, 96_000).unwrap();

        // 低字节非 0，不足判定票数
        let values: Vec<i32> = (1..=8).map(|i| i * 30 + 1).collect();
        let block: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let ring = RingBuffer::with_min_capacity(256);
        assert_eq!(stager.stage(&ring, &block, 8, 0, 8), 8);

        assert!(stager.alignment_pending());
        let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()[..3].to_vec()).collect();
        assert_eq!(drain(&ring), expected);
    }

    #[test]
    fn test_planar_float_direct_copy() {
        let source = SourceFormat::pcm_float(48_000, 2).planar();
        let wire = WireFormat {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 4,
            kind: WireKind::Pcm { float: true },
        };
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::DirectCopy), Pack24Align::Lsb);
        let mut stager = Stager::new(&source, &wire, kernel, 64, 0).unwrap();

        let left: Vec<u8> = [0.5f32, 0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        let right: Vec<u8> = [-0.5f32, -0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        let block = [left.clone(), right.clone()].concat();

        let ring = RingBuffer::with_min_capacity(256);
        assert_eq!(stager.stage(&ring, &block, 2, 0, 2), 2);
        let expected = [&left[..4], &right[..4], &left[4..], &right[4..]].concat();
        assert_eq!(drain(&ring), expected);
    }

    #[test]
    fn test_frame_size_mismatch_rejected() {
        let source = SourceFormat::pcm(44_100, 2, 16);
        let wire = pcm_wire(44_100, 2, 3);
        let kernel = Kernel::best(ConversionMode::Pcm(PcmMode::Upsample16To32), Pack24Align::Lsb);
        assert!(matches!(
            Stager::new(&source, &wire, kernel, 64, 0),
            Err(ConvertError::FrameSizeMismatch { .. })
        ));
    }
}

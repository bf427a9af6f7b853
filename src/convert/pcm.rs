//! PCM 内核
//!
//! 线上 PCM 为小端整数（或 f32）。
//! - direct_copy: 源与线上布局一致
//! - upsample_16_to_32: 16-bit 放到 32-bit 高位，低 16 位补 0
//! - pack24_lsb / pack24_msb: 32-bit 容器取出 3 个有效字节
//! - pack24_provisional: 对齐未判定时逐样本选较小的解释
//!
//! 调用方保证 src/dst 长度按各自单位匹配。

pub fn direct_copy_scalar(src: &[u8], dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

pub fn upsample_16_to_32_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(2)) {
        d[0] = 0;
        d[1] = 0;
        d[2] = s[0];
        d[3] = s[1];
    }
}

/// 有效字节在低 3 字节（符号扩展的 i32）
pub fn pack24_lsb_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
        d[0] = s[0];
        d[1] = s[1];
        d[2] = s[2];
    }
}

/// 有效字节在高 3 字节（左移 8 位的 i32）
pub fn pack24_msb_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
        d[0] = s[1];
        d[1] = s[2];
        d[2] = s[3];
    }
}

/// 对齐未判定时的逐样本打包
///
/// 最低字节为 0 的样本按高位对齐取，其余按低位对齐取。
/// 高位对齐的源始终正确；低位对齐的源只可能被取小，不会被放大
pub fn pack24_provisional_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
        let at = usize::from(s[0] == 0);
        d.copy_from_slice(&s[at..at + 3]);
    }
}

#[cfg(all(target_arch = "x86_64", target_endian = "little"))]
pub(crate) mod avx2 {
    use std::arch::x86_64::*;

    /// 每组 8 个样本
    const SAMPLES: usize = 8;

    #[target_feature(enable = "avx2")]
    unsafe fn upsample_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let samples = src.len() / 2;
        let mut i = 0;
        while i + SAMPLES <= samples {
            let v = _mm_loadu_si128(src.as_ptr().add(i * 2) as *const __m128i);
            let wide = _mm256_slli_epi32::<16>(_mm256_cvtepi16_epi32(v));
            _mm256_storeu_si256(dst.as_mut_ptr().add(i * 4) as *mut __m256i, wide);
            i += SAMPLES;
        }
        i
    }

    /// 每个 lane 把 4 个 word 的有效字节挤到低 12 字节，
    /// 再跨 lane 把两段 12 字节拼成连续 24 字节
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn pack24_impl(src: &[u8], dst: &mut [u8], shuffle: __m256i) -> usize {
        let permute = _mm256_setr_epi32(0, 1, 2, 4, 5, 6, 3, 7);
        let samples = src.len() / 4;
        let mut i = 0;
        while i + SAMPLES <= samples {
            let v = _mm256_loadu_si256(src.as_ptr().add(i * 4) as *const __m256i);
            let packed = _mm256_permutevar8x32_epi32(_mm256_shuffle_epi8(v, shuffle), permute);
            let out = dst.as_mut_ptr().add(i * 3);
            _mm_storeu_si128(out as *mut __m128i, _mm256_castsi256_si128(packed));
            _mm_storel_epi64(
                out.add(16) as *mut __m128i,
                _mm256_extracti128_si256::<1>(packed),
            );
            i += SAMPLES;
        }
        i
    }

    #[target_feature(enable = "avx2")]
    unsafe fn pack24_lsb_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let shuffle = _mm256_setr_epi8(
            0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14, -1, -1, -1, -1, //
            0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14, -1, -1, -1, -1,
        );
        pack24_impl(src, dst, shuffle)
    }

    #[target_feature(enable = "avx2")]
    unsafe fn pack24_msb_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let shuffle = _mm256_setr_epi8(
            1, 2, 3, 5, 6, 7, 9, 10, 11, 13, 14, 15, -1, -1, -1, -1, //
            1, 2, 3, 5, 6, 7, 9, 10, 11, 13, 14, 15, -1, -1, -1, -1,
        );
        pack24_impl(src, dst, shuffle)
    }

    pub fn upsample_16_to_32(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { upsample_impl(src, dst) };
        super::upsample_16_to_32_scalar(&src[done * 2..], &mut dst[done * 4..]);
    }

    pub fn pack24_lsb(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { pack24_lsb_impl(src, dst) };
        super::pack24_lsb_scalar(&src[done * 4..], &mut dst[done * 3..]);
    }

    pub fn pack24_msb(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { pack24_msb_impl(src, dst) };
        super::pack24_msb_scalar(&src[done * 4..], &mut dst[done * 3..]);
    }
}

#[cfg(all(target_arch = "aarch64", target_endian = "little"))]
pub(crate) mod neon {
    use std::arch::aarch64::*;

    #[target_feature(enable = "neon")]
    unsafe fn upsample_impl(src: &[u8], dst: &mut [u8]) -> usize {
        const SAMPLES: usize = 8;
        let samples = src.len() / 2;
        let mut i = 0;
        while i + SAMPLES <= samples {
            let v = vld1q_s16(src.as_ptr().add(i * 2) as *const i16);
            let lo = vshlq_n_s32::<16>(vmovl_s16(vget_low_s16(v)));
            let hi = vshlq_n_s32::<16>(vmovl_high_s16(v));
            let out = dst.as_mut_ptr().add(i * 4) as *mut i32;
            vst1q_s32(out, lo);
            vst1q_s32(out.add(4), hi);
            i += SAMPLES;
        }
        i
    }

    /// vld4q 把 16 个 word 按字节位置拆成 4 个寄存器，vst3q 交织写回 3 个
    #[target_feature(enable = "neon")]
    unsafe fn pack24_lsb_impl(src: &[u8], dst: &mut [u8]) -> usize {
        const SAMPLES: usize = 16;
        let samples = src.len() / 4;
        let mut i = 0;
        while i + SAMPLES <= samples {
            let v = vld4q_u8(src.as_ptr().add(i * 4));
            vst3q_u8(dst.as_mut_ptr().add(i * 3), uint8x16x3_t(v.0, v.1, v.2));
            i += SAMPLES;
        }
        i
    }

    #[target_feature(enable = "neon")]
    unsafe fn pack24_msb_impl(src: &[u8], dst: &mut [u8]) -> usize {
        const SAMPLES: usize = 16;
        let samples = src.len() / 4;
        let mut i = 0;
        while i + SAMPLES <= samples {
            let v = vld4q_u8(src.as_ptr().add(i * 4));
            vst3q_u8(dst.as_mut_ptr().add(i * 3), uint8x16x3_t(v.1, v.2, v.3));
            i += SAMPLES;
        }
        i
    }

    pub fn upsample_16_to_32(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { upsample_impl(src, dst) };
        super::upsample_16_to_32_scalar(&src[done * 2..], &mut dst[done * 4..]);
    }

    pub fn pack24_lsb(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { pack24_lsb_impl(src, dst) };
        super::pack24_lsb_scalar(&src[done * 4..], &mut dst[done * 3..]);
    }

    pub fn pack24_msb(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { pack24_msb_impl(src, dst) };
        super::pack24_msb_scalar(&src[done * 4..], &mut dst[done * 3..]);
    }
}

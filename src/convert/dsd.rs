//! DSD 内核
//!
//! 输入是交织的 32-bit DSD word，字节按时间顺序排列。
//! 每个内核都是直线循环，方向与字节序在选择内核时就已确定。
//! 所有函数要求 `src.len() == dst.len()` 且为 4 的倍数。

use super::lut::{reverse, BIT_REVERSE};

pub fn passthrough_scalar(src: &[u8], dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

pub fn bit_reverse_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = BIT_REVERSE[s as usize];
    }
}

pub fn byte_swap_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        d[0] = s[3];
        d[1] = s[2];
        d[2] = s[1];
        d[3] = s[0];
    }
}

pub fn bit_reverse_and_swap_scalar(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        d[0] = reverse(s[3]);
        d[1] = reverse(s[2]);
        d[2] = reverse(s[1]);
        d[3] = reverse(s[0]);
    }
}

/// AVX2：每组 32 字节（8 个 word），尾部交给标量路径
#[cfg(all(target_arch = "x86_64", target_endian = "little"))]
pub(crate) mod avx2 {
    use std::arch::x86_64::*;

    use super::super::lut::{REV_HI_NIBBLE_X2, REV_LO_NIBBLE_X2};

    const GROUP: usize = 32;

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn swap_mask() -> __m256i {
        _mm256_setr_epi8(
            3, 2, 1, 0, 7, 6, 5, 4, 11, 10, 9, 8, 15, 14, 13, 12, //
            3, 2, 1, 0, 7, 6, 5, 4, 11, 10, 9, 8, 15, 14, 13, 12,
        )
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn reverse_bits(v: __m256i, lo_tab: __m256i, hi_tab: __m256i, nibble: __m256i) -> __m256i {
        let lo = _mm256_and_si256(v, nibble);
        let hi = _mm256_and_si256(_mm256_srli_epi16::<4>(v), nibble);
        _mm256_or_si256(
            _mm256_shuffle_epi8(lo_tab, lo),
            _mm256_shuffle_epi8(hi_tab, hi),
        )
    }

    #[target_feature(enable = "avx2")]
    unsafe fn bit_reverse_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let lo_tab = _mm256_loadu_si256(REV_LO_NIBBLE_X2.as_ptr() as *const __m256i);
        let hi_tab = _mm256_loadu_si256(REV_HI_NIBBLE_X2.as_ptr() as *const __m256i);
        let nibble = _mm256_set1_epi8(0x0F);

        let mut i = 0;
        while i + GROUP <= src.len() {
            let v = _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i);
            let r = reverse_bits(v, lo_tab, hi_tab, nibble);
            _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, r);
            i += GROUP;
        }
        i
    }

    #[target_feature(enable = "avx2")]
    unsafe fn byte_swap_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let mask = swap_mask();

        let mut i = 0;
        while i + GROUP <= src.len() {
            let v = _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i);
            let r = _mm256_shuffle_epi8(v, mask);
            _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, r);
            i += GROUP;
        }
        i
    }

    #[target_feature(enable = "avx2")]
    unsafe fn bit_reverse_and_swap_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let lo_tab = _mm256_loadu_si256(REV_LO_NIBBLE_X2.as_ptr() as *const __m256i);
        let hi_tab = _mm256_loadu_si256(REV_HI_NIBBLE_X2.as_ptr() as *const __m256i);
        let nibble = _mm256_set1_epi8(0x0F);
        let mask = swap_mask();

        let mut i = 0;
        while i + GROUP <= src.len() {
            let v = _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i);
            let r = _mm256_shuffle_epi8(reverse_bits(v, lo_tab, hi_tab, nibble), mask);
            _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, r);
            i += GROUP;
        }
        i
    }

    // 以下入口只会在检测到 AVX2 之后被选中

    pub fn bit_reverse(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { bit_reverse_impl(src, dst) };
        super::bit_reverse_scalar(&src[done..], &mut dst[done..]);
    }

    pub fn byte_swap(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { byte_swap_impl(src, dst) };
        super::byte_swap_scalar(&src[done..], &mut dst[done..]);
    }

    pub fn bit_reverse_and_swap(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { bit_reverse_and_swap_impl(src, dst) };
        super::bit_reverse_and_swap_scalar(&src[done..], &mut dst[done..]);
    }
}

/// NEON：每组 32 字节（两个 q 寄存器，8 个 word）
#[cfg(all(target_arch = "aarch64", target_endian = "little"))]
pub(crate) mod neon {
    use std::arch::aarch64::*;

    const GROUP: usize = 32;

    #[target_feature(enable = "neon")]
    unsafe fn bit_reverse_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let mut i = 0;
        while i + GROUP <= src.len() {
            let a = vld1q_u8(src.as_ptr().add(i));
            let b = vld1q_u8(src.as_ptr().add(i + 16));
            vst1q_u8(dst.as_mut_ptr().add(i), vrbitq_u8(a));
            vst1q_u8(dst.as_mut_ptr().add(i + 16), vrbitq_u8(b));
            i += GROUP;
        }
        i
    }

    #[target_feature(enable = "neon")]
    unsafe fn byte_swap_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let mut i = 0;
        while i + GROUP <= src.len() {
            let a = vld1q_u8(src.as_ptr().add(i));
            let b = vld1q_u8(src.as_ptr().add(i + 16));
            vst1q_u8(dst.as_mut_ptr().add(i), vrev32q_u8(a));
            vst1q_u8(dst.as_mut_ptr().add(i + 16), vrev32q_u8(b));
            i += GROUP;
        }
        i
    }

    #[target_feature(enable = "neon")]
    unsafe fn bit_reverse_and_swap_impl(src: &[u8], dst: &mut [u8]) -> usize {
        let mut i = 0;
        while i + GROUP <= src.len() {
            let a = vld1q_u8(src.as_ptr().add(i));
            let b = vld1q_u8(src.as_ptr().add(i + 16));
            vst1q_u8(dst.as_mut_ptr().add(i), vrev32q_u8(vrbitq_u8(a)));
            vst1q_u8(dst.as_mut_ptr().add(i + 16), vrev32q_u8(vrbitq_u8(b)));
            i += GROUP;
        }
        i
    }

    pub fn bit_reverse(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { bit_reverse_impl(src, dst) };
        super::bit_reverse_scalar(&src[done..], &mut dst[done..]);
    }

    pub fn byte_swap(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { byte_swap_impl(src, dst) };
        super::byte_swap_scalar(&src[done..], &mut dst[done..]);
    }

    pub fn bit_reverse_and_swap(src: &[u8], dst: &mut [u8]) {
        let done = unsafe { bit_reverse_and_swap_impl(src, dst) };
        super::bit_reverse_and_swap_scalar(&src[done..], &mut dst[done..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_semantics() {
        let src = [0x01, 0x02, 0x03, 0x69, 0x80, 0x40, 0x20, 0x10];
        let mut dst = [0u8; 8];

        passthrough_scalar(&src, &mut dst);
        assert_eq!(dst, src);

        bit_reverse_scalar(&src, &mut dst);
        assert_eq!(dst, [0x80, 0x40, 0xC0, 0x96, 0x01, 0x02, 0x04, 0x08]);

        byte_swap_scalar(&src, &mut dst);
        assert_eq!(dst, [0x69, 0x03, 0x02, 0x01, 0x10, 0x20, 0x40, 0x80]);

        bit_reverse_and_swap_scalar(&src, &mut dst);
        assert_eq!(dst, [0x96, 0xC0, 0x40, 0x80, 0x08, 0x04, 0x02, 0x01]);
    }

    #[test]
    fn test_silence_pattern_survives_reversal() {
        // MSB-first 静音 0x69 在 LSB-first 下是 0x96
        let src = [0x69u8; 16];
        let mut dst = [0u8; 16];
        bit_reverse_and_swap_scalar(&src, &mut dst);
        assert!(dst.iter().all(|&b| b == 0x96));
    }
}

//! 位反转查找表
//!
//! 全局只有一张 256 项的表，标量路径直接查表，
//! SIMD 路径用的半字节表也在编译期从同一张表导出

const fn build_bit_reverse() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).reverse_bits();
        i += 1;
    }
    table
}

const TABLE: [u8; 256] = build_bit_reverse();

/// 字节位反转表：`BIT_REVERSE[b] == b.reverse_bits()`
pub static BIT_REVERSE: [u8; 256] = TABLE;

/// 取表中 `i << shift` 处的 16 项，两个 128-bit lane 各放一份
const fn nibble_table_x2(shift: u32) -> [u8; 32] {
    let mut table = [0u8; 32];
    let mut i = 0;
    while i < 16 {
        let v = TABLE[i << shift];
        table[i] = v;
        table[i + 16] = v;
        i += 1;
    }
    table
}

/// 低半字节 → 反转后的高半字节
#[cfg_attr(not(all(target_arch = "x86_64", target_endian = "little")), allow(dead_code))]
pub(crate) static REV_LO_NIBBLE_X2: [u8; 32] = nibble_table_x2(0);

/// 高半字节 → 反转后的低半字节
#[cfg_attr(not(all(target_arch = "x86_64", target_endian = "little")), allow(dead_code))]
pub(crate) static REV_HI_NIBBLE_X2: [u8; 32] = nibble_table_x2(4);

#[inline(always)]
pub fn reverse(b: u8) -> u8 {
    BIT_REVERSE[b as usize]
}

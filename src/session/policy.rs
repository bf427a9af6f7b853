//! 格式切换策略表
//!
//! 按 (旧格式类别, 新格式类别) 查表，时钟族改变一律完全重开：
//! transport 侧残留的半冲刷数据在新时钟域下会变成可闻的杂音。

use std::fmt;

use crate::audio::format::{ClockFamily, FormatClass, SourceFormat};

/// 格式切换策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReopenStrategy {
    /// 格式不变：只清空环，跳过稳定延迟
    QuickResume,
    /// 同一时钟域：不释放 transport，重新协商并调整环
    LightReopen,
    /// 时钟域改变：静音冲刷、停止、释放、等待、重新获取
    FullReopen,
}

impl fmt::Display for ReopenStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QuickResume => "quick resume",
            Self::LightReopen => "light reopen",
            Self::FullReopen => "full reopen",
        };
        f.write_str(name)
    }
}

/// 类别策略表
pub fn class_strategy(old: FormatClass, new: FormatClass) -> ReopenStrategy {
    use ClockFamily::{Base44k1 as K44, Base48k as K48};
    use FormatClass::{Dsd, Pcm};
    use ReopenStrategy::{FullReopen, LightReopen};

    match (old, new) {
        (Pcm(K44), Pcm(K44)) => LightReopen,
        (Pcm(K44), Pcm(K48)) => FullReopen,
        (Pcm(K44), Dsd(K44)) => FullReopen,
        (Pcm(K44), Dsd(K48)) => FullReopen,
        (Pcm(K48), Pcm(K44)) => FullReopen,
        (Pcm(K48), Pcm(K48)) => LightReopen,
        (Pcm(K48), Dsd(K44)) => FullReopen,
        (Pcm(K48), Dsd(K48)) => FullReopen,
        (Dsd(K44), Pcm(K44)) => FullReopen,
        (Dsd(K44), Pcm(K48)) => FullReopen,
        (Dsd(K44), Dsd(K44)) => LightReopen,
        (Dsd(K44), Dsd(K48)) => FullReopen,
        (Dsd(K48), Pcm(K44)) => FullReopen,
        (Dsd(K48), Pcm(K48)) => FullReopen,
        (Dsd(K48), Dsd(K44)) => FullReopen,
        (Dsd(K48), Dsd(K48)) => LightReopen,
    }
}

/// 完全相同的格式走快速恢复，其余查表
pub fn choose(old: &SourceFormat, new: &SourceFormat) -> ReopenStrategy {
    if old == new {
        ReopenStrategy::QuickResume
    } else {
        class_strategy(old.class(), new.class())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::BitOrder;

    const CLASSES: [FormatClass; 4] = [
        FormatClass::Pcm(ClockFamily::Base44k1),
        FormatClass::Pcm(ClockFamily::Base48k),
        FormatClass::Dsd(ClockFamily::Base44k1),
        FormatClass::Dsd(ClockFamily::Base48k),
    ];

    #[test]
    fn test_table_is_light_only_on_diagonal() {
        for old in CLASSES {
            for new in CLASSES {
                let expected = if old == new {
                    ReopenStrategy::LightReopen
                } else {
                    ReopenStrategy::FullReopen
                };
                assert_eq!(class_strategy(old, new), expected, "{} -> {}", old, new);
            }
        }
    }

    #[test]
    fn test_choose_from_formats() {
        let cd = SourceFormat::pcm(44_100, 2, 16);
        assert_eq!(choose(&cd, &cd), ReopenStrategy::QuickResume);

        // 同族不同倍率，或位深变化
        assert_eq!(choose(&cd, &SourceFormat::pcm(88_200, 2, 24)), ReopenStrategy::LightReopen);
        assert_eq!(choose(&cd, &SourceFormat::pcm(44_100, 2, 24)), ReopenStrategy::LightReopen);
        assert_eq!(choose(&cd, &SourceFormat::pcm(48_000, 2, 16)), ReopenStrategy::FullReopen);

        let dsd64 = SourceFormat::dsd(2_822_400, 2, BitOrder::LsbFirst);
        let dsd128 = SourceFormat::dsd(5_644_800, 2, BitOrder::LsbFirst);
        let dsd_48 = SourceFormat::dsd(3_072_000, 2, BitOrder::LsbFirst);
        assert_eq!(choose(&dsd64, &dsd128), ReopenStrategy::LightReopen);
        assert_eq!(choose(&dsd64, &dsd_48), ReopenStrategy::FullReopen);
        assert_eq!(choose(&cd, &dsd64), ReopenStrategy::FullReopen);
        assert_eq!(choose(&dsd64, &cd), ReopenStrategy::FullReopen);
    }
}

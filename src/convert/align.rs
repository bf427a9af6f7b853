//! 24-bit 容器对齐检测
//!
//! 4 字节容器里的 3 个有效字节可能在低位（符号扩展的 i32），
//! 也可能在高位（左移 8 位）。逐个检查非静音样本：
//! - 高位对齐时最低字节恒为 0
//! - 低位对齐时最高字节是第 3 字节的符号扩展
//!
//! 只有排他性的证据才计票。前导静音不计票；
//! 检查过的样本数超过上限仍未判定时回退到低位对齐。

/// 24-bit 有效字节在 32-bit 容器中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pack24Align {
    Lsb,
    Msb,
}

impl Pack24Align {
    /// 超时回退值
    pub const FALLBACK: Self = Self::Lsb;
}

/// 判定理由
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignReason {
    Votes { lsb: u32, msb: u32 },
    Timeout,
}

/// 判定所需票数
const DECISION_VOTES: u32 = 16;

#[derive(Debug, Clone)]
pub struct AlignmentDetector {
    lsb_votes: u32,
    msb_votes: u32,
    inspected: u64,
    timeout_samples: u64,
    decision: Option<(Pack24Align, AlignReason)>,
}

impl AlignmentDetector {
    /// `timeout_samples`: 最多检查多少个样本（按单个声道样本计）
    pub fn new(timeout_samples: u64) -> Self {
        Self {
            lsb_votes: 0,
            msb_votes: 0,
            inspected: 0,
            timeout_samples: timeout_samples.max(1),
            decision: None,
        }
    }

    pub fn decision(&self) -> Option<(Pack24Align, AlignReason)> {
        self.decision
    }

    /// 检查一批 4 字节小端样本，一旦判定就返回结果
    pub fn observe(&mut self, words: &[u8]) -> Option<Pack24Align> {
        if let Some((align, _)) = self.decision {
            return Some(align);
        }

        for w in words.chunks_exact(4) {
            self.inspected += 1;
            if w == [0, 0, 0, 0] {
                continue;
            }

            let msb_like = w[0] == 0;
            let sign = if w[2] & 0x80 != 0 { 0xFF } else { 0x00 };
            let lsb_like = w[3] == sign;

            match (lsb_like, msb_like) {
                (true, false) => self.lsb_votes += 1,
                (false, true) => self.msb_votes += 1,
                _ => {}
            }

            if self.lsb_votes >= DECISION_VOTES || self.msb_votes >= DECISION_VOTES {
                let align = if self.lsb_votes >= DECISION_VOTES {
                    Pack24Align::Lsb
                } else {
                    Pack24Align::Msb
                };
                return Some(self.decide(
                    align,
                    AlignReason::Votes {
                        lsb: self.lsb_votes,
                        msb: self.msb_votes,
                    },
                ));
            }
        }

        if self.inspected >= self.timeout_samples {
            return Some(self.decide(Pack24Align::FALLBACK, AlignReason::Timeout));
        }
        None
    }

    fn decide(&mut self, align: Pack24Align, reason: AlignReason) -> Pack24Align {
        self.decision = Some((align, reason));
        align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
        values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_detects_lsb_aligned() {
        let mut det = AlignmentDetector::new(1_000_000);
        let data = words((1..=32).map(|i| i * 200_000 - 3_300_000));
        assert_eq!(det.observe(&data), Some(Pack24Align::Lsb));
        assert!(matches!(det.decision(), Some((_, AlignReason::Votes { .. }))));
    }

    #[test]
    fn test_quiet_msb_samples_are_ambiguous() {
        // 幅度低于 2^15 时高位对齐的样本同样满足符号扩展
        let mut det = AlignmentDetector::new(1_000_000);
        let data = words((1..=32).map(|i| (i * 500) << 8));
        assert_eq!(det.observe(&data), None);
    }

    #[test]
    fn test_detects_msb_aligned() {
        let mut det = AlignmentDetector::new(1_000_000);
        let data = words((1..=32).map(|i| (i * 200_000 - 3_300_000) << 8));
        assert_eq!(det.observe(&data), Some(Pack24Align::Msb));
    }

    #[test]
    fn test_defers_during_silence() {
        let mut det = AlignmentDetector::new(1_000);
        let silence = words(std::iter::repeat(0).take(500));
        assert_eq!(det.observe(&silence), None);

        let signal = words((1..=20).map(|i| (i * 100_003) << 8));
        assert_eq!(det.observe(&signal), Some(Pack24Align::Msb));
    }

    #[test]
    fn test_timeout_falls_back() {
        let mut det = AlignmentDetector::new(100);
        let silence = words(std::iter::repeat(0).take(60));
        assert_eq!(det.observe(&silence), None);
        assert_eq!(det.observe(&silence), Some(Pack24Align::FALLBACK));
        assert_eq!(det.decision(), Some((Pack24Align::Lsb, AlignReason::Timeout)));
        // 判定后不再改变
        let signal = words((1..=20).map(|i| (i * 100_003) << 8));
        assert_eq!(det.observe(&signal), Some(Pack24Align::Lsb));
    }

    #[test]
    fn test_ambiguous_samples_do_not_vote() {
        // -256 = 0xFFFFFF00：两种解释都成立
        let mut det = AlignmentDetector::new(1_000);
        let data = words(std::iter::repeat(-256).take(100));
        assert_eq!(det.observe(&data), None);
    }
}

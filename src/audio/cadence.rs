//! 整数帧节拍
//!
//! 每个时间片推送的帧数用 Bresenham 式累加器计算：
//! 44100 Hz、每秒 1000 片时输出九个 44 帧和一个 45 帧，
//! 任意连续 10 片之和恰好是 441 帧，没有浮点漂移。

/// 帧节拍累加器
#[derive(Clone, Debug)]
pub struct FrameCadence {
    frames_per_second: u32,
    ticks_per_second: u32,
    acc: u64,
}

impl FrameCadence {
    pub fn new(frames_per_second: u32, ticks_per_second: u32) -> Self {
        Self {
            frames_per_second,
            ticks_per_second: ticks_per_second.max(1),
            acc: 0,
        }
    }

    /// 下一个时间片应推送的帧数
    #[inline]
    pub fn next_frames(&mut self) -> u32 {
        self.acc += self.frames_per_second as u64;
        let frames = self.acc / self.ticks_per_second as u64;
        self.acc -= frames * self.ticks_per_second as u64;
        frames as u32
    }

    /// 换格式时重置累加器
    pub fn retune(&mut self, frames_per_second: u32) {
        self.frames_per_second = frames_per_second;
        self.acc = 0;
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }
}

//! 样本来源
//!
//! 会话不解码：来源交出已解码的字节和格式描述。
//! - `SymphoniaSource`: 用 symphonia 解码文件，输出平面布局
//! - `MemorySource`: 预先准备好的块
//! - `ToneSource`: 生成正弦（PCM）或一阶 Σ-Δ 调制的 DSD
//! - `Playlist`: 依次播放多个来源，可随机排序

pub mod decoder;

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::path::PathBuf;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::audio::format::{BitOrder, SampleEncoding, SourceFormat, StreamKind};

pub use decoder::SymphoniaSource;

/// 来源错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("decode failed: {0}")]
    Decode(String),
}

/// 一块已解码数据
#[derive(Debug, Clone)]
pub struct SourceBlock {
    pub format: SourceFormat,
    /// 交织或平面（每个平面 `frames` 帧）
    pub data: Vec<u8>,
    pub frames: usize,
    /// 新曲目的第一块
    pub track_start: bool,
}

impl SourceBlock {
    pub fn new(format: SourceFormat, data: Vec<u8>) -> Self {
        let frames = data.len() / format.bytes_per_frame().max(1);
        Self {
            format,
            data,
            frames,
            track_start: false,
        }
    }

    /// 所有声道的样本总数
    pub fn sample_count(&self) -> usize {
        self.frames * self.format.channels as usize
    }
}

/// 解码器一侧的拉取接口
pub trait SampleSource: Send {
    /// 下一块数据，结束时返回 None
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
        (**self).next_block()
    }
}

/// 内存中的块序列
#[derive(Debug, Default)]
pub struct MemorySource {
    blocks: VecDeque<SourceBlock>,
}

impl MemorySource {
    pub fn new(blocks: impl IntoIterator<Item = SourceBlock>) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
        }
    }

    /// 把交织数据切成每块 `frames_per_block` 帧
    pub fn chunked(format: SourceFormat, data: &[u8], frames_per_block: usize) -> Self {
        let step = format.bytes_per_frame().max(1) * frames_per_block.max(1);
        Self::new(
            data.chunks(step)
                .map(|chunk| SourceBlock::new(format, chunk.to_vec())),
        )
    }

    pub fn push(&mut self, block: SourceBlock) {
        self.blocks.push_back(block);
    }

    pub fn remaining(&self) -> usize {
        self.blocks.len()
    }
}

impl SampleSource for MemorySource {
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
        Ok(self.blocks.pop_front())
    }
}

/// 测试信号发生器
///
/// PCM 输出交织的小端样本（16/24/32 位整数或 f32）；
/// DSD 输出每声道 32-bit word 交织，字节按时间顺序，位序由格式决定
pub struct ToneSource {
    format: SourceFormat,
    frequency: f64,
    amplitude: f64,
    remaining_frames: u64,
    block_frames: usize,
    phase: f64,
    integrator: Vec<f64>,
}

impl ToneSource {
    /// `duration_frames` 为总帧数（DSD 为 32 位 word 数）
    pub fn new(format: SourceFormat, frequency: f64, duration_frames: u64) -> Self {
        Self {
            format,
            frequency,
            amplitude: 0.5,
            remaining_frames: duration_frames,
            block_frames: 1024,
            phase: 0.0,
            integrator: vec![0.0; format.channels as usize],
        }
    }

    /// 按秒数计算总帧数
    pub fn with_seconds(format: SourceFormat, frequency: f64, seconds: f64) -> Self {
        let frames = (format.frames_per_second() as f64 * seconds).round() as u64;
        Self::new(format, frequency, frames)
    }

    pub fn amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    pub fn block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    fn render_pcm(&mut self, frames: usize, out: &mut Vec<u8>) {
        let step = TAU * self.frequency / self.format.sample_rate as f64;
        let bits = self.format.bits_per_sample.clamp(8, 32) as i32;
        let peak = ((1i64 << (bits - 1)) - 1) as f64 * self.amplitude;
        let container = self.format.container_bytes as usize;

        let float = self.format.encoding == SampleEncoding::Float;

        for _ in 0..frames {
            let level = self.phase.sin();
            self.phase = (self.phase + step) % TAU;
            let bytes = if float {
                ((level * self.amplitude) as f32).to_le_bytes()
            } else {
                ((level * peak).round() as i32).to_le_bytes()
            };
            for _ in 0..self.format.channels {
                out.extend_from_slice(&bytes[..container.min(4)]);
            }
        }
    }

    fn render_dsd(&mut self, frames: usize, order: BitOrder, out: &mut Vec<u8>) {
        let step = TAU * self.frequency / self.format.sample_rate as f64;
        let channels = self.format.channels as usize;
        let mut words = vec![0u32; channels];

        for _ in 0..frames {
            words.fill(0);
            for bit in 0..32 {
                let target = self.phase.sin() * self.amplitude;
                self.phase = (self.phase + step) % TAU;
                for (ch, word) in words.iter_mut().enumerate() {
                    // 一阶 Σ-Δ：积分误差，按符号输出 ±1
                    let one = self.integrator[ch] >= 0.0;
                    let output = if one { 1.0 } else { -1.0 };
                    self.integrator[ch] += target - output;
                    if one {
                        *word |= 1 << (31 - bit);
                    }
                }
            }
            for &word in &words {
                let mut bytes = word.to_be_bytes();
                if order == BitOrder::LsbFirst {
                    for b in &mut bytes {
                        *b = b.reverse_bits();
                    }
                }
                out.extend_from_slice(&bytes);
            }
        }
    }
}

impl SampleSource for ToneSource {
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
        if self.remaining_frames == 0 {
            return Ok(None);
        }
        let frames = (self.block_frames as u64).min(self.remaining_frames) as usize;
        self.remaining_frames -= frames as u64;

        let mut data = Vec::with_capacity(frames * self.format.bytes_per_frame());
        match self.format.kind {
            StreamKind::Pcm => self.render_pcm(frames, &mut data),
            StreamKind::Dsd(order) => self.render_dsd(frames, order, &mut data),
        }
        Ok(Some(SourceBlock::new(self.format, data)))
    }
}

/// 播放列表中的一项
pub enum Track {
    File(PathBuf),
    Source(Box<dyn SampleSource>),
}

/// 依次播放各项；打不开的文件记录后跳过
#[derive(Default)]
pub struct Playlist {
    tracks: VecDeque<Track>,
    current: Option<Box<dyn SampleSource>>,
    /// 当前曲目还没交出过块
    fresh: bool,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            tracks: paths.into_iter().map(Track::File).collect(),
            current: None,
            fresh: false,
        }
    }

    pub fn push_file(&mut self, path: impl Into<PathBuf>) {
        self.tracks.push_back(Track::File(path.into()));
    }

    pub fn push_source(&mut self, source: impl SampleSource + 'static) {
        self.tracks.push_back(Track::Source(Box::new(source)));
    }

    /// 打乱尚未开始的曲目
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.tracks.make_contiguous().shuffle(rng);
    }

    pub fn len(&self) -> usize {
        self.tracks.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn advance(&mut self) -> bool {
        while let Some(track) = self.tracks.pop_front() {
            match track {
                Track::Source(source) => {
                    self.current = Some(source);
                    self.fresh = true;
                    return true;
                }
                Track::File(path) => match SymphoniaSource::open(&path) {
                    Ok(source) => {
                        log::info!("Now playing: {}", path.display());
                        self.current = Some(Box::new(source));
                        self.fresh = true;
                        return true;
                    }
                    Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
                },
            }
        }
        false
    }
}

impl SampleSource for Playlist {
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
        loop {
            if self.current.is_none() && !self.advance() {
                return Ok(None);
            }
            let Some(current) = self.current.as_mut() else {
                return Ok(None);
            };
            match current.next_block()? {
                Some(mut block) => {
                    block.track_start |= std::mem::take(&mut self.fresh);
                    return Ok(Some(block));
                }
                None => self.current = None,
            }
        }
    }
}

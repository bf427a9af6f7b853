//! 音频文件解码
//!
//! 使用 symphonia 解码 FLAC/WAV/AIFF/MP3，按声道平面输出小端字节：
//! - 整数直通：S16/S32 原样，S24 左对齐进 32-bit 容器
//! - 浮点统一为 f32
//! - 8-bit 扩成 16-bit，无符号格式翻转符号位

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;

use crate::audio::format::SourceFormat;

use super::{SampleSource, SourceBlock, SourceError};

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 原始位深（容器声明）
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器名（取扩展名）
    pub format: String,
    pub codec: String,
    /// 非 PCM 编码
    pub compressed: bool,
}

/// symphonia 解码来源
pub struct SymphoniaSource {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    finished: bool,
}

impl SymphoniaSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| SourceError::Unsupported(e.to_string()))?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(SourceError::NoAudioTrack)?;

        let track_id = track.id;
        let params = &track.codec_params;
        let sample_rate = params.sample_rate.ok_or(SourceError::NoAudioTrack)?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: params.bits_per_sample,
            total_frames: params.n_frames,
            duration_secs: params.n_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            compressed: !codec.starts_with("pcm"),
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| SourceError::Unsupported(e.to_string()))?;

        log::debug!(
            "Opened {}: {} {}Hz {}ch {:?}bit",
            path.display(),
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            finished: false,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn mark(&self, format: SourceFormat) -> SourceFormat {
        if self.info.compressed {
            format.compressed()
        } else {
            format
        }
    }
}

impl SampleSource for SymphoniaSource {
    fn next_block(&mut self) -> Result<Option<SourceBlock>, SourceError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(None);
                }
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 损坏的帧跳过
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(SourceError::Decode(e.to_string())),
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let rate = decoded.spec().rate;
            let channels = decoded.spec().channels.count() as u16;

            let (format, data) = match decoded {
                AudioBufferRef::S16(buf) => (
                    SourceFormat::pcm(rate, channels, 16),
                    planes(&buf, 2, |s, out| out.extend_from_slice(&s.to_le_bytes())),
                ),
                AudioBufferRef::S24(buf) => (
                    SourceFormat::pcm(rate, channels, 24).with_container(4),
                    planes(&buf, 4, |s, out| out.extend_from_slice(&(s.inner() << 8).to_le_bytes())),
                ),
                AudioBufferRef::S32(buf) => (
                    SourceFormat::pcm(rate, channels, 32),
                    planes(&buf, 4, |s, out| out.extend_from_slice(&s.to_le_bytes())),
                ),
                AudioBufferRef::F32(buf) => (
                    SourceFormat::pcm_float(rate, channels),
                    planes(&buf, 4, |s, out| out.extend_from_slice(&s.to_le_bytes())),
                ),
                AudioBufferRef::F64(buf) => (
                    SourceFormat::pcm_float(rate, channels),
                    planes(&buf, 4, |s, out| out.extend_from_slice(&(s as f32).to_le_bytes())),
                ),
                AudioBufferRef::U8(buf) => (
                    SourceFormat::pcm(rate, channels, 16),
                    planes(&buf, 2, |s, out| {
                        out.extend_from_slice(&(((s as i16) - 128) << 8).to_le_bytes())
                    }),
                ),
                AudioBufferRef::S8(buf) => (
                    SourceFormat::pcm(rate, channels, 16),
                    planes(&buf, 2, |s, out| out.extend_from_slice(&((s as i16) << 8).to_le_bytes())),
                ),
                AudioBufferRef::U16(buf) => (
                    SourceFormat::pcm(rate, channels, 16),
                    planes(&buf, 2, |s, out| out.extend_from_slice(&(s ^ 0x8000).to_le_bytes())),
                ),
                AudioBufferRef::U24(buf) => (
                    SourceFormat::pcm(rate, channels, 24).with_container(4),
                    planes(&buf, 4, |s, out| {
                        let signed = s.inner() as i32 - 0x80_0000;
                        out.extend_from_slice(&(signed << 8).to_le_bytes())
                    }),
                ),
                AudioBufferRef::U32(buf) => (
                    SourceFormat::pcm(rate, channels, 32),
                    planes(&buf, 4, |s, out| out.extend_from_slice(&(s ^ 0x8000_0000).to_le_bytes())),
                ),
            };

            let format = self.mark(format.planar());
            return Ok(Some(SourceBlock {
                format,
                data,
                frames,
                track_start: false,
            }));
        }
    }
}

/// 逐声道写出平面字节
fn planes<S: Sample>(buf: &AudioBuffer<S>, bytes_per_sample: usize, mut put: impl FnMut(S, &mut Vec<u8>)) -> Vec<u8> {
    let channels = buf.spec().channels.count();
    let mut out = Vec::with_capacity(buf.frames() * channels * bytes_per_sample);
    for ch in 0..channels {
        for &sample in buf.chan(ch) {
            put(sample, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file() {
        let err = SymphoniaSource::open("/nonexistent/audio.flac").err().unwrap();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    #[ignore] // 需要实际音频文件
    fn test_decode_flac() {
        let mut source = SymphoniaSource::open("test.flac").unwrap();
        let block = source.next_block().unwrap().unwrap();
        assert!(block.format.compressed);
        assert_eq!(block.data.len(), block.frames * block.format.bytes_per_frame());
    }
}

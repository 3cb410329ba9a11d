/// 视频输入系统 (Frame Source Adapter)
///
/// 把外部视频传输包装成带时间戳的帧序列:
/// - SyntheticSource:    合成测试画面 (确定性运动目标)
/// - ImageDirSource:     图片序列目录
/// - FfmpegSource:       RTSP/摄像头/文件解码 (ffmpeg 功能)
/// - ReconnectingSource: 源丢失后有限次自动重连
/// - egress:             标注帧输出 (只保留最新一帧)
pub mod egress;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod image_dir;
pub mod reconnect;
pub mod synthetic;

pub use egress::{annotate, FrameSink, LatestFrameSlot, SharedMemorySink};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use image_dir::ImageDirSource;
pub use reconnect::ReconnectingSource;
pub use synthetic::SyntheticSource;

use std::sync::Arc;
use std::time::Duration;

use image::{GrayImage, RgbImage, RgbaImage};

use crate::config::SourceConfig;
use crate::error::{FlowError, Result};

/// 视频帧 (只读采集单元)
///
/// 像素以 RGBA8 存储, `Arc` 共享避免在各线程之间复制.
#[derive(Clone)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    pub rgba_data: Arc<Vec<u8>>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("timestamp", &self.timestamp)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .finish()
    }
}

impl Frame {
    pub fn new(
        seq: u64,
        timestamp: Duration,
        width: u32,
        height: u32,
        rgba_data: Vec<u8>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba_data.len() != expected {
            return Err(FlowError::SourceUnavailable(format!(
                "malformed frame {}x{} with {} bytes",
                width,
                height,
                rgba_data.len()
            )));
        }
        Ok(Self {
            seq,
            timestamp,
            width,
            height,
            rgba_data: Arc::new(rgba_data),
        })
    }

    pub fn from_rgba_image(seq: u64, timestamp: Duration, img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            seq,
            timestamp,
            width,
            height,
            rgba_data: Arc::new(img.into_raw()),
        }
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.rgba_data.as_ref().clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    /// RGBA → RGB (JPEG 不支持 alpha)
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for chunk in self.rgba_data.chunks_exact(4) {
            rgb.extend_from_slice(&chunk[..3]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// RGBA → 灰度 (BT.601 亮度, 定点运算保证结果确定)
    pub fn to_gray_image(&self) -> GrayImage {
        let luma: Vec<u8> = self
            .rgba_data
            .chunks_exact(4)
            .map(|p| ((p[0] as u32 * 77 + p[1] as u32 * 150 + p[2] as u32 * 29) >> 8) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, luma)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

/// `next_frame` 的结果
#[derive(Debug)]
pub enum SourceEvent {
    Frame(Frame),
    /// 超时内没有新帧 (源仍然存活)
    Timeout,
    /// 有限源读完
    EndOfStream,
}

/// 帧源接口
///
/// `next_frame` 是唯一的阻塞点: 阻塞直到有帧或超时.
/// 源断开时返回 `FlowError::SourceUnavailable`.
pub trait FrameSource: Send {
    fn source_id(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn next_frame(&mut self, timeout: Duration) -> Result<SourceEvent>;

    fn close(&mut self);

    /// 实时源在下游繁忙时丢帧, 非实时源 (文件/合成) 阻塞等待
    fn is_live(&self) -> bool {
        true
    }
}

/// 按源ID打开帧源 (带自动重连)
///
/// 支持的源ID:
/// - `synthetic:<W>x<H>[@<fps>][/<frames>][+still]`
/// - `dir:<path>`
/// - `ffmpeg:<url>` (需要 `ffmpeg` 功能)
pub fn open_source(source_id: &str, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let inner: Box<dyn FrameSource> = if let Some(spec) = source_id.strip_prefix("synthetic:") {
        Box::new(SyntheticSource::parse(spec)?)
    } else if let Some(path) = source_id.strip_prefix("dir:") {
        Box::new(ImageDirSource::new(path))
    } else if let Some(url) = source_id.strip_prefix("ffmpeg:") {
        open_ffmpeg(url)?
    } else {
        return Err(FlowError::Config(format!("unrecognised source id '{}'", source_id)));
    };

    let mut source = ReconnectingSource::new(
        inner,
        config.reconnect_attempts,
        Duration::from_millis(config.reconnect_backoff_ms),
    );
    source.open()?;
    Ok(Box::new(source))
}

#[cfg(feature = "ffmpeg")]
fn open_ffmpeg(url: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(FfmpegSource::new(url)))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_ffmpeg(url: &str) -> Result<Box<dyn FrameSource>> {
    Err(FlowError::Config(format!(
        "source '{}' needs the `ffmpeg` feature",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_bad_buffer() {
        assert!(Frame::new(1, Duration::ZERO, 2, 2, vec![0; 15]).is_err());
        assert!(Frame::new(1, Duration::ZERO, 2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_gray_conversion() {
        let frame = Frame::new(1, Duration::ZERO, 2, 1, vec![255, 255, 255, 255, 0, 0, 0, 255])
            .unwrap();
        let gray = frame.to_gray_image();
        assert_eq!(gray.get_pixel(0, 0).0[0], 255);
        assert_eq!(gray.get_pixel(1, 0).0[0], 0);
        assert_eq!(frame.to_rgb_image().as_raw(), &vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_open_source_rejects_unknown_scheme() {
        let err = open_source("ndi:Studio", &SourceConfig::default()).err().unwrap();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_open_synthetic() {
        let mut source = open_source("synthetic:64x48/3", &SourceConfig::default()).unwrap();
        let mut seqs = Vec::new();
        loop {
            match source.next_frame(Duration::from_millis(100)).unwrap() {
                SourceEvent::Frame(f) => seqs.push(f.seq),
                SourceEvent::EndOfStream => break,
                SourceEvent::Timeout => {}
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}

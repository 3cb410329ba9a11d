//! 标注帧输出 (ingress 的只写兄弟)
//!
//! 只保留最近一帧, 不缓存历史.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::Rgba;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use memmap2::MmapMut;
use tracing::{debug, info};

use super::Frame;
use crate::control::{ControlChannel, ControlMessage};
use crate::detection::{BBox, Detection};
use crate::error::{FlowError, Result};

/// 输出接口
pub trait FrameSink: Send {
    fn publish(&mut self, frame: &Frame) -> Result<()>;
}

/// 进程内最新帧槽位 (可克隆, 读写两端共享)
#[derive(Clone, Default)]
pub struct LatestFrameSlot {
    slot: Arc<Mutex<Option<Frame>>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }
}

impl FrameSink for LatestFrameSlot {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| FlowError::WriteFailure("frame slot poisoned".into()))?;
        *slot = Some(frame.clone());
        Ok(())
    }
}

// ========== 共享内存布局 ==========
// 0..4   magic "YFLW"
// 4..12  seq (u64 LE, 像素写完后最后更新)
// 12..16 width  (u32 LE)
// 16..20 height (u32 LE)
// 20..24 channels (u32 LE, 固定为4)
// 24..32 保留
// 32..   RGBA 像素
pub const SHM_MAGIC: &[u8; 4] = b"YFLW";
pub const SHM_HEADER_LEN: usize = 32;
const CHANNELS: u32 = 4;

/// 文件映射共享内存输出
///
/// 尺寸变化时重建映射, 并通过控制通道发送 `/yoloflow/memory` 通知宿主.
pub struct SharedMemorySink {
    path: PathBuf,
    map: Option<MmapMut>,
    geometry: (u32, u32),
    announcer: Option<Arc<dyn ControlChannel>>,
}

impl SharedMemorySink {
    pub fn new(path: impl AsRef<Path>, announcer: Option<Arc<dyn ControlChannel>>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            map: None,
            geometry: (0, 0),
            announcer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(&mut self, width: u32, height: u32) -> Result<()> {
        self.map = None;
        let len = SHM_HEADER_LEN + width as usize * height as usize * CHANNELS as usize;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.set_len(len as u64)?;
        // SAFETY: 映射文件由本进程独占写入; 读者只通过 header 中的 seq 判断新帧
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[0..4].copy_from_slice(SHM_MAGIC);
        map[4..12].copy_from_slice(&0u64.to_le_bytes());
        map[12..16].copy_from_slice(&width.to_le_bytes());
        map[16..20].copy_from_slice(&height.to_le_bytes());
        map[20..24].copy_from_slice(&CHANNELS.to_le_bytes());
        self.map = Some(map);
        self.geometry = (width, height);

        info!(
            "📺 共享内存输出 {} ({}x{})",
            self.path.display(),
            width,
            height
        );
        if let Some(channel) = &self.announcer {
            channel.send(ControlMessage::Memory {
                path: self.path.display().to_string(),
                width,
                height,
                channels: CHANNELS,
            });
        }
        Ok(())
    }
}

impl FrameSink for SharedMemorySink {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        if self.map.is_none() || self.geometry != (frame.width, frame.height) {
            self.remap(frame.width, frame.height)?;
        }
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| FlowError::WriteFailure("shared memory not mapped".into()))?;
        let pixels = frame.rgba_data.as_slice();
        map[SHM_HEADER_LEN..SHM_HEADER_LEN + pixels.len()].copy_from_slice(pixels);
        map[4..12].copy_from_slice(&frame.seq.to_le_bytes());
        debug!("共享内存帧 #{}", frame.seq);
        Ok(())
    }
}

const REGION_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const DETECTION_COLOR: Rgba<u8> = Rgba([255, 160, 0, 255]);

fn to_rect(b: &BBox, width: u32, height: u32) -> Option<Rect> {
    let c = b.clamp_to(width, height)?;
    let w = c.w.round() as u32;
    let h = c.h.round() as u32;
    (w > 0 && h > 0).then(|| Rect::at(c.x.round() as i32, c.y.round() as i32).of_size(w, h))
}

/// 在帧上绘制追踪框 (绿色, 双线) 和检测框 (橙色)
pub fn annotate(frame: &Frame, region: Option<BBox>, detections: &[Detection]) -> Frame {
    let mut img = frame.to_rgba_image();
    let (w, h) = (frame.width, frame.height);
    for det in detections {
        if let Some(rect) = to_rect(&det.bbox, w, h) {
            draw_hollow_rect_mut(&mut img, rect, DETECTION_COLOR);
        }
    }
    if let Some(region) = region {
        if let Some(rect) = to_rect(&region, w, h) {
            draw_hollow_rect_mut(&mut img, rect, REGION_COLOR);
        }
        let inner = BBox::new(region.x + 1.0, region.y + 1.0, region.w - 2.0, region.h - 2.0);
        if let Some(inner) = to_rect(&inner, w, h) {
            draw_hollow_rect_mut(&mut img, inner, REGION_COLOR);
        }
    }
    Frame::from_rgba_image(frame.seq, frame.timestamp, img)
}

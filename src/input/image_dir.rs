//! 图片序列目录源 (按文件名排序逐帧读取)

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Frame, FrameSource, SourceEvent};
use crate::error::{FlowError, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 时间戳使用的名义帧率
const NOMINAL_FPS: f64 = 30.0;

pub struct ImageDirSource {
    id: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    seq: u64,
}

impl ImageDirSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            id: format!("dir:{}", dir.display()),
            dir,
            files: Vec::new(),
            cursor: 0,
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// 目录下所有图片文件, 按文件名排序
pub(crate) fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    files.sort();
    Ok(files)
}

pub(crate) fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageDirSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<()> {
        let files = list_images(&self.dir)
            .map_err(|e| FlowError::SourceUnavailable(format!("{}: {}", self.id, e)))?;
        if files.is_empty() {
            return Err(FlowError::SourceUnavailable(format!(
                "{}: no images found",
                self.id
            )));
        }
        debug!("📂 图片序列 {} 共 {} 帧", self.dir.display(), files.len());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<SourceEvent> {
        while let Some(path) = self.files.get(self.cursor) {
            self.cursor += 1;
            let img = match image::open(path) {
                Ok(img) => img.to_rgba8(),
                Err(e) => {
                    // 坏文件跳过, 序列继续
                    warn!("⚠️ 跳过无法解码的图片 {}: {}", path.display(), e);
                    continue;
                }
            };
            self.seq += 1;
            let timestamp = Duration::from_secs_f64((self.seq - 1) as f64 / NOMINAL_FPS);
            return Ok(SourceEvent::Frame(Frame::from_rgba_image(
                self.seq, timestamp, img,
            )));
        }
        Ok(SourceEvent::EndOfStream)
    }

    fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }

    fn is_live(&self) -> bool {
        false
    }
}

//! 数据集写入 (Dataset Writer)
//!
//! 目录结构: `<root>/<class_name>/<base>.jpg` + `<base>.txt`
//! 背景样本 (画面里没有目标, 标签为空) 放在 `<root>/_background/`.
//!
//! 写入顺序: 图片临时文件 → fsync → 标签临时文件 → fsync → 图片改名 → 标签改名.
//! 标签文件是样本的提交标记: 只有标签存在的图片才算样本;
//! 崩溃留下的临时文件和孤立图片由 `recover` 清理.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::{debug, info, warn};

use super::label::Label;
use super::registry::SharedRegistry;
use crate::detection::BBox;
use crate::error::{FlowError, Result};
use crate::gen_time_string;
use crate::input::Frame;

pub const IMAGE_EXT: &str = "jpg";
pub const LABEL_EXT: &str = "txt";
/// 背景样本目录 (以 `_` 开头的名字不能注册为类别)
pub const BACKGROUND_DIR: &str = "_background";
const TMP_EXT: &str = "tmp";

/// 进程内会话计数 (同一毫秒内启动的会话也不会重名)
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 已持久化的样本 (创建后不再修改)
#[derive(Clone, Debug)]
pub struct Sample {
    pub image_path: PathBuf,
    pub label_path: PathBuf,
    pub class_name: String,
    /// 背景样本没有标签
    pub label: Option<Label>,
    pub frame_seq: u64,
    pub created: DateTime<Local>,
}

/// `recover` 的清理结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub temp_files_removed: usize,
    pub orphan_images_removed: usize,
}

pub struct DatasetWriter {
    root: PathBuf,
    registry: SharedRegistry,
    session_id: String,
    counter: u64,
    jpeg_quality: u8,
}

impl DatasetWriter {
    pub fn new(root: impl AsRef<Path>, registry: SharedRegistry, jpeg_quality: u8) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let session_id = format!(
            "{}_{}_{}",
            gen_time_string(""),
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        debug!("数据集写入会话 {} → {}", session_id, root.display());
        Ok(Self {
            root,
            registry,
            session_id,
            counter: 0,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 持久化一帧及其标签
    ///
    /// 整个写入期间持有注册表读锁, 类别增删改会等待写入完成.
    pub fn persist(&mut self, frame: &Frame, region: &BBox, class_id: u32) -> Result<Sample> {
        let registry = self.registry.read()?;
        let class_name = registry
            .name_of(class_id)
            .ok_or(FlowError::UnknownClass(class_id))?
            .to_string();
        let label = Label::from_region(class_id, region, frame.width, frame.height)?;

        // 序号先递增: 失败的写入也不会复用文件名
        self.counter += 1;
        let base = format!("{}_{:06}", self.session_id, self.counter);
        let dir = self.root.join(&class_name);
        let rgb = frame.to_rgb_image();
        let quality = self.jpeg_quality;
        let (image_path, label_path) = commit_pair(
            &dir,
            &base,
            |path| write_jpeg(path, &rgb, quality),
            &format!("{}\n", label.to_line()),
        )?;
        drop(registry);

        Ok(Sample {
            image_path,
            label_path,
            class_name,
            label: Some(label),
            frame_seq: frame.seq,
            created: Local::now(),
        })
    }

    /// 持久化一帧背景 (负样本): 图片 + 空标签, 提交方式与 `persist` 相同
    pub fn persist_background(&mut self, frame: &Frame) -> Result<Sample> {
        self.counter += 1;
        let base = format!("{}_{:06}", self.session_id, self.counter);
        let dir = self.root.join(BACKGROUND_DIR);
        let rgb = frame.to_rgb_image();
        let quality = self.jpeg_quality;
        let (image_path, label_path) =
            commit_pair(&dir, &base, |path| write_jpeg(path, &rgb, quality), "")?;
        debug!("🌫️ 背景帧 #{} → {}", frame.seq, image_path.display());

        Ok(Sample {
            image_path,
            label_path,
            class_name: BACKGROUND_DIR.to_string(),
            label: None,
            frame_seq: frame.seq,
            created: Local::now(),
        })
    }

    /// 清理崩溃遗留: 临时文件和没有标签的图片
    pub fn recover(root: impl AsRef<Path>) -> Result<RecoveryReport> {
        let root = root.as_ref();
        let mut report = RecoveryReport::default();
        if !root.is_dir() {
            return Ok(report);
        }
        for entry in fs::read_dir(root)? {
            let dir = entry?.path();
            if !dir.is_dir() || is_hidden(&dir) {
                continue;
            }
            for file in fs::read_dir(&dir)? {
                let path = file?.path();
                if !path.is_file() {
                    continue;
                }
                if has_ext(&path, TMP_EXT) {
                    fs::remove_file(&path)?;
                    report.temp_files_removed += 1;
                } else if has_ext(&path, IMAGE_EXT) && !path.with_extension(LABEL_EXT).exists() {
                    warn!("⚠️ 删除没有标签的图片 {}", path.display());
                    fs::remove_file(&path)?;
                    report.orphan_images_removed += 1;
                }
            }
        }
        if report != RecoveryReport::default() {
            info!(
                "🧹 数据集恢复: 删除临时文件 {} 个, 孤立图片 {} 个",
                report.temp_files_removed, report.orphan_images_removed
            );
        }
        Ok(report)
    }
}

pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

pub(crate) fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn write_failure(path: &Path, e: impl std::fmt::Display) -> FlowError {
    FlowError::WriteFailure(format!("{}: {}", path.display(), e))
}

fn write_jpeg(path: &Path, rgb: &RgbImage, quality: u8) -> Result<()> {
    let file = File::create(path).map_err(|e| write_failure(path, e))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode_image(rgb)
        .map_err(|e| write_failure(path, e))?;
    let file = writer.into_inner().map_err(|e| write_failure(path, e.error()))?;
    file.sync_all().map_err(|e| write_failure(path, e))?;
    Ok(())
}

fn write_synced(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path).map_err(|e| write_failure(path, e))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| write_failure(path, e))
}

/// 以 `<dir>/<base>` 原子提交一对图片+标签
///
/// 任一步失败都删除临时文件, 不留下半个样本.
pub(crate) fn commit_pair(
    dir: &Path,
    base: &str,
    write_image: impl FnOnce(&Path) -> Result<()>,
    label_contents: &str,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir).map_err(|e| write_failure(dir, e))?;
    let image_path = dir.join(format!("{}.{}", base, IMAGE_EXT));
    let label_path = dir.join(format!("{}.{}", base, LABEL_EXT));
    if image_path.exists() || label_path.exists() {
        return Err(FlowError::WriteFailure(format!(
            "{} already exists",
            image_path.display()
        )));
    }
    let image_tmp = dir.join(format!(".{}.{}.{}", base, IMAGE_EXT, TMP_EXT));
    let label_tmp = dir.join(format!(".{}.{}.{}", base, LABEL_EXT, TMP_EXT));

    let result = (|| {
        write_image(&image_tmp)?;
        write_synced(&label_tmp, label_contents)?;
        fs::rename(&image_tmp, &image_path).map_err(|e| write_failure(&image_path, e))?;
        // 标签最后出现: 提交点
        fs::rename(&label_tmp, &label_path).map_err(|e| write_failure(&label_path, e))
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&image_tmp);
        let _ = fs::remove_file(&label_tmp);
        if !label_path.exists() {
            let _ = fs::remove_file(&image_path);
        }
        return Err(e);
    }
    Ok((image_path, label_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{list_samples, ClassRegistry};
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        let mut data = vec![0u8; 64 * 48 * 4];
        for (i, px) in data.chunks_exact_mut(4).enumerate() {
            px.copy_from_slice(&[(i % 255) as u8, 80, 160, 255]);
        }
        Frame::new(seq, Duration::ZERO, 64, 48, data).unwrap()
    }

    fn writer(root: &Path) -> (DatasetWriter, u32) {
        let registry = SharedRegistry::new(ClassRegistry::open(root).unwrap());
        let id = registry.add("ball").unwrap();
        (DatasetWriter::new(root, registry, 90).unwrap(), id)
    }

    #[test]
    fn test_persist_writes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, id) = writer(dir.path());
        let sample = w.persist(&frame(5), &BBox::new(8.0, 8.0, 16.0, 12.0), id).unwrap();

        assert_eq!(sample.frame_seq, 5);
        assert_eq!(sample.class_name, "ball");
        assert!(sample.image_path.starts_with(dir.path().join("ball")));
        assert_eq!(image::image_dimensions(&sample.image_path).unwrap(), (64, 48));
        let text = fs::read_to_string(&sample.label_path).unwrap();
        let label = sample.label.unwrap();
        assert_eq!(text.trim(), label.to_line());
        assert!(label.is_normalized());
    }

    #[test]
    fn test_background_sample_has_empty_label() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, id) = writer(dir.path());
        w.persist(&frame(1), &BBox::new(8.0, 8.0, 16.0, 12.0), id).unwrap();
        let bg = w.persist_background(&frame(2)).unwrap();

        assert_eq!(bg.label, None);
        assert!(bg.image_path.starts_with(dir.path().join(BACKGROUND_DIR)));
        assert_eq!(fs::read_to_string(&bg.label_path).unwrap(), "");
        assert_eq!(image::image_dimensions(&bg.image_path).unwrap(), (64, 48));

        let listed = list_samples(dir.path()).unwrap();
        assert_eq!(listed.len(), 2);
        let background = listed.iter().find(|s| s.class_name == BACKGROUND_DIR).unwrap();
        assert!(background.labels.is_empty());
        // 空标签也是提交标记, recover 不会把背景图当孤立图片删掉
        assert_eq!(DatasetWriter::recover(dir.path()).unwrap().orphan_images_removed, 0);
    }

    #[test]
    fn test_names_never_collide_across_writers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, id) = writer(dir.path());
        let mut b = DatasetWriter::new(dir.path(), a.registry.clone(), 90).unwrap();
        assert_ne!(a.session_id(), b.session_id());
        for seq in 0..3 {
            a.persist(&frame(seq), &BBox::new(0.0, 0.0, 10.0, 10.0), id).unwrap();
            b.persist(&frame(seq), &BBox::new(0.0, 0.0, 10.0, 10.0), id).unwrap();
        }
        assert_eq!(list_samples(dir.path()).unwrap().len(), 6);
    }

    #[test]
    fn test_unknown_class_drops_sample() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, _) = writer(dir.path());
        let err = w.persist(&frame(1), &BBox::new(0.0, 0.0, 10.0, 10.0), 42).unwrap_err();
        assert!(matches!(err, FlowError::UnknownClass(42)));
        assert!(err.is_per_sample());
        assert!(list_samples(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_image_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("c");
        let result = commit_pair(
            &class_dir,
            "x_000001",
            |_| Err(FlowError::WriteFailure("disk full".into())),
            "0 0.5 0.5 0.1 0.1\n",
        );
        assert!(result.is_err());
        assert_eq!(fs::read_dir(&class_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_recover_sweeps_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut w, id) = writer(dir.path());
        let kept = w.persist(&frame(1), &BBox::new(0.0, 0.0, 10.0, 10.0), id).unwrap();
        let class_dir = dir.path().join("ball");
        fs::write(class_dir.join(".s_000009.jpg.tmp"), b"partial").unwrap();
        fs::write(class_dir.join("s_000008.jpg"), b"orphan").unwrap();

        let report = DatasetWriter::recover(dir.path()).unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                temp_files_removed: 1,
                orphan_images_removed: 1
            }
        );
        assert!(kept.image_path.exists());
        assert!(!class_dir.join("s_000008.jpg").exists());
    }
}

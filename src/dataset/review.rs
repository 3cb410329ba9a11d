//! 样本审核 (非破坏性编辑)
//!
//! - `relabel` 生成新版本 `<base>_v<N>`, 原样本移入 `.superseded/`
//! - `delete` 把样本移入 `.deleted/`
//!
//! 原文件从不原地覆盖.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::label::{format_labels, read_labels, Label};
use super::registry::SharedRegistry;
use super::writer::{commit_pair, has_ext, is_hidden, IMAGE_EXT, LABEL_EXT};
use crate::detection::BBox;
use crate::error::{FlowError, Result};

pub const SUPERSEDED_DIR: &str = ".superseded";
pub const DELETED_DIR: &str = ".deleted";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<stem>.+?)(?:_v(?P<n>\d+))?$").expect("valid regex"));

/// 磁盘上的一个已提交样本
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRecord {
    pub class_name: String,
    pub base: String,
    pub image_path: PathBuf,
    pub label_path: PathBuf,
    pub labels: Vec<Label>,
}

/// 列出所有已提交样本 (按类别目录、文件名排序)
pub fn list_samples(root: impl AsRef<Path>) -> Result<Vec<SampleRecord>> {
    let root = root.as_ref();
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && !is_hidden(p))
        .collect();
    dirs.sort();

    for dir in dirs {
        let class_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let mut labels: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && !is_hidden(p) && has_ext(p, LABEL_EXT))
            .collect();
        labels.sort();
        for label_path in labels {
            let image_path = label_path.with_extension(IMAGE_EXT);
            if !image_path.exists() {
                continue;
            }
            let base = label_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            // 单个损坏的标签文件不影响整个列表
            let labels = match read_labels(&label_path) {
                Ok(labels) => labels,
                Err(e) => {
                    warn!("⚠️ 跳过样本 {}/{}: {}", class_name, base, e);
                    continue;
                }
            };
            out.push(SampleRecord {
                class_name: class_name.clone(),
                base,
                labels,
                image_path,
                label_path,
            });
        }
    }
    Ok(out)
}

/// 按类别名和基础文件名查找样本
pub fn find_sample(root: impl AsRef<Path>, class_name: &str, base: &str) -> Result<SampleRecord> {
    list_samples(root.as_ref())?
        .into_iter()
        .find(|s| s.class_name == class_name && s.base == base)
        .ok_or_else(|| FlowError::UnknownSample(format!("{}/{}", class_name, base)))
}

/// 把一对文件移入 `<root>/<bucket>/<class>/`
fn retire(root: &Path, bucket: &str, sample: &SampleRecord) -> Result<()> {
    let dest = root.join(bucket).join(&sample.class_name);
    fs::create_dir_all(&dest)?;
    // 先移图片: 中途崩溃留下的孤立标签不会被列为样本
    for path in [&sample.image_path, &sample.label_path] {
        if let Some(name) = path.file_name() {
            fs::rename(path, dest.join(name))?;
        }
    }
    Ok(())
}

fn next_version(root: &Path, base: &str) -> Result<String> {
    let caps = VERSION_RE
        .captures(base)
        .ok_or_else(|| FlowError::Codec(format!("bad sample name {}", base)))?;
    let stem = caps.name("stem").map(|m| m.as_str()).unwrap_or(base);

    // 所有类别目录和归档目录中同一 stem 的最大版本号
    let mut highest = 0u32;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(c) = VERSION_RE.captures(file_stem) {
                if c.name("stem").map(|m| m.as_str()) == Some(stem) {
                    let n = c
                        .name("n")
                        .and_then(|m| m.as_str().parse().ok())
                        .unwrap_or(1);
                    highest = highest.max(n);
                }
            }
        }
    }
    Ok(format!("{}_v{}", stem, highest.max(1) + 1))
}

/// 修改样本的类别和/或框, 生成新版本
///
/// 单目标样本: 新标签替换全部旧标签.
pub fn relabel(
    root: impl AsRef<Path>,
    registry: &SharedRegistry,
    sample: &SampleRecord,
    class_id: u32,
    region: Option<BBox>,
) -> Result<SampleRecord> {
    let root = root.as_ref();
    let guard = registry.read()?;
    let class_name = guard
        .name_of(class_id)
        .ok_or(FlowError::UnknownClass(class_id))?
        .to_string();

    let (w, h) = image::image_dimensions(&sample.image_path)?;
    let region = match region {
        Some(r) => r,
        None => sample
            .labels
            .first()
            .map(|l| l.to_region(w, h))
            .ok_or_else(|| FlowError::InvalidRegion(format!("{} has no label", sample.base)))?,
    };
    let label = Label::from_region(class_id, &region, w, h)?;

    let base = next_version(root, &sample.base)?;
    let dir = root.join(&class_name);
    let (image_path, label_path) = commit_pair(
        &dir,
        &base,
        |tmp| {
            fs::copy(&sample.image_path, tmp)?;
            Ok(())
        },
        &format_labels(&[label]),
    )?;
    drop(guard);
    retire(root, SUPERSEDED_DIR, sample)?;

    info!(
        "✏️ 样本 {}/{} → {}/{}",
        sample.class_name, sample.base, class_name, base
    );
    Ok(SampleRecord {
        class_name,
        base,
        image_path,
        label_path,
        labels: vec![label],
    })
}

/// 删除样本 (移入 `.deleted/`, 可人工恢复)
pub fn delete(root: impl AsRef<Path>, sample: &SampleRecord) -> Result<()> {
    retire(root.as_ref(), DELETED_DIR, sample)?;
    info!("🗑️ 样本 {}/{} 已删除", sample.class_name, sample.base);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ClassRegistry, DatasetWriter};
    use crate::input::Frame;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, SharedRegistry, SampleRecord) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::new(ClassRegistry::open(dir.path()).unwrap());
        let id = registry.add("cat").unwrap();
        registry.add("dog").unwrap();
        let mut writer = DatasetWriter::new(dir.path(), registry.clone(), 90).unwrap();
        let frame = Frame::new(1, Duration::ZERO, 32, 32, vec![128; 32 * 32 * 4]).unwrap();
        writer.persist(&frame, &BBox::new(4.0, 4.0, 8.0, 8.0), id).unwrap();
        let sample = list_samples(dir.path()).unwrap().remove(0);
        (dir, registry, sample)
    }

    #[test]
    fn test_relabel_creates_new_version() {
        let (dir, registry, sample) = setup();
        let dog = registry.read().unwrap().id_of("dog").unwrap();

        let v2 = relabel(dir.path(), &registry, &sample, dog, None).unwrap();
        assert_eq!(v2.base, format!("{}_v2", sample.base));
        assert_eq!(v2.class_name, "dog");
        assert_eq!(v2.labels[0].class_id, dog);
        assert!((v2.labels[0].width - sample.labels[0].width).abs() < 1e-5);

        // 原样本被归档而非覆盖
        assert!(!sample.image_path.exists());
        assert!(dir
            .path()
            .join(SUPERSEDED_DIR)
            .join("cat")
            .join(format!("{}.txt", sample.base))
            .exists());

        let v3 = relabel(dir.path(), &registry, &v2, dog, Some(BBox::new(0.0, 0.0, 16.0, 16.0)))
            .unwrap();
        assert_eq!(v3.base, format!("{}_v3", sample.base));

        let listed = list_samples(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].base, v3.base);
    }

    #[test]
    fn test_delete_moves_to_archive() {
        let (dir, _, sample) = setup();
        delete(dir.path(), &sample).unwrap();
        assert!(list_samples(dir.path()).unwrap().is_empty());
        assert!(dir
            .path()
            .join(DELETED_DIR)
            .join("cat")
            .join(format!("{}.jpg", sample.base))
            .exists());
    }

    #[test]
    fn test_malformed_label_is_skipped() {
        let (dir, registry, first) = setup();
        let id = registry.read().unwrap().id_of("cat").unwrap();
        let mut writer = DatasetWriter::new(dir.path(), registry.clone(), 90).unwrap();
        for seq in 2..=3 {
            let frame = Frame::new(seq, Duration::ZERO, 32, 32, vec![64; 32 * 32 * 4]).unwrap();
            writer.persist(&frame, &BBox::new(2.0, 2.0, 10.0, 10.0), id).unwrap();
        }
        fs::write(&first.label_path, "0 0.5 0.5\n").unwrap();

        let listed = list_samples(dir.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.base != first.base));
        assert!(crate::dataset::prepare_dataset(dir.path(), &registry).is_ok());
    }

    #[test]
    fn test_relabel_to_unknown_class_fails() {
        let (dir, registry, sample) = setup();
        assert!(matches!(
            relabel(dir.path(), &registry, &sample, 99, None),
            Err(FlowError::UnknownClass(99))
        ));
        assert!(sample.image_path.exists());
    }
}

//! 训练前整理: 写 `dataset.yaml` 和 `classes.txt`
//!
//! 每个类别目录同时是图片目录和标签目录 (标签与图片同名同目录).
//! 退役的类别ID在 `names` 中保留占位, 使ID与训练类别下标一致.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::registry::SharedRegistry;
use super::review::list_samples;
use super::writer::BACKGROUND_DIR;
use crate::error::{FlowError, Result};

pub const DATASET_YAML: &str = "dataset.yaml";
pub const CLASSES_TXT: &str = "classes.txt";

#[derive(Clone, Debug, PartialEq)]
pub struct DatasetSummary {
    pub yaml_path: PathBuf,
    pub classes: usize,
    pub images: usize,
    pub labels: usize,
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn prepare_dataset(root: impl AsRef<Path>, registry: &SharedRegistry) -> Result<DatasetSummary> {
    let root = root.as_ref();
    let samples = list_samples(root)?;
    if samples.is_empty() {
        return Err(FlowError::Config(format!(
            "no samples found under {}",
            root.display()
        )));
    }

    let registry = registry.snapshot()?;
    let span = registry.id_span();
    let names: Vec<String> = (0..span)
        .map(|id| {
            registry
                .name_of(id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("_retired_{}", id))
        })
        .collect();

    // 只列出有样本的已注册类别目录
    let mut dirs: Vec<&str> = registry
        .classes()
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| samples.iter().any(|s| s.class_name == *name))
        .collect();
    dirs.sort();
    // 背景样本没有标签, 只作为负样本参与训练
    if samples.iter().any(|s| s.class_name == BACKGROUND_DIR) {
        dirs.push(BACKGROUND_DIR);
    }

    let abs_root = fs::canonicalize(root)?;
    let dir_list = dirs.iter().map(|d| quote(d)).collect::<Vec<_>>().join(", ");
    let mut yaml = String::new();
    let _ = writeln!(yaml, "path: {}", quote(&abs_root.display().to_string()));
    let _ = writeln!(yaml, "train: [{}]", dir_list);
    let _ = writeln!(yaml, "val: [{}]", dir_list);
    let _ = writeln!(yaml, "nc: {}", span);
    let _ = writeln!(yaml, "names:");
    for (id, name) in names.iter().enumerate() {
        let _ = writeln!(yaml, "  {}: {}", id, quote(name));
    }

    let yaml_path = root.join(DATASET_YAML);
    fs::write(&yaml_path, yaml)?;
    fs::write(root.join(CLASSES_TXT), names.join("\n") + "\n")?;

    let labels = samples.iter().map(|s| s.labels.len()).sum();
    let summary = DatasetSummary {
        yaml_path,
        classes: registry.len(),
        images: samples.len(),
        labels,
    };
    info!(
        "📦 数据集已整理: {} 个类别, {} 张图片, {} 个标签 → {}",
        summary.classes,
        summary.images,
        summary.labels,
        summary.yaml_path.display()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ClassRegistry, DatasetWriter};
    use crate::detection::BBox;
    use crate::input::Frame;
    use std::time::Duration;

    #[test]
    fn test_prepare_writes_yaml_with_retired_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::new(ClassRegistry::open(dir.path()).unwrap());
        let a = registry.add("apple").unwrap();
        let b = registry.add("banana").unwrap();
        let c = registry.add("cherry").unwrap();
        let mut writer = DatasetWriter::new(dir.path(), registry.clone(), 90).unwrap();
        let frame = Frame::new(1, Duration::ZERO, 16, 16, vec![60; 16 * 16 * 4]).unwrap();
        for id in [a, c, c] {
            writer.persist(&frame, &BBox::new(2.0, 2.0, 8.0, 8.0), id).unwrap();
        }
        writer.persist_background(&frame).unwrap();
        registry.remove(b).unwrap();

        let summary = prepare_dataset(dir.path(), &registry).unwrap();
        assert_eq!(summary.images, 4);
        assert_eq!(summary.labels, 3);
        assert_eq!(summary.classes, 2);

        let yaml = fs::read_to_string(&summary.yaml_path).unwrap();
        assert!(yaml.contains("train: ['apple', 'cherry', '_background']"));
        assert!(yaml.contains("nc: 3"));
        assert!(yaml.contains("  1: '_retired_1'"));
        assert!(yaml.contains("  2: 'cherry'"));
        let classes = fs::read_to_string(dir.path().join(CLASSES_TXT)).unwrap();
        assert_eq!(classes.lines().count(), 3);
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::new(ClassRegistry::open(dir.path()).unwrap());
        assert!(prepare_dataset(dir.path(), &registry).is_err());
    }
}

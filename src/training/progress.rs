//! 训练进度解析
//!
//! 支持两种输出:
//! - JSON 行: `{"epoch": 3, "total_epochs": 50, "metrics": {"box_loss": 0.07}}`
//! - Ultralytics 控制台表格:
//!   ```text
//!   Starting training for 50 epochs...
//!         1/50     19.7G    0.07304  0.09175  0.02089   0.1857       16       640      0.635      0.566      0.615
//!   ```
//!   列: epoch GPU box_loss cls_loss dfl_loss total_loss it/s img_size precision recall mAP

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));
static START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Starting training for (\d+) epochs").expect("valid regex"));
static EPOCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(\d+)$").expect("valid regex"));

/// 表格中各指标所在的列
const TABLE_COLUMNS: [(usize, &str); 6] = [
    (2, "box_loss"),
    (3, "cls_loss"),
    (4, "dfl_loss"),
    (8, "precision"),
    (9, "recall"),
    (10, "map"),
];

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub epoch: u32,
    pub total_epochs: u32,
    pub metrics: Vec<(String, f32)>,
}

#[derive(Deserialize)]
struct JsonProgress {
    epoch: u32,
    #[serde(default)]
    total_epochs: Option<u32>,
    #[serde(default)]
    metrics: BTreeMap<String, f32>,
}

/// 逐行解析训练输出; 记住 "Starting training for N epochs" 给出的总轮数
#[derive(Clone, Debug, Default)]
pub struct ProgressParser {
    total_epochs: u32,
}

impl ProgressParser {
    pub fn new(total_epochs: u32) -> Self {
        Self { total_epochs }
    }

    pub fn total_epochs(&self) -> u32 {
        self.total_epochs
    }

    pub fn parse(&mut self, raw: &str) -> Option<ProgressEvent> {
        // 进度条用 \r 覆盖同一行, 只看最后一段
        let last = raw.rsplit('\r').find(|s| !s.trim().is_empty())?;
        let line = ANSI_RE.replace_all(last, "");
        let line = line.trim();

        if line.starts_with('{') {
            return self.parse_json(line);
        }
        if let Some(caps) = START_RE.captures(line) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                self.total_epochs = n;
            }
            return None;
        }
        self.parse_table(line)
    }

    fn parse_json(&mut self, line: &str) -> Option<ProgressEvent> {
        let json: JsonProgress = serde_json::from_str(line).ok()?;
        if let Some(total) = json.total_epochs {
            self.total_epochs = total;
        }
        Some(ProgressEvent {
            epoch: json.epoch,
            total_epochs: self.total_epochs,
            metrics: json.metrics.into_iter().collect(),
        })
    }

    fn parse_table(&mut self, line: &str) -> Option<ProgressEvent> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // 表头和进度条行的列数都不够
        if parts.len() <= 6 {
            return None;
        }
        let caps = EPOCH_RE.captures(parts[0])?;
        let epoch: u32 = caps.get(1)?.as_str().parse().ok()?;
        let total: u32 = caps.get(2)?.as_str().parse().ok()?;
        if total == 0 || epoch > total {
            return None;
        }
        self.total_epochs = total;

        let metrics = TABLE_COLUMNS
            .iter()
            .filter_map(|&(col, name)| {
                let value: f32 = parts.get(col)?.parse().ok()?;
                Some((name.to_string(), value))
            })
            .collect();
        Some(ProgressEvent {
            epoch,
            total_epochs: total,
            metrics,
        })
    }
}

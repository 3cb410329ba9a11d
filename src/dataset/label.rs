//! YOLO 标签格式: 每行 `class_id x_center y_center width height`, 归一化到 [0,1]

use std::path::Path;

use crate::detection::BBox;
use crate::error::{FlowError, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Label {
    pub class_id: u32,
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl Label {
    /// 像素框 → 归一化标签 (先裁剪到图像内)
    pub fn from_region(class_id: u32, region: &BBox, image_w: u32, image_h: u32) -> Result<Self> {
        let clamped = region.clamp_to(image_w, image_h).ok_or_else(|| {
            FlowError::InvalidRegion(format!("{:?} outside {}x{}", region, image_w, image_h))
        })?;
        let (cx, cy) = clamped.center();
        let (w, h) = (image_w as f32, image_h as f32);
        let label = Self {
            class_id,
            x_center: (cx / w).clamp(0.0, 1.0),
            y_center: (cy / h).clamp(0.0, 1.0),
            width: (clamped.w / w).clamp(0.0, 1.0),
            height: (clamped.h / h).clamp(0.0, 1.0),
        };
        if !label.is_normalized() {
            return Err(FlowError::InvalidRegion(format!("{:?} does not normalize", region)));
        }
        Ok(label)
    }

    /// 框完全落在 [0,1]×[0,1] 内且面积为正
    pub fn is_normalized(&self) -> bool {
        let unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        let eps = 1e-6;
        unit(self.x_center)
            && unit(self.y_center)
            && self.width > 0.0
            && self.height > 0.0
            && self.x_center - self.width / 2.0 >= -eps
            && self.x_center + self.width / 2.0 <= 1.0 + eps
            && self.y_center - self.height / 2.0 >= -eps
            && self.y_center + self.height / 2.0 <= 1.0 + eps
    }

    pub fn to_region(&self, image_w: u32, image_h: u32) -> BBox {
        let (w, h) = (image_w as f32, image_h as f32);
        BBox::from_center(
            self.x_center * w,
            self.y_center * h,
            self.width * w,
            self.height * h,
        )
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {:.6} {:.6} {:.6} {:.6}",
            self.class_id, self.x_center, self.y_center, self.width, self.height
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let bad = || FlowError::Codec(format!("bad label line '{}'", line));
        let mut parts = line.split_whitespace();
        let class_id: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let mut next = || -> Result<f32> {
            parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())
        };
        let label = Self {
            class_id,
            x_center: next()?,
            y_center: next()?,
            width: next()?,
            height: next()?,
        };
        Ok(label)
    }
}

pub fn read_labels(path: &Path) -> Result<Vec<Label>> {
    std::fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(Label::parse_line)
        .collect()
}

pub fn format_labels(labels: &[Label]) -> String {
    let mut out = String::new();
    for label in labels {
        out.push_str(&label.to_line());
        out.push('\n');
    }
    out
}

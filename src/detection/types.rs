// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测/追踪公共数据结构
//! Data structures shared by the tracker and the detector

use serde::{Deserialize, Serialize};

/// 轴对齐边界框, 源图像像素坐标 (x, y 为左上角)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// 宽高为正且所有坐标有限
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.w.is_finite()
            && self.h.is_finite()
            && self.w > 0.0
            && self.h > 0.0
    }

    /// 计算两个边界框的IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }

    /// 裁剪到图像范围内; 裁剪后为空则返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = self.x2().min(width as f32);
        let y2 = self.y2().min(height as f32);
        let clamped = BBox::from_xyxy(x1, y1, x2, y2);
        clamped.is_valid().then_some(clamped)
    }

    /// 是否完全位于图像内
    pub fn is_inside(&self, width: u32, height: u32) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.x2() <= width as f32 && self.y2() <= height as f32
    }

    /// 按比例向四周扩展 (margin=0.5 → 每边扩展半个宽/高)
    pub fn expand(&self, margin: f32) -> BBox {
        let dx = self.w * margin;
        let dy = self.h * margin;
        BBox::new(self.x - dx, self.y - dy, self.w + 2.0 * dx, self.h + 2.0 * dy)
    }
}

/// 检测结果 (检测器 → 调度器)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

/// 区域估计来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimateSource {
    Tracker,
    Detector,
}

/// 区域估计 (追踪器和检测器的统一输出)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    pub region: BBox,
    pub confidence: f32,
    pub source: EstimateSource,
}

/// 贪心NMS (按置信度降序, 丢弃与已保留框IOU超过阈值的框)
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

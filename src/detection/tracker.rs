//! 单目标视觉跟踪 (Tracker Engine)
//!
//! 快但会漂移的区域估计器, 与检测器 (慢但准) 共用 `Estimate` 输出.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};

use super::kalman::KalmanBoxFilter;
use super::types::{BBox, Estimate, EstimateSource};
use crate::config::TrackerConfig;
use crate::error::{FlowError, Result};
use crate::input::Frame;

/// 跟踪器接口
///
/// `init`/`update` 是纯函数: 相同输入和状态得到相同输出, 没有隐藏的全局状态.
pub trait Tracker: Send {
    type State: Clone + Send;

    fn init(&self, frame: &Frame, region: BBox) -> Result<Self::State>;

    fn update(&self, frame: &Frame, state: &Self::State) -> (Estimate, Self::State);
}

/// 可见面积低于该比例视为目标离开画面
const MIN_VISIBLE_FRACTION: f32 = 0.5;
const MIN_TEMPLATE_SIDE: u32 = 4;

/// 模板匹配跟踪器
///
/// 初始化时截取灰度模板; 每帧在上一位置附近的搜索窗口内做归一化模板匹配,
/// 以最佳位置的零均值归一化互相关作为置信度, 卡尔曼滤波平滑输出.
#[derive(Clone, Debug)]
pub struct TemplateTracker {
    config: TrackerConfig,
}

#[derive(Clone, Debug)]
pub struct TemplateState {
    template: GrayImage,
    /// 模板像素 / 源像素
    scale: f32,
    kalman: KalmanBoxFilter,
    region: BBox,
}

impl TemplateState {
    pub fn region(&self) -> BBox {
        self.region
    }
}

impl TemplateTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    fn scale_for(&self, region: &BBox) -> f32 {
        let longest = region.w.max(region.h);
        (self.config.template_max_side as f32 / longest).min(1.0)
    }

    fn lost(&self, region: BBox, state: &TemplateState, kalman: KalmanBoxFilter) -> (Estimate, TemplateState) {
        let next = TemplateState {
            kalman,
            region,
            ..state.clone()
        };
        (
            Estimate {
                region,
                confidence: 0.0,
                source: EstimateSource::Tracker,
            },
            next,
        )
    }
}

/// 截取 `region` 并按 `scale` 缩放
fn crop_scaled(gray: &GrayImage, region: &BBox, scale: f32) -> Option<GrayImage> {
    let x = region.x.floor().max(0.0) as u32;
    let y = region.y.floor().max(0.0) as u32;
    let w = (region.w.round() as u32).min(gray.width().saturating_sub(x));
    let h = (region.h.round() as u32).min(gray.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return None;
    }
    let crop = imageops::crop_imm(gray, x, y, w, h).to_image();
    if (scale - 1.0).abs() < f32::EPSILON {
        return Some(crop);
    }
    let sw = ((w as f32 * scale).round() as u32).max(1);
    let sh = ((h as f32 * scale).round() as u32).max(1);
    Some(imageops::resize(&crop, sw, sh, FilterType::Triangle))
}

/// 零均值归一化互相关, 取值 [-1, 1]; 平坦区域返回 0
fn zncc(image: &GrayImage, template: &GrayImage, ox: u32, oy: u32) -> f32 {
    let (tw, th) = template.dimensions();
    let n = (tw * th) as f64;
    let mut sum_i = 0.0f64;
    let mut sum_t = 0.0f64;
    for y in 0..th {
        for x in 0..tw {
            sum_i += image.get_pixel(ox + x, oy + y).0[0] as f64;
            sum_t += template.get_pixel(x, y).0[0] as f64;
        }
    }
    let (mi, mt) = (sum_i / n, sum_t / n);
    let (mut cov, mut var_i, mut var_t) = (0.0f64, 0.0f64, 0.0f64);
    for y in 0..th {
        for x in 0..tw {
            let a = image.get_pixel(ox + x, oy + y).0[0] as f64 - mi;
            let b = template.get_pixel(x, y).0[0] as f64 - mt;
            cov += a * b;
            var_i += a * a;
            var_t += b * b;
        }
    }
    let denom = (var_i * var_t).sqrt();
    if denom < 1e-9 {
        return 0.0;
    }
    (cov / denom) as f32
}

impl Tracker for TemplateTracker {
    type State = TemplateState;

    fn init(&self, frame: &Frame, region: BBox) -> Result<TemplateState> {
        let clamped = region.clamp_to(frame.width, frame.height).ok_or_else(|| {
            FlowError::InvalidRegion(format!("{:?} outside {}x{}", region, frame.width, frame.height))
        })?;
        let scale = self.scale_for(&clamped);
        if (clamped.w * scale) < MIN_TEMPLATE_SIDE as f32 || (clamped.h * scale) < MIN_TEMPLATE_SIDE as f32 {
            return Err(FlowError::InvalidRegion(format!("{:?} is too small to track", clamped)));
        }
        let gray = frame.to_gray_image();
        let template = crop_scaled(&gray, &clamped, scale)
            .ok_or_else(|| FlowError::InvalidRegion(format!("{:?} is empty", clamped)))?;
        // 模板按裁剪后的实际像素重新确定框尺寸
        let region = BBox::new(
            clamped.x.floor(),
            clamped.y.floor(),
            template.width() as f32 / scale,
            template.height() as f32 / scale,
        );
        Ok(TemplateState {
            template,
            scale,
            kalman: KalmanBoxFilter::new(&region, &self.config),
            region,
        })
    }

    fn update(&self, frame: &Frame, state: &TemplateState) -> (Estimate, TemplateState) {
        let mut kalman = state.kalman.clone();
        let predicted = kalman.predicted_bbox();
        kalman.predict();

        // 离开画面 → 漂移
        let visible = predicted
            .clamp_to(frame.width, frame.height)
            .map(|c| c.area() / predicted.area().max(1e-6))
            .unwrap_or(0.0);
        if visible < MIN_VISIBLE_FRACTION {
            return self.lost(predicted, state, kalman);
        }

        let Some(window) = predicted
            .expand(self.config.search_margin)
            .clamp_to(frame.width, frame.height)
        else {
            return self.lost(predicted, state, kalman);
        };
        let gray = frame.to_gray_image();
        let Some(search) = crop_scaled(&gray, &window, state.scale) else {
            return self.lost(predicted, state, kalman);
        };
        let (tw, th) = state.template.dimensions();
        if search.width() < tw || search.height() < th {
            return self.lost(predicted, state, kalman);
        }

        let scores = match_template(
            &search,
            &state.template,
            MatchTemplateMethod::SumOfSquaredErrorsNormalized,
        );
        let best = find_extremes(&scores).min_value_location;
        let confidence = zncc(&search, &state.template, best.0, best.1).clamp(0.0, 1.0);

        let measured = BBox::new(
            window.x.floor() + best.0 as f32 / state.scale,
            window.y.floor() + best.1 as f32 / state.scale,
            state.region.w,
            state.region.h,
        );
        kalman.update(&measured);
        let smoothed = kalman.bbox();
        let region = BBox::new(smoothed.x, smoothed.y, state.region.w, state.region.h);

        (
            Estimate {
                region,
                confidence,
                source: EstimateSource::Tracker,
            },
            TemplateState {
                template: state.template.clone(),
                scale: state.scale,
                kalman,
                region,
            },
        )
    }
}

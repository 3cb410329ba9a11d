// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测器 (Detector)
//! 职责: 接收检测请求 → 推理 → 回传带帧序号的检测结果
//!
//! 推理耗时可能远超一帧, 所以检测器在独立线程中运行; 请求队列只有一个槽位,
//! 检测器忙时新请求直接丢弃, 调度循环永不等待.

use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::types::Detection;
use crate::input::Frame;

/// 检测器接口 (模型细节对调度器不透明)
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 检测请求 (调度 → 检测线程)
#[derive(Clone, Debug)]
pub struct DetectionRequest {
    pub seq: u64,
    /// 会话代数: 停止录制后旧代数的结果一律丢弃
    pub generation: u64,
    pub frame: Frame,
}

/// 检测结果 (检测线程 → 调度)
#[derive(Debug)]
pub struct DetectionResponse {
    pub seq: u64,
    pub generation: u64,
    pub detections: Vec<Detection>,
    pub inference_ms: f64,
    /// 推理失败时的错误 (此时 `detections` 为空)
    pub error: Option<String>,
}

/// 检测工作线程
pub struct DetectorWorker {
    requests: Option<Sender<DetectionRequest>>,
    responses: Receiver<DetectionResponse>,
    handle: Option<JoinHandle<()>>,
}

impl DetectorWorker {
    pub fn spawn(mut detector: Box<dyn Detector>) -> std::io::Result<Self> {
        let (req_tx, req_rx) = bounded::<DetectionRequest>(1);
        let (resp_tx, resp_rx) = unbounded::<DetectionResponse>();
        let handle = std::thread::Builder::new()
            .name("detector".into())
            .spawn(move || run(detector.as_mut(), req_rx, resp_tx))?;
        Ok(Self {
            requests: Some(req_tx),
            responses: resp_rx,
            handle: Some(handle),
        })
    }

    /// 提交请求; 检测器忙时返回 false (请求被丢弃)
    pub fn submit(&self, request: DetectionRequest) -> bool {
        let Some(tx) = &self.requests else {
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(r)) => {
                debug!("检测器忙, 丢弃帧 #{} 的检测请求", r.seq);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn responses(&self) -> &Receiver<DetectionResponse> {
        &self.responses
    }

    /// 关闭请求通道并等待线程退出; 未处理完的结果被放弃
    pub fn shutdown(&mut self) {
        self.requests = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    detector: &mut dyn Detector,
    requests: Receiver<DetectionRequest>,
    responses: Sender<DetectionResponse>,
) {
    info!("🔍 检测模块启动: {}", detector.name());

    let mut count = 0u64;
    let mut last = Instant::now();

    for request in requests.iter() {
        let started = Instant::now();
        let (detections, error) = match detector.detect(&request.frame) {
            Ok(d) => (d, None),
            Err(e) => {
                // 单帧失败不影响会话
                warn!("⚠️ 帧 #{} 检测失败: {:#}", request.seq, e);
                (Vec::new(), Some(format!("{:#}", e)))
            }
        };
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;

        count += 1;
        if last.elapsed().as_secs_f64() >= 1.0 {
            debug!(
                "🎯 检测统计: {:.1}fps | 最近一次 {:.1}ms",
                count as f64 / last.elapsed().as_secs_f64(),
                inference_ms
            );
            count = 0;
            last = Instant::now();
        }

        let response = DetectionResponse {
            seq: request.seq,
            generation: request.generation,
            detections,
            inference_ms,
            error,
        };
        if responses.send(response).is_err() {
            break;
        }
    }

    info!("🔍 检测模块退出");
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use anyhow::{Context, Result};
    use fast_image_resize as fr;
    use ndarray::{Array4, ArrayViewD};
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::info;

    use super::Detector;
    use crate::config::DetectorConfig;
    use crate::detection::types::{non_max_suppression, BBox, Detection};
    use crate::input::Frame;

    /// YOLOv8 ONNX 检测器 (输出 `output0`: [1, 4 + nc, N], cx/cy/w/h + 各类分数)
    pub struct OnnxDetector {
        session: Session,
        input_size: u32,
        conf: f32,
        iou: f32,
        resizer: fr::Resizer,
    }

    impl OnnxDetector {
        pub fn new(model_path: &Path, config: &DetectorConfig) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(model_path)
                .with_context(|| format!("加载检测模型失败: {}", model_path.display()))?;
            info!("✅ 检测模型加载成功: {}", model_path.display());
            Ok(Self {
                session,
                input_size: config.input_size,
                conf: config.confidence_threshold,
                iou: config.iou_threshold,
                resizer: fr::Resizer::new(),
            })
        }

        fn preprocess(&mut self, frame: &Frame) -> Result<Array4<f32>> {
            let size = self.input_size;
            let src = fr::images::Image::from_vec_u8(
                frame.width,
                frame.height,
                frame.rgba_data.as_ref().clone(),
                fr::PixelType::U8x4,
            )?;
            let mut dst = fr::images::Image::new(size, size, fr::PixelType::U8x4);
            self.resizer.resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )?;

            let s = size as usize;
            let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
            for (i, px) in dst.buffer().chunks_exact(4).enumerate() {
                let (y, x) = (i / s, i % s);
                tensor[[0, 0, y, x]] = px[0] as f32 / 255.0;
                tensor[[0, 1, y, x]] = px[1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = px[2] as f32 / 255.0;
            }
            Ok(tensor)
        }

        fn postprocess(&self, output: ArrayViewD<f32>, frame: &Frame) -> Vec<Detection> {
            let shape = output.shape();
            if shape.len() != 3 || shape[1] <= 4 {
                return Vec::new();
            }
            let (rows, anchors) = (shape[1], shape[2]);
            let sx = frame.width as f32 / self.input_size as f32;
            let sy = frame.height as f32 / self.input_size as f32;

            let mut detections = Vec::new();
            for i in 0..anchors {
                let (class_id, confidence) = (4..rows)
                    .map(|r| (r - 4, output[[0, r, i]]))
                    .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
                if confidence < self.conf {
                    continue;
                }
                let (cx, cy) = (output[[0, 0, i]] * sx, output[[0, 1, i]] * sy);
                let (w, h) = (output[[0, 2, i]] * sx, output[[0, 3, i]] * sy);
                let Some(bbox) = BBox::from_center(cx, cy, w, h).clamp_to(frame.width, frame.height)
                else {
                    continue;
                };
                detections.push(Detection {
                    class_id: class_id as u32,
                    bbox,
                    confidence,
                });
            }
            non_max_suppression(&mut detections, self.iou);
            detections
        }
    }

    impl Detector for OnnxDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let input = Tensor::from_array(self.preprocess(frame)?)?;
            let outputs = self
                .session
                .run(ort::inputs!["images" => input])
                .context("检测推理失败")?;
            let output: ArrayViewD<f32> = outputs["output0"]
                .try_extract_array()
                .context("读取检测输出失败")?;
            Ok(self.postprocess(output, frame))
        }

        fn name(&self) -> &str {
            "yolov8-onnx"
        }
    }
}

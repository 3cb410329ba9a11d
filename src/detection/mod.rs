/// 检测系统 (Detection System)
///
/// 两种区域估计器, 由调度器按节奏选择:
/// - Tracker:  模板匹配跟踪 (每帧, 快但会漂移)
/// - Detector: 目标检测 (按节奏, 慢但准, 独立线程)
pub mod detector;
pub mod kalman;
pub mod tracker;
pub mod types;

#[cfg(feature = "onnx")]
pub use detector::OnnxDetector;
pub use detector::{DetectionRequest, DetectionResponse, Detector, DetectorWorker};
pub use kalman::KalmanBoxFilter;
pub use tracker::{TemplateState, TemplateTracker, Tracker};
pub use types::{non_max_suppression, BBox, Detection, Estimate, EstimateSource};

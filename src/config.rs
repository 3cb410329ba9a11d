//! 配置 - 通过JSON文件调整参数
//!
//! 每个分段都带 `#[serde(default)]`, 配置文件可以只写需要覆盖的字段.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlowError, Result};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub control: ControlConfig,
    pub source: SourceConfig,
    pub capture: CaptureConfig,
    pub tracker: TrackerConfig,
    pub detector: DetectorConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub egress: EgressConfig,
}

impl FlowConfig {
    /// 从JSON文件加载配置; 文件不存在时写入默认配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("📝 配置文件不存在,创建默认配置 {}", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }
}

// ========== 控制通道 ==========

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// 宿主地址 (出站目标)
    pub host: String,
    /// 本地监听地址
    pub listen_host: String,
    pub inbound_port: u16,
    pub outbound_port: u16,
    /// 出站队列容量, 满了就丢
    pub send_queue: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            listen_host: "127.0.0.1".to_string(),
            inbound_port: 9000,
            outbound_port: 8860,
            send_queue: 256,
        }
    }
}

// ========== 视频源 ==========

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub source_id: String,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub frame_timeout_ms: u64,
    /// 帧阶段 → 调度阶段的通道容量
    pub frame_queue: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_id: "synthetic:1280x720@30".to_string(),
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1000,
            frame_timeout_ms: 1000,
            frame_queue: 2,
        }
    }
}

// ========== 采集调度 ==========

/// 采样间隔: 按帧数或按源时间
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureInterval {
    Frames(u64),
    Millis(u64),
}

/// 追踪丢失后的恢复策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostRecovery {
    /// 等待操作员重新画框
    #[default]
    Redraw,
    /// 检测器给出可信框时自动回到 Armed
    RearmFromDetector,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// 每N帧调用一次检测器
    pub detector_cadence: u64,
    pub capture_interval: CaptureInterval,
    /// 低于该置信度的帧不写入, 连续 `lost_after_frames` 帧则丢失
    pub lost_threshold: f32,
    pub lost_after_frames: u32,
    /// 低于该置信度时提前调用检测器
    pub soft_threshold: f32,
    /// 检测结果的接受阈值
    pub accept_confidence: f32,
    /// 追踪框与检测框 IOU 低于该值时吸附到检测框
    pub snap_iou_threshold: f32,
    /// 检测结果最多允许落后的帧数
    pub max_detection_age: u64,
    pub lost_recovery: LostRecovery,
    /// 调度 → 写盘的队列容量
    pub write_queue: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            detector_cadence: 15,
            capture_interval: CaptureInterval::Frames(5),
            lost_threshold: 0.3,
            lost_after_frames: 5,
            soft_threshold: 0.5,
            accept_confidence: 0.5,
            snap_iou_threshold: 0.5,
            max_detection_age: 30,
            lost_recovery: LostRecovery::Redraw,
            write_queue: 32,
        }
    }
}

impl CaptureConfig {
    /// 运行时参数更新 (`/yoloflow/param/<name>`)
    pub fn apply_parameter(&mut self, name: &str, value: f32) -> Result<()> {
        let unit = |v: f32| -> Result<f32> {
            if (0.0..=1.0).contains(&v) {
                Ok(v)
            } else {
                Err(FlowError::Config(format!("{} must be in [0,1], got {}", name, v)))
            }
        };
        let count = |v: f32| -> Result<u64> {
            if v.is_finite() && v >= 1.0 {
                Ok(v.round() as u64)
            } else {
                Err(FlowError::Config(format!("{} must be >= 1, got {}", name, v)))
            }
        };
        match name {
            "detector_cadence" => self.detector_cadence = count(value)?,
            "capture_interval" | "capture_interval_frames" => {
                self.capture_interval = CaptureInterval::Frames(count(value)?)
            }
            "capture_interval_ms" => self.capture_interval = CaptureInterval::Millis(count(value)?),
            "lost_threshold" => self.lost_threshold = unit(value)?,
            "lost_after_frames" => self.lost_after_frames = count(value)? as u32,
            "soft_threshold" => self.soft_threshold = unit(value)?,
            "confidence" | "accept_confidence" => self.accept_confidence = unit(value)?,
            "snap_iou" | "snap_iou_threshold" => self.snap_iou_threshold = unit(value)?,
            "max_detection_age" => self.max_detection_age = count(value)?,
            "lost_recovery" => {
                self.lost_recovery = if value != 0.0 {
                    LostRecovery::RearmFromDetector
                } else {
                    LostRecovery::Redraw
                }
            }
            _ => return Err(FlowError::Config(format!("unknown parameter '{}'", name))),
        }
        Ok(())
    }
}

// ========== 追踪器 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// 搜索窗口相对目标框每边扩展的比例
    pub search_margin: f32,
    /// 模板最长边 (像素), 更大的目标先缩小再匹配
    pub template_max_side: u32,
    pub kalman_process_noise: f32,
    pub kalman_observation_noise: f32,
    pub kalman_velocity_decay: f32,
    /// 静止判定阈值(像素/帧)
    pub kalman_stationary_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_margin: 1.0,
            template_max_side: 48,
            kalman_process_noise: 0.1,
            kalman_observation_noise: 1.0,
            kalman_velocity_decay: 0.95,
            kalman_stationary_threshold: 2.0,
        }
    }
}

// ========== 检测器 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// ONNX 模型路径; 为空则不启用检测器
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}

// ========== 数据集 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub jpeg_quality: u8,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("dataset"),
            jpeg_quality: 95,
        }
    }
}

// ========== 训练 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// 外部训练程序及其固定参数; 运行时追加 `--config <run>/config.json`
    pub program: String,
    pub args: Vec<String>,
    pub runs_dir: PathBuf,
    pub device: String,
    pub epochs: u32,
    pub image_size: u32,
    pub batch: u32,
    pub base_model: String,
    pub augment: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["train.py".to_string()],
            runs_dir: default_data_dir().join("runs"),
            device: "0".to_string(),
            epochs: 100,
            image_size: 640,
            batch: 16,
            base_model: "yolov8n.pt".to_string(),
            augment: true,
        }
    }
}

// ========== 输出 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub enabled: bool,
    /// 共享内存文件; 为空则只在进程内保留最新帧
    pub shared_memory_path: Option<PathBuf>,
    /// 发送每个检测框的 `/yoloflow/detection`
    pub publish_detections: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shared_memory_path: Some(std::env::temp_dir().join("yoloflow_egress.shm")),
            publish_detections: true,
        }
    }
}

/// 默认数据目录: `~/Documents/yoloflow`, 取不到文档目录时用当前目录
pub fn default_data_dir() -> PathBuf {
    dirs::document_dir()
        .map(|d| d.join("yoloflow"))
        .unwrap_or_else(|| PathBuf::from("yoloflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = FlowConfig::default();
        assert_eq!(c.control.inbound_port, 9000);
        assert_eq!(c.control.outbound_port, 8860);
        assert_eq!(c.capture.capture_interval, CaptureInterval::Frames(5));
        assert_eq!(c.capture.lost_after_frames, 5);
        assert!((c.capture.lost_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(c.source.reconnect_attempts, 3);
    }

    #[test]
    fn test_load_creates_default_then_reads_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        let created = FlowConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.capture, CaptureConfig::default());

        fs::write(
            &path,
            r#"{"capture": {"capture_interval": {"millis": 250}, "snap_iou_threshold": 0.3}}"#,
        )
        .unwrap();
        let loaded = FlowConfig::load(&path).unwrap();
        assert_eq!(loaded.capture.capture_interval, CaptureInterval::Millis(250));
        assert!((loaded.capture.snap_iou_threshold - 0.3).abs() < 1e-6);
        assert_eq!(loaded.capture.detector_cadence, 15);
        assert_eq!(loaded.control.inbound_port, 9000);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(FlowConfig::load(&path), Err(FlowError::Config(_))));
    }

    #[test]
    fn test_apply_parameter() {
        let mut c = CaptureConfig::default();
        c.apply_parameter("confidence", 0.7).unwrap();
        assert!((c.accept_confidence - 0.7).abs() < 1e-6);
        c.apply_parameter("capture_interval", 10.0).unwrap();
        assert_eq!(c.capture_interval, CaptureInterval::Frames(10));
        c.apply_parameter("lost_recovery", 1.0).unwrap();
        assert_eq!(c.lost_recovery, LostRecovery::RearmFromDetector);

        assert!(c.apply_parameter("snap_iou", 1.5).is_err());
        assert!(c.apply_parameter("volume", 0.5).is_err());
        // 非法值不改变原配置
        assert!((c.snap_iou_threshold - 0.5).abs() < 1e-6);
    }
}

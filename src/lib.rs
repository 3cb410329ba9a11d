// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
#![allow(clippy::type_complexity)]

pub mod capture; // 采集调度与会话
pub mod config; // JSON 配置
pub mod control; // OSC 控制通道
pub mod dataset; // 数据集写入/审核/整理
pub mod detection; // 跟踪器与检测器
pub mod error; // 错误类型
pub mod input; // 视频输入与输出
pub mod training; // 训练任务监管

pub use crate::capture::{CaptureSession, Command, SessionHandle, SessionReport};
pub use crate::config::FlowConfig;
pub use crate::control::{ControlChannel, ControlMessage};
pub use crate::dataset::{ClassRegistry, DatasetWriter, Sample, SharedRegistry};
pub use crate::detection::{BBox, Detection, Detector, TemplateTracker, Tracker};
pub use crate::error::{FlowError, Result};
pub use crate::input::{open_source, Frame, FrameSource, SourceEvent};
pub use crate::training::{TrainingRun, TrainingSupervisor};

/// 本地时间戳字符串, 各字段之间用 `delimiter` 分隔, 末尾带毫秒
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%3f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}

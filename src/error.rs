//! 错误类型 (Error taxonomy)
//!
//! 按影响范围分三类:
//! - 会话级: `SourceUnavailable` → 强制停止采集会话
//! - 单帧/单样本级: `UnknownClass` / `WriteFailure` / `InvalidRegion` → 记录日志后跳过
//! - 训练级: `RunAlreadyActive` / `TrainingProcessCrashed` → 只影响训练任务

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    /// 视频源丢失 (重连次数用尽)
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),

    /// 等待下一帧超时
    #[error("timed out waiting for a frame from {0}")]
    SourceTimeout(String),

    /// 追踪丢失 (可恢复的状态迁移, 不是硬错误)
    #[error("tracking lost after {frames} low-confidence frames")]
    TrackingLost { frames: u32 },

    #[error("unknown class id {0}")]
    UnknownClass(u32),

    #[error("failed to write sample: {0}")]
    WriteFailure(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("no such sample {0}")]
    UnknownSample(String),

    #[error("a training run is already active on device {device} ({run_id})")]
    RunAlreadyActive { device: String, run_id: String },

    #[error("training process crashed: {0}")]
    TrainingProcessCrashed(String),

    #[error("unknown training run {0}")]
    UnknownRun(String),

    /// 控制通道发送失败 (尽力而为, 调用方吞掉)
    #[error("control channel send failed: {0}")]
    ControlChannelSendFailure(String),

    #[error("control message codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// 会话级错误: 终止当前采集会话
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, FlowError::SourceUnavailable(_))
    }

    /// 单样本错误: 跳过该样本, 会话继续
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            FlowError::UnknownClass(_)
                | FlowError::WriteFailure(_)
                | FlowError::InvalidRegion(_)
                | FlowError::Io(_)
                | FlowError::Image(_)
        )
    }
}

impl From<rosc::OscError> for FlowError {
    fn from(e: rosc::OscError) -> Self {
        FlowError::Codec(format!("{:?}", e))
    }
}

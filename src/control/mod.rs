//! 控制通道 (Control Channel)
//!
//! 与外部实时宿主之间的双向消息总线. 只负责编解码和收发, 不含业务逻辑.
//! 尽力而为: 没有确认和重传, 发送失败被吞掉.

pub mod codec;
pub mod loopback;
pub mod udp;

pub use loopback::LoopbackChannel;
pub use udp::UdpControlChannel;

use crate::detection::BBox;

/// 控制消息
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    // ========== 入站 (宿主 → 本进程) ==========
    StartRecording,
    StopRecording,
    /// 保存下一帧为背景样本 (空标签)
    CaptureBackground,
    /// 运行时参数更新 (后到的值覆盖先到的值)
    SetParameter { name: String, value: f32 },
    /// 宿主侧画框
    DrawBox { region: BBox, class_id: Option<u32> },
    Shutdown,

    // ========== 出站 (本进程 → 宿主) ==========
    Detection {
        class_id: u32,
        confidence: f32,
        region: BBox,
        frame_seq: u64,
    },
    DetectionCount { count: u32 },
    FrameEnd { frame_seq: u64 },
    Status { state: String, detail: String },
    /// 共享内存输出的几何信息
    Memory {
        path: String,
        width: u32,
        height: u32,
        channels: u32,
    },
    TrainProgress {
        run_id: String,
        epoch: u32,
        total_epochs: u32,
        metrics: Vec<(String, f32)>,
    },
    TrainStatus {
        run_id: String,
        status: String,
        detail: String,
    },
}

impl ControlMessage {
    pub fn status(state: impl Into<String>, detail: impl Into<String>) -> Self {
        ControlMessage::Status {
            state: state.into(),
            detail: detail.into(),
        }
    }

    /// 消息类型标签 (同类消息保持发送顺序)
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartRecording => "record/start",
            ControlMessage::StopRecording => "record/stop",
            ControlMessage::CaptureBackground => "record/background",
            ControlMessage::SetParameter { .. } => "param",
            ControlMessage::DrawBox { .. } => "box",
            ControlMessage::Shutdown => "shutdown",
            ControlMessage::Detection { .. } => "detection",
            ControlMessage::DetectionCount { .. } => "detections/count",
            ControlMessage::FrameEnd { .. } => "frame_end",
            ControlMessage::Status { .. } => "status",
            ControlMessage::Memory { .. } => "memory",
            ControlMessage::TrainProgress { .. } => "train/progress",
            ControlMessage::TrainStatus { .. } => "train/status",
        }
    }
}

/// 控制通道接口
///
/// `send` 必须立即返回 (不得阻塞采集循环); `try_receive` 非阻塞轮询.
pub trait ControlChannel: Send + Sync {
    fn send(&self, message: ControlMessage);

    fn try_receive(&self) -> Option<ControlMessage>;
}

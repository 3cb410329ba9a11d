/// 采集 (Capture)
///
/// - rate:      采样限速
/// - scheduler: 状态机 (纯逻辑, 无 IO)
/// - session:   线程编排
/// - infer:     实时推理模式 (只检测不采集)
pub mod infer;
pub mod rate;
pub mod scheduler;
pub mod session;

pub use infer::{InferenceHandle, InferenceReport, InferenceSession};
pub use rate::RateLimiter;
pub use scheduler::{Action, CaptureState, Command, Scheduler, SchedulerStats};
pub use session::{CaptureSession, SessionHandle, SessionReport};

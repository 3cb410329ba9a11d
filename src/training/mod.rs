/// 训练 (Training)
///
/// - progress:   训练输出解析
/// - runner:     外部训练进程
/// - supervisor: 任务监管 (每设备一个活动任务)
pub mod progress;
pub mod runner;
pub mod supervisor;

pub use progress::{ProgressEvent, ProgressParser};
pub use runner::{JobHandle, JobRunner, JobSpec, ProcessRunner};
pub use supervisor::{RunStatus, TrainJob, TrainingRun, TrainingSupervisor};

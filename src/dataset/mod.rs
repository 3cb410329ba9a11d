/// 数据集 (Dataset)
///
/// - registry: 类别注册表
/// - label:    YOLO 标签格式
/// - writer:   样本原子写入与崩溃恢复
/// - review:   审核 (版本化编辑/删除)
/// - prepare:  训练前整理
pub mod label;
pub mod prepare;
pub mod registry;
pub mod review;
pub mod writer;

pub use label::Label;
pub use prepare::{prepare_dataset, DatasetSummary};
pub use registry::{ClassEntry, ClassRegistry, SharedRegistry};
pub use review::{delete, find_sample, list_samples, relabel, SampleRecord};
pub use writer::{DatasetWriter, RecoveryReport, Sample, BACKGROUND_DIR};

/// YOLOFlow 操作台
///
/// 子命令:
/// - capture: 实时采集 (跟踪 + 检测校正 + 限速写盘), 通过 OSC 与宿主通信
/// - infer:   实时推理 (只检测, 结果发给宿主)
/// - classes: 类别管理
/// - review:  样本审核 (版本化编辑/删除)
/// - prepare: 生成 dataset.yaml
/// - train:   启动并监管外部训练进程
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use yoloflow_rs::capture::{CaptureSession, Command, InferenceSession};
use yoloflow_rs::config::FlowConfig;
use yoloflow_rs::control::{ControlChannel, UdpControlChannel};
use yoloflow_rs::dataset::{self, ClassRegistry, DatasetWriter, SharedRegistry};
use yoloflow_rs::detection::{BBox, Detector, TemplateTracker};
use yoloflow_rs::input::egress::{FrameSink, LatestFrameSlot, SharedMemorySink};
use yoloflow_rs::input::open_source;
use yoloflow_rs::training::{JobRunner, ProcessRunner, RunStatus, TrainJob, TrainingSupervisor};

#[derive(Parser, Debug)]
#[command(author, version, about = "YOLOFlow - 采集、审核、训练一体化操作台", long_about = None)]
struct Args {
    /// 配置文件 (不存在时自动创建)
    #[arg(short, long, default_value = "flow.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// 实时采集
    Capture {
        /// 视频源: synthetic:<W>x<H>[@fps] / dir:<path> / ffmpeg:<url>
        #[arg(short, long)]
        source: Option<String>,

        /// 初始框 x,y,w,h (源像素)
        #[arg(long, value_parser = parse_box)]
        r#box: Option<BBox>,

        /// 类别名 (不存在时自动注册)
        #[arg(long)]
        class: Option<String>,

        /// 启动后立即开始录制
        #[arg(long, default_value_t = false)]
        record: bool,

        /// ONNX 检测模型 (需要 onnx 功能)
        #[arg(long)]
        model: Option<PathBuf>,

        /// 运行秒数; 不指定则直到宿主发送关闭或源结束
        #[arg(long)]
        duration: Option<f64>,
    },

    /// 实时推理: 每帧检测结果发给宿主, 标注帧写入共享内存
    Infer {
        #[arg(short, long)]
        source: Option<String>,

        /// ONNX 检测模型 (默认取配置里的 detector.model_path)
        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long)]
        duration: Option<f64>,
    },

    /// 类别管理
    Classes {
        #[command(subcommand)]
        action: ClassAction,
    },

    /// 样本审核
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// 生成 dataset.yaml
    Prepare,

    /// 清理崩溃遗留的临时文件和孤立图片
    Recover,

    /// 训练
    Train {
        #[arg(long)]
        epochs: Option<u32>,

        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        base_model: Option<String>,

        /// 把进度转发给宿主
        #[arg(long, default_value_t = false)]
        relay: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ClassAction {
    List,
    Add { name: String },
    Rename { old: String, new: String },
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum ReviewAction {
    /// 列出样本
    List {
        #[arg(long)]
        class: Option<String>,
    },
    /// 删除样本 (移入 .deleted/)
    Delete { class: String, base: String },
    /// 修改类别和/或框 (生成新版本)
    Relabel {
        class: String,
        base: String,
        /// 新类别名
        #[arg(long)]
        to: Option<String>,
        /// 新框 x,y,w,h
        #[arg(long, value_parser = parse_box)]
        r#box: Option<BBox>,
    },
}

fn parse_box(s: &str) -> std::result::Result<BBox, String> {
    let v: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{}: {}", p, e)))
        .collect::<std::result::Result<_, _>>()?;
    match v.as_slice() {
        [x, y, w, h] => Ok(BBox::new(*x, *y, *w, *h)),
        _ => Err("expected x,y,w,h".to_string()),
    }
}

fn open_registry(config: &FlowConfig) -> Result<SharedRegistry> {
    let registry = ClassRegistry::open(&config.dataset.root)
        .with_context(|| format!("打开类别注册表 {}", config.dataset.root.display()))?;
    Ok(SharedRegistry::new(registry))
}

fn class_id(registry: &SharedRegistry, name: &str) -> Result<u32> {
    registry
        .read()?
        .id_of(name)
        .ok_or_else(|| anyhow!("未知类别 '{}'", name))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = FlowConfig::load(&args.config)?;

    match args.command {
        Cmd::Capture {
            source,
            r#box,
            class,
            record,
            model,
            duration,
        } => capture(config, source, r#box, class, record, model, duration),
        Cmd::Infer {
            source,
            model,
            duration,
        } => infer(config, source, model, duration),
        Cmd::Classes { action } => classes(&config, action),
        Cmd::Review { action } => review(&config, action),
        Cmd::Prepare => {
            let registry = open_registry(&config)?;
            let summary = dataset::prepare_dataset(&config.dataset.root, &registry)?;
            info!("✅ {}", summary.yaml_path.display());
            Ok(())
        }
        Cmd::Recover => {
            let report = DatasetWriter::recover(&config.dataset.root)?;
            info!(
                "✅ 删除临时文件 {} 个, 孤立图片 {} 个",
                report.temp_files_removed, report.orphan_images_removed
            );
            Ok(())
        }
        Cmd::Train {
            epochs,
            device,
            base_model,
            relay,
        } => train(&config, epochs, device, base_model, relay),
    }
}

fn capture(
    config: FlowConfig,
    source: Option<String>,
    region: Option<BBox>,
    class: Option<String>,
    record: bool,
    model: Option<PathBuf>,
    duration: Option<f64>,
) -> Result<()> {
    let registry = open_registry(&config)?;
    DatasetWriter::recover(&config.dataset.root)?;
    let class_id = match &class {
        Some(name) => Some(registry.add(name)?),
        None => None,
    };
    if region.is_some() && class_id.is_none() {
        bail!("--box 需要同时指定 --class");
    }

    let source_id = source.unwrap_or_else(|| config.source.source_id.clone());
    let source = open_source(&source_id, &config.source)?;
    let channel: Arc<dyn ControlChannel> = Arc::new(UdpControlChannel::bind(&config.control)?);
    info!(
        "📡 OSC 监听 {}:{} → 宿主 {}:{}",
        config.control.listen_host,
        config.control.inbound_port,
        config.control.host,
        config.control.outbound_port
    );

    let writer = DatasetWriter::new(&config.dataset.root, registry, config.dataset.jpeg_quality)?;
    let tracker = TemplateTracker::new(config.tracker.clone());
    let mut session = CaptureSession::new(source, tracker, &config, writer, channel.clone());
    if let Some(id) = class_id {
        session = session.with_default_class(id);
    }

    if let Some(path) = model.or_else(|| config.detector.model_path.clone()) {
        match load_detector(&path, &config) {
            Ok(detector) => session = session.with_detector(detector),
            Err(e) if !cfg!(feature = "onnx") => warn!("⚠️ {:#}, 只用跟踪器", e),
            Err(e) => return Err(e),
        }
    }

    if let Some(sink) = egress_sink(&config, &channel) {
        session = session.with_sink(sink);
    }

    let commands = session.commands();
    if let (Some(region), Some(class_id)) = (region, class_id) {
        commands.send(Command::DrawBox { region, class_id })?;
        if record {
            commands.send(Command::StartRecording)?;
        }
    } else if record {
        warn!("⚠️ 没有初始框, 忽略 --record");
    }

    let handle = session.spawn()?;
    let report = match duration {
        Some(secs) => {
            let deadline = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
            while Instant::now() < deadline && !handle.is_finished() {
                std::thread::sleep(Duration::from_millis(50));
            }
            handle.shutdown()
        }
        None => handle.join(),
    };

    info!(
        "📋 帧 {} (丢 {}) | 样本 {} (失败 {}) | 检测 接受 {} / 丢弃 {} | 结束状态 {}",
        report.frames_seen,
        report.frames_dropped,
        report.samples_written,
        report.write_failures,
        report.detections_accepted,
        report.detections_discarded,
        report.final_state
    );
    match report.error {
        Some(e) => bail!("采集会话异常结束: {}", e),
        None => Ok(()),
    }
}

fn egress_sink(config: &FlowConfig, channel: &Arc<dyn ControlChannel>) -> Option<Box<dyn FrameSink>> {
    if !config.egress.enabled {
        return None;
    }
    let sink: Box<dyn FrameSink> = match &config.egress.shared_memory_path {
        Some(path) => Box::new(SharedMemorySink::new(path, Some(channel.clone()))),
        None => Box::new(LatestFrameSlot::new()),
    };
    Some(sink)
}

#[cfg(feature = "onnx")]
fn load_detector(path: &std::path::Path, config: &FlowConfig) -> Result<Box<dyn Detector>> {
    let detector = yoloflow_rs::detection::OnnxDetector::new(path, &config.detector)?;
    info!("📦 检测模型: {}", path.display());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "onnx"))]
fn load_detector(path: &std::path::Path, _config: &FlowConfig) -> Result<Box<dyn Detector>> {
    bail!("未启用 onnx 功能, 无法加载检测模型 {}", path.display())
}

fn infer(
    config: FlowConfig,
    source: Option<String>,
    model: Option<PathBuf>,
    duration: Option<f64>,
) -> Result<()> {
    let path = model
        .or_else(|| config.detector.model_path.clone())
        .ok_or_else(|| anyhow!("推理模式需要 --model 或 detector.model_path"))?;
    let detector = load_detector(&path, &config)?;

    let source_id = source.unwrap_or_else(|| config.source.source_id.clone());
    let source = open_source(&source_id, &config.source)?;
    let channel: Arc<dyn ControlChannel> = Arc::new(UdpControlChannel::bind(&config.control)?);
    info!(
        "📡 推理结果 → 宿主 {}:{}",
        config.control.host, config.control.outbound_port
    );

    let mut session = InferenceSession::new(source, detector, &config, channel.clone());
    if let Some(sink) = egress_sink(&config, &channel) {
        session = session.with_sink(sink);
    }

    let handle = session.spawn()?;
    let report = match duration {
        Some(secs) => {
            let deadline = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
            while Instant::now() < deadline && !handle.is_finished() {
                std::thread::sleep(Duration::from_millis(50));
            }
            handle.shutdown()
        }
        None => handle.join(),
    };

    info!(
        "📋 帧 {} (丢 {}) | 推理 {} 帧 (失败 {}) | 检测 {}",
        report.frames_seen,
        report.frames_dropped,
        report.frames_inferred,
        report.inference_failures,
        report.detections_published
    );
    match report.error {
        Some(e) => bail!("推理异常结束: {}", e),
        None => Ok(()),
    }
}

fn classes(config: &FlowConfig, action: ClassAction) -> Result<()> {
    let registry = open_registry(config)?;
    match action {
        ClassAction::List => {
            for entry in registry.read()?.classes() {
                println!("{:>4}  {}", entry.id, entry.name);
            }
        }
        ClassAction::Add { name } => {
            let id = registry.add(&name)?;
            info!("✅ 类别 {} = {}", name, id);
        }
        ClassAction::Rename { old, new } => {
            let id = class_id(&registry, &old)?;
            registry.rename(id, &new)?;
            info!("✅ 类别 {} → {}", old, new);
        }
        ClassAction::Remove { name } => {
            let id = class_id(&registry, &name)?;
            registry.remove(id)?;
            info!("✅ 类别 {} (ID {}) 已退役", name, id);
        }
    }
    Ok(())
}

fn review(config: &FlowConfig, action: ReviewAction) -> Result<()> {
    let root = &config.dataset.root;
    match action {
        ReviewAction::List { class } => {
            for sample in dataset::list_samples(root)? {
                if class.as_ref().is_some_and(|c| *c != sample.class_name) {
                    continue;
                }
                let labels: Vec<String> = sample.labels.iter().map(|l| l.to_line()).collect();
                println!("{}/{}  {}", sample.class_name, sample.base, labels.join(" | "));
            }
        }
        ReviewAction::Delete { class, base } => {
            let sample = dataset::find_sample(root, &class, &base)?;
            dataset::delete(root, &sample)?;
        }
        ReviewAction::Relabel {
            class,
            base,
            to,
            r#box,
        } => {
            let registry = open_registry(config)?;
            let sample = dataset::find_sample(root, &class, &base)?;
            let target = to.as_deref().unwrap_or(&class);
            let id = class_id(&registry, target)?;
            let updated = dataset::relabel(root, &registry, &sample, id, r#box)?;
            info!("✅ 新版本 {}/{}", updated.class_name, updated.base);
        }
    }
    Ok(())
}

fn train(
    config: &FlowConfig,
    epochs: Option<u32>,
    device: Option<String>,
    base_model: Option<String>,
    relay: bool,
) -> Result<()> {
    let registry = open_registry(config)?;
    let summary = dataset::prepare_dataset(&config.dataset.root, &registry)?;

    let mut job = TrainJob::from_config(&config.training, &summary.yaml_path);
    if let Some(epochs) = epochs {
        job.epochs = epochs;
    }
    if let Some(device) = device {
        job.device = device;
    }
    if let Some(base_model) = base_model {
        job.base_model = base_model;
    }

    // 转发进度时只发不收: 监听随机端口, 不占用采集的入站端口
    let channel: Option<Arc<dyn ControlChannel>> = if relay {
        let listen: SocketAddr = format!("{}:0", config.control.listen_host).parse()?;
        let target: SocketAddr =
            format!("{}:{}", config.control.host, config.control.outbound_port).parse()?;
        Some(Arc::new(UdpControlChannel::bind_to(
            listen,
            target,
            config.control.send_queue,
        )?))
    } else {
        None
    };

    let runner: Arc<dyn JobRunner> = Arc::new(ProcessRunner::new(
        config.training.program.clone(),
        config.training.args.clone(),
    ));
    let supervisor = TrainingSupervisor::new(&config.training.runs_dir, runner, channel);
    let run = supervisor.start(job)?;
    info!("🏋️ 训练任务 {} → {}", run.run_id, run.run_dir.display());

    let done = supervisor.wait(&run.run_id)?;
    info!(
        "📋 {} {} | epoch {}/{} | {}",
        done.run_id,
        done.status.as_str(),
        done.epoch,
        done.total_epochs,
        done.detail
    );
    if done.status == RunStatus::Completed {
        Ok(())
    } else {
        bail!("训练任务 {} 未成功: {}", done.run_id, done.detail)
    }
}

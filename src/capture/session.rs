//! 采集会话 (Capture Session)
//!
//! 线程布局:
//! - frame:    帧源 → 调度 (实时源 try_send 丢帧, 非实时源阻塞)
//! - capture:  调度循环, 每轮先处理命令和检测结果, 再处理下一帧
//! - detector: 检测工作线程 (可选)
//! - writer:   数据集写盘
//! - control:  轮询控制通道, 入站消息转成命令
//!
//! 阶段之间只通过 crossbeam 通道交接, 唯一共享的可变状态是类别注册表.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, trace, warn};

use super::scheduler::{Action, CaptureState, Command, Scheduler};
use crate::config::FlowConfig;
use crate::control::{ControlChannel, ControlMessage};
use crate::dataset::DatasetWriter;
use crate::detection::{BBox, Detection, DetectionRequest, Detector, DetectorWorker, Tracker};
use crate::error::{FlowError, Result};
use crate::input::egress::{annotate, FrameSink};
use crate::input::{Frame, FrameSource, SourceEvent};

/// 调度循环等待帧的最长时间 (期间仍会处理命令)
pub(super) const LOOP_TICK: Duration = Duration::from_millis(20);
const CONTROL_POLL: Duration = Duration::from_millis(5);

/// 会话结束时的汇总
#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub frames_seen: u64,
    pub frames_dropped: u64,
    pub samples_written: u64,
    pub write_failures: u64,
    pub detections_accepted: u64,
    pub detections_discarded: u64,
    /// 会话结束前 (收尾停止之前) 的状态
    pub final_state: CaptureState,
    /// 会话级错误 (例如视频源丢失)
    pub error: Option<String>,
}

pub(super) enum FrameEvent {
    Frame(Frame),
    End,
    Failed(FlowError),
}

struct WriteJob {
    frame: Frame,
    /// None 表示背景样本
    target: Option<(BBox, u32)>,
}

enum WriteOutcome {
    Written { seq: u64 },
    Failed { seq: u64 },
}

pub struct CaptureSession<T: Tracker> {
    source: Box<dyn FrameSource>,
    scheduler: Scheduler<T>,
    writer: DatasetWriter,
    channel: Arc<dyn ControlChannel>,
    detector: Option<Box<dyn Detector>>,
    sink: Option<Box<dyn FrameSink>>,
    default_class: Option<u32>,
    publish_detections: bool,
    frame_timeout: Duration,
    frame_queue: usize,
    write_queue: usize,
    commands: (Sender<Command>, Receiver<Command>),
}

impl<T> CaptureSession<T>
where
    T: Tracker + 'static,
    T::State: 'static,
{
    /// `source` 必须已经打开 (`open_source` 返回的源已打开)
    pub fn new(
        source: Box<dyn FrameSource>,
        tracker: T,
        config: &FlowConfig,
        writer: DatasetWriter,
        channel: Arc<dyn ControlChannel>,
    ) -> Self {
        Self {
            source,
            scheduler: Scheduler::new(tracker, config.capture.clone(), false),
            writer,
            channel,
            detector: None,
            sink: None,
            default_class: None,
            publish_detections: config.egress.publish_detections,
            frame_timeout: Duration::from_millis(config.source.frame_timeout_ms.max(1)),
            frame_queue: config.source.frame_queue.max(1),
            write_queue: config.capture.write_queue.max(1),
            commands: unbounded(),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// 标注帧输出
    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 宿主画框未带类别时使用的类别
    pub fn with_default_class(mut self, class_id: u32) -> Self {
        self.default_class = Some(class_id);
        self
    }

    /// 命令发送端; 启动前发送的命令在处理第一帧之前生效
    pub fn commands(&self) -> Sender<Command> {
        self.commands.0.clone()
    }

    pub fn spawn(self) -> Result<SessionHandle> {
        let CaptureSession {
            source,
            scheduler,
            writer,
            channel,
            detector,
            sink,
            default_class,
            publish_detections,
            frame_timeout,
            frame_queue,
            write_queue,
            commands: (cmd_tx, cmd_rx),
        } = self;

        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let (frame_tx, frame_rx) = bounded::<FrameEvent>(frame_queue);
        let frame_thread = {
            let stop = stop.clone();
            let dropped = dropped.clone();
            std::thread::Builder::new()
                .name("frame".into())
                .spawn(move || frame_stage(source, frame_tx, frame_timeout, stop, dropped))?
        };

        let control_thread = {
            let stop = stop.clone();
            let channel = channel.clone();
            let cmd_tx = cmd_tx.clone();
            std::thread::Builder::new()
                .name("control".into())
                .spawn(move || control_stage(channel, cmd_tx, default_class, stop))?
        };

        let (write_tx, write_rx) = bounded::<WriteJob>(write_queue);
        let (done_tx, done_rx) = unbounded::<WriteOutcome>();
        let writer_thread = std::thread::Builder::new()
            .name("writer".into())
            .spawn(move || writer_stage(writer, write_rx, done_tx))?;

        let worker = detector.map(DetectorWorker::spawn).transpose()?;
        let scheduler = scheduler.with_detector(worker.is_some());

        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let mut pipeline = Pipeline {
                    scheduler,
                    channel,
                    worker,
                    write_tx: Some(write_tx),
                    done_rx,
                    sink,
                    overlay: Vec::new(),
                    publish_detections,
                    samples_written: 0,
                    write_failures: 0,
                };
                let report = pipeline.run(cmd_rx, frame_rx, &dropped);

                stop.store(true, Ordering::SeqCst);
                let _ = frame_thread.join();
                let _ = control_thread.join();
                let report = pipeline.finish(writer_thread, report);
                info!(
                    "🏁 采集会话结束: {} 帧 (丢 {}), 写入 {} 个样本, 失败 {}",
                    report.frames_seen,
                    report.frames_dropped,
                    report.samples_written,
                    report.write_failures
                );
                report
            })?;

        Ok(SessionHandle {
            commands: cmd_tx,
            handle,
        })
    }
}

/// 运行中会话的句柄
pub struct SessionHandle {
    commands: Sender<Command>,
    handle: JoinHandle<SessionReport>,
}

impl SessionHandle {
    /// 发送命令; 会话已结束时返回 false
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commands(&self) -> Sender<Command> {
        self.commands.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 请求结束并等待汇总
    pub fn shutdown(self) -> SessionReport {
        let _ = self.commands.send(Command::Shutdown);
        self.join()
    }

    /// 等待会话自然结束 (源读完、致命错误或收到 Shutdown)
    pub fn join(self) -> SessionReport {
        self.handle.join().unwrap_or_else(|_| SessionReport {
            frames_seen: 0,
            frames_dropped: 0,
            samples_written: 0,
            write_failures: 0,
            detections_accepted: 0,
            detections_discarded: 0,
            final_state: CaptureState::Idle,
            error: Some("capture thread panicked".to_string()),
        })
    }
}

pub(super) fn frame_stage(
    mut source: Box<dyn FrameSource>,
    tx: Sender<FrameEvent>,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    let live = source.is_live();
    info!("🎬 帧源 {} 启动 (实时: {})", source.source_id(), live);

    while !stop.load(Ordering::SeqCst) {
        match source.next_frame(timeout) {
            Ok(SourceEvent::Frame(frame)) => {
                if live {
                    match tx.try_send(FrameEvent::Frame(frame)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(FrameEvent::Frame(f))) => {
                            trace!("调度繁忙, 丢弃帧 #{}", f.seq);
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    }
                } else if tx.send(FrameEvent::Frame(frame)).is_err() {
                    break;
                }
            }
            Ok(SourceEvent::Timeout) => trace!("等待帧超时"),
            Ok(SourceEvent::EndOfStream) => {
                info!("📭 帧源 {} 已读完", source.source_id());
                let _ = tx.send(FrameEvent::End);
                break;
            }
            Err(e) => {
                error!("❌ 帧源 {} 失败: {}", source.source_id(), e);
                let _ = tx.send(FrameEvent::Failed(e));
                break;
            }
        }
    }
    source.close();
}

fn control_stage(
    channel: Arc<dyn ControlChannel>,
    commands: Sender<Command>,
    default_class: Option<u32>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let mut idle = true;
        while let Some(message) = channel.try_receive() {
            idle = false;
            debug!("📨 控制消息 {:?}", message);
            if let Some(command) = Command::from_message(message, default_class) {
                if commands.send(command).is_err() {
                    return;
                }
            }
        }
        if idle {
            std::thread::sleep(CONTROL_POLL);
        }
    }
}

fn writer_stage(mut writer: DatasetWriter, jobs: Receiver<WriteJob>, done: Sender<WriteOutcome>) {
    info!("💾 写盘线程启动: {}", writer.root().display());
    // 发送端关闭后把队列里剩余的任务写完
    for job in jobs.iter() {
        let seq = job.frame.seq;
        let written = match job.target {
            Some((region, class_id)) => writer.persist(&job.frame, &region, class_id),
            None => writer.persist_background(&job.frame),
        };
        let outcome = match written {
            Ok(sample) => {
                debug!("📸 帧 #{} → {}", seq, sample.image_path.display());
                WriteOutcome::Written { seq }
            }
            Err(e) => {
                if e.is_per_sample() {
                    warn!("⚠️ 跳过帧 #{} 的样本: {}", seq, e);
                } else {
                    error!("❌ 帧 #{} 写入失败: {}", seq, e);
                }
                WriteOutcome::Failed { seq }
            }
        };
        let _ = done.send(outcome);
    }
}

/// 调度线程持有的状态
struct Pipeline<T: Tracker> {
    scheduler: Scheduler<T>,
    channel: Arc<dyn ControlChannel>,
    worker: Option<DetectorWorker>,
    write_tx: Option<Sender<WriteJob>>,
    done_rx: Receiver<WriteOutcome>,
    sink: Option<Box<dyn FrameSink>>,
    /// 最近一次被接受的检测 (用于标注输出)
    overlay: Vec<Detection>,
    publish_detections: bool,
    samples_written: u64,
    write_failures: u64,
}

impl<T: Tracker> Pipeline<T> {
    fn run(
        &mut self,
        commands: Receiver<Command>,
        frames: Receiver<FrameEvent>,
        dropped: &AtomicU64,
    ) -> SessionReport {
        let mut frames_seen = 0u64;
        let mut error = None;

        // 统计窗口 (每秒)
        let mut window_frames = 0u64;
        let mut window_start = Instant::now();

        let final_state = 'session: loop {
            // 命令优先: 停止在下一帧之前生效
            while let Ok(command) = commands.try_recv() {
                let shutdown = command == Command::Shutdown;
                let state = self.scheduler.state();
                let actions = self.scheduler.handle(command);
                self.execute(actions, None);
                if shutdown {
                    break 'session state;
                }
            }

            if let Some(worker) = &self.worker {
                let responses: Vec<_> = worker.responses().try_iter().collect();
                for response in responses {
                    trace!(
                        "检测结果 #{} ({} 个, {:.1}ms)",
                        response.seq,
                        response.detections.len(),
                        response.inference_ms
                    );
                    let actions = self.scheduler.on_detection(response);
                    if actions
                        .iter()
                        .any(|a| matches!(a, Action::Publish(ControlMessage::FrameEnd { .. })))
                    {
                        self.overlay = actions.iter().filter_map(detection_of).collect();
                    }
                    self.execute(actions, None);
                }
            }

            self.drain_completions();

            match frames.recv_timeout(LOOP_TICK) {
                Ok(FrameEvent::Frame(frame)) => {
                    frames_seen += 1;
                    window_frames += 1;
                    let actions = self.scheduler.on_frame(&frame);
                    self.execute(actions, Some(&frame));
                    self.publish_frame(&frame);
                }
                Ok(FrameEvent::End) => break 'session self.scheduler.state(),
                Ok(FrameEvent::Failed(e)) => {
                    let state = self.scheduler.state();
                    let actions = self.scheduler.fail(&e);
                    self.execute(actions, None);
                    error = Some(e.to_string());
                    break 'session state;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break 'session self.scheduler.state(),
            }

            let elapsed = window_start.elapsed().as_secs_f64();
            if elapsed >= 1.0 {
                debug!(
                    "📊 采集统计: {:.1}fps | 丢帧 {} | 样本 {} | 状态 {}",
                    window_frames as f64 / elapsed,
                    dropped.load(Ordering::Relaxed),
                    self.samples_written,
                    self.scheduler.state()
                );
                window_frames = 0;
                window_start = Instant::now();
            }
        };

        // 收尾: 任何非 Idle 状态都回到 Idle
        let actions = self.scheduler.stop("session ended");
        self.execute(actions, None);

        let stats = self.scheduler.stats();
        SessionReport {
            frames_seen,
            frames_dropped: dropped.load(Ordering::Relaxed),
            samples_written: self.samples_written,
            write_failures: self.write_failures,
            detections_accepted: stats.detections_accepted,
            detections_discarded: stats.detections_discarded,
            final_state,
            error,
        }
    }

    /// 等待写盘队列写完, 放弃在途检测
    fn finish(&mut self, writer_thread: JoinHandle<()>, mut report: SessionReport) -> SessionReport {
        self.write_tx = None;
        let _ = writer_thread.join();
        self.drain_completions();
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        report.samples_written = self.samples_written;
        report.write_failures = self.write_failures;
        report
    }

    fn drain_completions(&mut self) {
        for outcome in self.done_rx.try_iter() {
            match outcome {
                WriteOutcome::Written { seq } => {
                    trace!("帧 #{} 已写入", seq);
                    self.samples_written += 1;
                }
                WriteOutcome::Failed { seq } => {
                    trace!("帧 #{} 写入失败", seq);
                    self.write_failures += 1;
                }
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>, frame: Option<&Frame>) {
        for action in actions {
            match action {
                Action::Persist {
                    seq,
                    region,
                    class_id,
                } => {
                    let Some(frame) = frame.filter(|f| f.seq == seq) else {
                        continue;
                    };
                    let job = WriteJob {
                        frame: frame.clone(),
                        target: Some((region, class_id)),
                    };
                    self.enqueue(job);
                }
                Action::PersistBackground { seq } => {
                    let Some(frame) = frame.filter(|f| f.seq == seq) else {
                        continue;
                    };
                    self.enqueue(WriteJob {
                        frame: frame.clone(),
                        target: None,
                    });
                }
                Action::RequestDetection { seq, generation } => {
                    let submitted = match (frame.filter(|f| f.seq == seq), &self.worker) {
                        (Some(frame), Some(worker)) => worker.submit(DetectionRequest {
                            seq,
                            generation,
                            frame: frame.clone(),
                        }),
                        _ => false,
                    };
                    if !submitted {
                        let actions = self.scheduler.on_detection_dropped(seq);
                        self.execute(actions, None);
                    }
                }
                Action::Publish(message) => {
                    let detection_traffic = matches!(
                        message,
                        ControlMessage::Detection { .. }
                            | ControlMessage::DetectionCount { .. }
                            | ControlMessage::FrameEnd { .. }
                    );
                    if detection_traffic && !self.publish_detections {
                        continue;
                    }
                    self.channel.send(message);
                }
            }
        }
    }

    fn enqueue(&mut self, job: WriteJob) {
        let Some(tx) = &self.write_tx else {
            return;
        };
        let seq = job.frame.seq;
        if let Err(TrySendError::Full(_)) = tx.try_send(job) {
            warn!("⚠️ 写盘队列已满, 跳过帧 #{}", seq);
            self.write_failures += 1;
        }
    }

    fn publish_frame(&mut self, frame: &Frame) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let annotated = annotate(frame, self.scheduler.region(), &self.overlay);
        if let Err(e) = sink.publish(&annotated) {
            debug!("输出帧 #{} 失败: {}", frame.seq, e);
        }
    }
}

fn detection_of(action: &Action) -> Option<Detection> {
    match action {
        Action::Publish(ControlMessage::Detection {
            class_id,
            confidence,
            region,
            ..
        }) => Some(Detection {
            class_id: *class_id,
            bbox: *region,
            confidence: *confidence,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureInterval;
    use crate::control::LoopbackChannel;
    use crate::dataset::{list_samples, ClassRegistry, SharedRegistry};
    use crate::detection::TemplateTracker;
    use crate::input::egress::LatestFrameSlot;
    use crate::input::synthetic::{Motion, SyntheticSource};

    fn setup(dir: &std::path::Path) -> (DatasetWriter, u32) {
        let registry = SharedRegistry::new(ClassRegistry::open(dir).unwrap());
        let id = registry.add("target").unwrap();
        (DatasetWriter::new(dir, registry, 90).unwrap(), id)
    }

    fn states(channel: &LoopbackChannel) -> Vec<String> {
        channel
            .sent_of_kind("status")
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::Status { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_session_records_synthetic_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, class_id) = setup(dir.path());
        let mut source = SyntheticSource::new(160, 120, None, Some(40), Motion::Still);
        let target = source.target_box(1);
        source.open().unwrap();

        let channel = Arc::new(LoopbackChannel::new());
        let slot = LatestFrameSlot::new();
        let config = FlowConfig::default();
        let session = CaptureSession::new(
            Box::new(source),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        )
        .with_sink(Box::new(slot.clone()));
        let commands = session.commands();
        commands
            .send(Command::DrawBox {
                region: target,
                class_id,
            })
            .unwrap();
        commands.send(Command::StartRecording).unwrap();

        let report = session.spawn().unwrap().join();
        assert_eq!(report.error, None);
        assert_eq!(report.frames_seen, 40);
        assert_eq!(report.frames_dropped, 0);
        assert_eq!(report.samples_written, 8);
        assert_eq!(report.final_state, CaptureState::Recording);

        let samples = list_samples(dir.path()).unwrap();
        assert_eq!(samples.len(), 8);
        for s in &samples {
            assert_eq!(s.class_name, "target");
            assert!(s.labels.iter().all(|l| l.is_normalized() && l.class_id == class_id));
        }
        assert_eq!(states(&channel), vec!["armed", "recording", "idle"]);
        assert_eq!(slot.latest().map(|f| f.seq), Some(40));
    }

    struct FailingSource {
        produced: u64,
    }

    impl FrameSource for FailingSource {
        fn source_id(&self) -> &str {
            "failing"
        }

        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<SourceEvent> {
            if self.produced == 3 {
                return Err(FlowError::SourceUnavailable("failing".into()));
            }
            self.produced += 1;
            let frame = Frame::new(self.produced, Duration::ZERO, 32, 32, vec![90; 32 * 32 * 4])?;
            Ok(SourceEvent::Frame(frame))
        }

        fn close(&mut self) {}

        fn is_live(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_source_failure_ends_session_with_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, class_id) = setup(dir.path());
        let channel = Arc::new(LoopbackChannel::new());
        let config = FlowConfig::default();
        let session = CaptureSession::new(
            Box::new(FailingSource { produced: 0 }),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        );
        session
            .commands()
            .send(Command::DrawBox {
                region: BBox::new(8.0, 8.0, 12.0, 12.0),
                class_id,
            })
            .unwrap();

        let report = session.spawn().unwrap().join();
        assert!(report.error.unwrap().contains("unavailable"));
        assert_eq!(report.final_state, CaptureState::Armed);
        let last = channel.sent_of_kind("status").pop().unwrap();
        match last {
            ControlMessage::Status { state, detail } => {
                assert_eq!(state, "idle");
                assert!(detail.starts_with("error:"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// 总是报告 `found` 的检测器
    struct FixedDetector {
        found: BBox,
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            Ok(vec![Detection {
                class_id: 0,
                bbox: self.found,
                confidence: 0.9,
            }])
        }
    }

    #[test]
    fn test_host_commands_and_detections_flow_through_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, class_id) = setup(dir.path());
        let mut source = SyntheticSource::new(160, 120, Some(60.0), Some(90), Motion::Still);
        let target = source.target_box(1);
        source.open().unwrap();

        let channel = Arc::new(LoopbackChannel::new());
        let mut config = FlowConfig::default();
        config.capture.detector_cadence = 5;
        config.capture.capture_interval = CaptureInterval::Frames(10);
        let session = CaptureSession::new(
            Box::new(source),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        )
        .with_detector(Box::new(FixedDetector { found: target }))
        .with_default_class(class_id);

        // 宿主画框不带类别, 使用默认类别
        channel.inject(ControlMessage::DrawBox {
            region: target,
            class_id: None,
        });
        channel.inject(ControlMessage::StartRecording);

        let report = session.spawn().unwrap().join();
        assert_eq!(report.error, None);
        assert!(report.samples_written >= 1);
        assert!(report.detections_accepted >= 1);
        assert!(!channel.sent_of_kind("detection").is_empty());
        assert!(!channel.sent_of_kind("frame_end").is_empty());
    }

    #[test]
    fn test_shutdown_stops_without_new_samples() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, class_id) = setup(dir.path());
        let mut source = SyntheticSource::new(160, 120, Some(100.0), None, Motion::Still);
        let target = source.target_box(1);
        source.open().unwrap();

        let channel = Arc::new(LoopbackChannel::new());
        let config = FlowConfig::default();
        let session = CaptureSession::new(
            Box::new(source),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        );
        let commands = session.commands();
        commands
            .send(Command::DrawBox {
                region: target,
                class_id,
            })
            .unwrap();
        commands.send(Command::StartRecording).unwrap();
        let handle = session.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        handle.send(Command::StopRecording);
        std::thread::sleep(Duration::from_millis(100));
        let written_at_stop = list_samples(dir.path()).unwrap().len();
        std::thread::sleep(Duration::from_millis(200));

        let report = handle.shutdown();
        assert_eq!(report.final_state, CaptureState::Idle);
        assert_eq!(report.samples_written as usize, written_at_stop);
        assert_eq!(list_samples(dir.path()).unwrap().len(), written_at_stop);
    }

    #[test]
    fn test_class_removed_while_recording_skips_samples_until_readded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::new(ClassRegistry::open(dir.path()).unwrap());
        let class_id = registry.add("target").unwrap();
        let writer = DatasetWriter::new(dir.path(), registry.clone(), 90).unwrap();
        let mut source = SyntheticSource::new(160, 120, Some(60.0), None, Motion::Still);
        let target = source.target_box(1);
        source.open().unwrap();

        let channel = Arc::new(LoopbackChannel::new());
        let config = FlowConfig::default();
        let session = CaptureSession::new(
            Box::new(source),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        );
        let commands = session.commands();
        commands
            .send(Command::DrawBox {
                region: target,
                class_id,
            })
            .unwrap();
        commands.send(Command::StartRecording).unwrap();
        let handle = session.spawn().unwrap();

        std::thread::sleep(Duration::from_millis(200));
        registry.remove(class_id).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        let readded = registry.add("target").unwrap();
        assert_ne!(readded, class_id);
        handle.send(Command::DrawBox {
            region: target,
            class_id: readded,
        });
        handle.send(Command::StartRecording);
        std::thread::sleep(Duration::from_millis(400));

        let report = handle.shutdown();
        assert_eq!(report.error, None);
        assert!(report.write_failures > 0);
        assert_eq!(report.final_state, CaptureState::Recording);

        let samples = list_samples(dir.path()).unwrap();
        assert_eq!(samples.len() as u64, report.samples_written);
        assert!(samples
            .iter()
            .any(|s| s.labels.iter().all(|l| l.class_id == readded)));
    }

    #[test]
    fn test_background_frame_is_saved_without_box() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = setup(dir.path());
        let mut source = SyntheticSource::new(96, 64, None, Some(10), Motion::Still);
        source.open().unwrap();

        let channel = Arc::new(LoopbackChannel::new());
        let config = FlowConfig::default();
        let session = CaptureSession::new(
            Box::new(source),
            TemplateTracker::new(config.tracker.clone()),
            &config,
            writer,
            channel.clone(),
        );
        session.commands().send(Command::CaptureBackground).unwrap();

        let report = session.spawn().unwrap().join();
        assert_eq!(report.error, None);
        assert_eq!(report.final_state, CaptureState::Idle);
        assert_eq!(report.samples_written, 1);

        let samples = list_samples(dir.path()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].class_name, crate::dataset::BACKGROUND_DIR);
        assert!(samples[0].labels.is_empty());
    }
}

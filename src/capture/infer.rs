//! 实时推理模式 (Live Inference)
//!
//! 帧源 → 检测器 → 控制通道 + 标注帧输出. 不追踪, 不写数据集.
//! 每个推理完成的帧依次发布 `detection` × N, `detections/count`, `frame_end`;
//! 输出的每一帧都叠加最近一次的检测框.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, info, trace, warn};

use super::session::{frame_stage, FrameEvent, LOOP_TICK};
use crate::config::FlowConfig;
use crate::control::{ControlChannel, ControlMessage};
use crate::detection::{Detection, DetectionRequest, DetectionResponse, Detector, DetectorWorker};
use crate::error::Result;
use crate::input::egress::{annotate, FrameSink};
use crate::input::{Frame, FrameSource};

/// 源读完后等待最后一个检测结果的时长
const RESULT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferenceReport {
    pub frames_seen: u64,
    pub frames_dropped: u64,
    pub frames_inferred: u64,
    pub detections_published: u64,
    pub inference_failures: u64,
    pub error: Option<String>,
}

pub struct InferenceSession {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    channel: Arc<dyn ControlChannel>,
    sink: Option<Box<dyn FrameSink>>,
    min_confidence: f32,
    frame_timeout: Duration,
    frame_queue: usize,
}

impl InferenceSession {
    /// `source` 必须已经打开
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        config: &FlowConfig,
        channel: Arc<dyn ControlChannel>,
    ) -> Self {
        Self {
            source,
            detector,
            channel,
            sink: None,
            min_confidence: config.capture.accept_confidence,
            frame_timeout: Duration::from_millis(config.source.frame_timeout_ms.max(1)),
            frame_queue: config.source.frame_queue.max(1),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn spawn(self) -> Result<InferenceHandle> {
        let InferenceSession {
            source,
            detector,
            channel,
            sink,
            min_confidence,
            frame_timeout,
            frame_queue,
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
        let name = detector.name().to_string();
        let worker = DetectorWorker::spawn(detector)?;

        let handle = {
            let stop = stop.clone();
            std::thread::Builder::new().name("infer".into()).spawn(move || {
                let mut inference = Inference {
                    channel,
                    worker,
                    sink,
                    min_confidence,
                    overlay: Vec::new(),
                    pending: 0,
                    report: InferenceReport::default(),
                };
                inference.channel.send(ControlMessage::status("inferring", name));
                inference.run(frame_rx, &stop);

                stop.store(true, Ordering::SeqCst);
                let _ = frame_thread.join();
                inference.worker.shutdown();

                let mut report = inference.report;
                report.frames_dropped = dropped.load(Ordering::Relaxed);
                let detail = match &report.error {
                    Some(e) => format!("error: {}", e),
                    None => "inference stopped".to_string(),
                };
                inference.channel.send(ControlMessage::status("idle", detail));
                info!(
                    "🏁 推理结束: {} 帧 (丢 {}), 推理 {} 帧, {} 个检测, 失败 {}",
                    report.frames_seen,
                    report.frames_dropped,
                    report.frames_inferred,
                    report.detections_published,
                    report.inference_failures
                );
                report
            })?
        };

        Ok(InferenceHandle { stop, handle })
    }
}

/// 运行中推理的句柄
pub struct InferenceHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<InferenceReport>,
}

impl InferenceHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn shutdown(self) -> InferenceReport {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// 等待推理自然结束 (源读完、源失败或宿主发来 shutdown)
    pub fn join(self) -> InferenceReport {
        self.handle.join().unwrap_or_else(|_| InferenceReport {
            error: Some("inference thread panicked".to_string()),
            ..InferenceReport::default()
        })
    }
}

struct Inference {
    channel: Arc<dyn ControlChannel>,
    worker: DetectorWorker,
    sink: Option<Box<dyn FrameSink>>,
    min_confidence: f32,
    overlay: Vec<Detection>,
    /// 已提交但还没有结果的请求数
    pending: u64,
    report: InferenceReport,
}

impl Inference {
    fn run(&mut self, frames: crossbeam_channel::Receiver<FrameEvent>, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            while let Some(message) = self.channel.try_receive() {
                if message == ControlMessage::Shutdown {
                    info!("📨 宿主请求结束推理");
                    return;
                }
                trace!("推理模式忽略控制消息 {}", message.kind());
            }

            let responses: Vec<_> = self.worker.responses().try_iter().collect();
            for response in responses {
                self.on_response(response);
            }

            match frames.recv_timeout(LOOP_TICK) {
                Ok(FrameEvent::Frame(frame)) => {
                    self.report.frames_seen += 1;
                    let request = DetectionRequest {
                        seq: frame.seq,
                        generation: 0,
                        frame: frame.clone(),
                    };
                    // 检测器忙时这一帧只输出, 不推理
                    if self.worker.submit(request) {
                        self.pending += 1;
                    }
                    self.publish_frame(&frame);
                }
                Ok(FrameEvent::End) => break,
                Ok(FrameEvent::Failed(e)) => {
                    self.report.error = Some(e.to_string());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while self.pending > 0 {
            match self.worker.responses().recv_timeout(RESULT_DRAIN) {
                Ok(response) => self.on_response(response),
                Err(_) => {
                    debug!("放弃 {} 个未完成的检测", self.pending);
                    break;
                }
            }
        }
    }

    fn on_response(&mut self, response: DetectionResponse) {
        self.pending = self.pending.saturating_sub(1);
        if let Some(e) = response.error {
            warn!("⚠️ 帧 #{} 推理失败: {}", response.seq, e);
            self.report.inference_failures += 1;
            return;
        }

        let accepted: Vec<Detection> = response
            .detections
            .into_iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        for d in &accepted {
            self.channel.send(ControlMessage::Detection {
                class_id: d.class_id,
                confidence: d.confidence,
                region: d.bbox,
                frame_seq: response.seq,
            });
        }
        self.channel.send(ControlMessage::DetectionCount {
            count: accepted.len() as u32,
        });
        self.channel.send(ControlMessage::FrameEnd {
            frame_seq: response.seq,
        });
        trace!(
            "帧 #{}: {} 个检测 ({:.1}ms)",
            response.seq,
            accepted.len(),
            response.inference_ms
        );

        self.report.frames_inferred += 1;
        self.report.detections_published += accepted.len() as u64;
        self.overlay = accepted;
    }

    fn publish_frame(&mut self, frame: &Frame) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let annotated = annotate(frame, None, &self.overlay);
        if let Err(e) = sink.publish(&annotated) {
            debug!("输出帧 #{} 失败: {}", frame.seq, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::LoopbackChannel;
    use crate::detection::BBox;
    use crate::input::egress::LatestFrameSlot;
    use crate::input::synthetic::{Motion, SyntheticSource};

    /// 固定输出一个框, 或者总是失败
    struct StubDetector {
        found: BBox,
        confidence: f32,
        fail: bool,
    }

    impl Detector for StubDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            if self.fail {
                anyhow::bail!("weights missing");
            }
            Ok(vec![Detection {
                class_id: 2,
                bbox: self.found,
                confidence: self.confidence,
            }])
        }
    }

    fn source(limit: Option<u64>) -> (SyntheticSource, BBox) {
        let mut source = SyntheticSource::new(160, 120, Some(60.0), limit, Motion::Still);
        let target = source.target_box(1);
        source.open().unwrap();
        (source, target)
    }

    fn frame_seqs(channel: &LoopbackChannel, kind: &str) -> Vec<u64> {
        channel
            .sent_of_kind(kind)
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::Detection { frame_seq, .. } | ControlMessage::FrameEnd { frame_seq } => {
                    Some(frame_seq)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_each_inferred_frame_publishes_detections_then_frame_end() {
        let (source, target) = source(Some(30));
        let channel = Arc::new(LoopbackChannel::new());
        let slot = LatestFrameSlot::new();
        let detector = StubDetector {
            found: target,
            confidence: 0.9,
            fail: false,
        };
        let report = InferenceSession::new(
            Box::new(source),
            Box::new(detector),
            &FlowConfig::default(),
            channel.clone(),
        )
        .with_sink(Box::new(slot.clone()))
        .spawn()
        .unwrap()
        .join();

        assert_eq!(report.error, None);
        assert_eq!(report.frames_seen + report.frames_dropped, 30);
        assert!(report.frames_inferred >= 1);
        assert_eq!(report.detections_published, report.frames_inferred);
        assert_eq!(report.inference_failures, 0);

        let ends = frame_seqs(&channel, "frame_end");
        assert_eq!(ends.len() as u64, report.frames_inferred);
        assert_eq!(frame_seqs(&channel, "detection"), ends);
        assert!(channel
            .sent_of_kind("detections/count")
            .iter()
            .all(|m| *m == ControlMessage::DetectionCount { count: 1 }));

        // 每帧的消息顺序: detection → count → frame_end
        let first = ends[0];
        let order: Vec<&str> = channel
            .sent()
            .iter()
            .skip_while(|m| !matches!(m, ControlMessage::Detection { frame_seq, .. } if *frame_seq == first))
            .take(3)
            .map(|m| m.kind())
            .collect();
        assert_eq!(order, vec!["detection", "detections/count", "frame_end"]);

        assert!(slot.latest().is_some());
        // 不写数据集, 也不发录制状态
        let states: Vec<_> = channel.sent_of_kind("status");
        assert_eq!(states.first(), Some(&ControlMessage::status("inferring", "detector")));
        assert_eq!(states.last(), Some(&ControlMessage::status("idle", "inference stopped")));
    }

    #[test]
    fn test_low_confidence_frame_still_ends_with_zero_count() {
        let (source, target) = source(Some(10));
        let channel = Arc::new(LoopbackChannel::new());
        let detector = StubDetector {
            found: target,
            confidence: 0.05,
            fail: false,
        };
        let report = InferenceSession::new(
            Box::new(source),
            Box::new(detector),
            &FlowConfig::default(),
            channel.clone(),
        )
        .spawn()
        .unwrap()
        .join();

        assert!(report.frames_inferred >= 1);
        assert_eq!(report.detections_published, 0);
        assert!(channel.sent_of_kind("detection").is_empty());
        assert_eq!(
            channel.sent_of_kind("frame_end").len() as u64,
            report.frames_inferred
        );
        assert!(channel
            .sent_of_kind("detections/count")
            .iter()
            .all(|m| *m == ControlMessage::DetectionCount { count: 0 }));
    }

    #[test]
    fn test_failed_inference_publishes_nothing() {
        let (source, target) = source(Some(10));
        let channel = Arc::new(LoopbackChannel::new());
        let detector = StubDetector {
            found: target,
            confidence: 0.9,
            fail: true,
        };
        let report = InferenceSession::new(
            Box::new(source),
            Box::new(detector),
            &FlowConfig::default(),
            channel.clone(),
        )
        .spawn()
        .unwrap()
        .join();

        assert_eq!(report.frames_seen + report.frames_dropped, 10);
        assert_eq!(report.frames_inferred, 0);
        assert!(report.inference_failures >= 1);
        assert!(channel.sent_of_kind("frame_end").is_empty());
        assert!(channel.sent_of_kind("detections/count").is_empty());
    }

    #[test]
    fn test_host_shutdown_ends_unbounded_stream() {
        let (source, target) = source(None);
        let channel = Arc::new(LoopbackChannel::new());
        let detector = StubDetector {
            found: target,
            confidence: 0.9,
            fail: false,
        };
        let handle = InferenceSession::new(
            Box::new(source),
            Box::new(detector),
            &FlowConfig::default(),
            channel.clone(),
        )
        .spawn()
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        channel.inject(ControlMessage::Shutdown);

        let started = std::time::Instant::now();
        while !handle.is_finished() && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_finished());
        let report = handle.join();
        assert_eq!(report.error, None);
        assert!(report.frames_seen > 0);
    }
}

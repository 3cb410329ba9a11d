//! 采集调度状态机 (Capture Scheduler)
//!
//! ```text
//! Idle ──画框──▶ Armed ──开始录制──▶ Recording ◀──▶ Correcting
//!  ▲               ▲                   │
//!  │               └──重新画框/检测器──  Lost ◀──置信度崩溃
//!  └────────────── 停止 (任意状态) ─────┘
//! ```
//!
//! 调度器本身不做 IO: 输入是命令、帧和检测结果, 输出是 `Action` 列表,
//! 由会话线程执行 (写盘、提交检测、发送控制消息). 因此可以脱离线程和 GUI 单独测试.

use std::fmt;

use tracing::{debug, info, trace, warn};

use super::rate::RateLimiter;
use crate::config::{CaptureConfig, LostRecovery};
use crate::control::ControlMessage;
use crate::detection::{BBox, Detection, DetectionResponse, Tracker};
use crate::error::FlowError;
use crate::input::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    /// 没有会话
    Idle,
    /// 已画框, 未录制
    Armed,
    /// 录制中
    Recording,
    /// 录制中, 等待检测器校正
    Correcting,
    /// 追踪丢失, 等待操作员
    Lost,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Armed => "armed",
            CaptureState::Recording => "recording",
            CaptureState::Correcting => "correcting",
            CaptureState::Lost => "lost",
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, CaptureState::Recording | CaptureState::Correcting)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作员命令 (GUI 事件或控制消息)
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    DrawBox { region: BBox, class_id: u32 },
    StartRecording,
    StopRecording,
    /// 下一帧存为背景样本 (不需要画框, 任何状态都可以)
    CaptureBackground,
    SetParameter { name: String, value: f32 },
    ClearBox,
    Shutdown,
}

impl Command {
    /// 入站控制消息 → 命令; 宿主画框未带类别时使用 `default_class`
    pub fn from_message(message: ControlMessage, default_class: Option<u32>) -> Option<Self> {
        match message {
            ControlMessage::StartRecording => Some(Command::StartRecording),
            ControlMessage::StopRecording => Some(Command::StopRecording),
            ControlMessage::CaptureBackground => Some(Command::CaptureBackground),
            ControlMessage::SetParameter { name, value } => {
                Some(Command::SetParameter { name, value })
            }
            ControlMessage::DrawBox { region, class_id } => match class_id.or(default_class) {
                Some(class_id) => Some(Command::DrawBox { region, class_id }),
                None => {
                    warn!("⚠️ 宿主画框未指定类别, 且没有默认类别, 忽略");
                    None
                }
            },
            ControlMessage::Shutdown => Some(Command::Shutdown),
            _ => None,
        }
    }
}

/// 调度决策, 由会话执行
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// 把帧 `seq` 连同框写入数据集
    Persist { seq: u64, region: BBox, class_id: u32 },
    /// 把帧 `seq` 写成背景样本 (空标签)
    PersistBackground { seq: u64 },
    /// 对帧 `seq` 调用检测器
    RequestDetection { seq: u64, generation: u64 },
    Publish(ControlMessage),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub frames: u64,
    pub detections_accepted: u64,
    pub detections_discarded: u64,
    pub snaps: u64,
}

pub struct Scheduler<T: Tracker> {
    tracker: T,
    config: CaptureConfig,
    detector_enabled: bool,

    state: CaptureState,
    class_id: Option<u32>,
    tracker_state: Option<T::State>,
    region: Option<BBox>,
    confidence: f32,
    /// 下一帧用该框 (重新) 初始化追踪器
    pending_init: Option<BBox>,
    low_streak: u32,
    rate: RateLimiter,
    /// 停止时递增; 旧代数的检测结果一律丢弃
    generation: u64,
    /// 下一帧存为背景样本
    pending_background: bool,
    /// 正在检测的 (帧序号, 代数)
    in_flight: Option<(u64, u64)>,
    /// 进入录制后的帧数 (检测节奏)
    cadence_frames: u64,
    last_seq: Option<u64>,
    stats: SchedulerStats,
}

impl<T: Tracker> Scheduler<T> {
    pub fn new(tracker: T, config: CaptureConfig, detector_enabled: bool) -> Self {
        Self {
            tracker,
            config,
            detector_enabled,
            state: CaptureState::Idle,
            class_id: None,
            tracker_state: None,
            region: None,
            confidence: 0.0,
            pending_init: None,
            low_streak: 0,
            rate: RateLimiter::new(),
            generation: 0,
            pending_background: false,
            in_flight: None,
            cadence_frames: 0,
            last_seq: None,
            stats: SchedulerStats::default(),
        }
    }

    /// 是否有检测器可用 (没有检测器时不进入 Correcting)
    pub fn with_detector(mut self, enabled: bool) -> Self {
        self.detector_enabled = enabled;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// 当前追踪框 (未初始化时为 None)
    pub fn region(&self) -> Option<BBox> {
        self.region
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn class_id(&self) -> Option<u32> {
        self.class_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    fn transition(&mut self, to: CaptureState, detail: &str, actions: &mut Vec<Action>) {
        if self.state == to {
            return;
        }
        info!("🎬 {} → {}: {}", self.state, to, detail);
        self.state = to;
        actions.push(Action::Publish(ControlMessage::status(to.as_str(), detail)));
    }

    /// 清空追踪并作废所有在途检测
    fn reset(&mut self) {
        self.generation += 1;
        self.in_flight = None;
        self.tracker_state = None;
        self.region = None;
        self.pending_init = None;
        self.class_id = None;
        self.confidence = 0.0;
        self.low_streak = 0;
    }

    /// 回到 Idle (已经是 Idle 时什么都不做)
    pub fn stop(&mut self, detail: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == CaptureState::Idle {
            debug!("已经是 idle, 忽略 {}", detail);
            return actions;
        }
        self.reset();
        self.transition(CaptureState::Idle, detail, &mut actions);
        actions
    }

    pub fn handle(&mut self, command: Command) -> Vec<Action> {
        let mut actions = Vec::new();
        match command {
            Command::DrawBox { region, class_id } => {
                if !region.is_valid() {
                    warn!("⚠️ 忽略无效画框 {:?}", region);
                    return actions;
                }
                self.pending_init = Some(region);
                self.class_id = Some(class_id);
                self.low_streak = 0;
                match self.state {
                    CaptureState::Idle | CaptureState::Lost => {
                        self.transition(CaptureState::Armed, "box drawn", &mut actions)
                    }
                    state => info!("🖍️ {} 状态下重新画框 (类别 {})", state, class_id),
                }
            }
            Command::StartRecording => match self.state {
                CaptureState::Armed => {
                    self.rate.reset();
                    self.cadence_frames = 0;
                    self.low_streak = 0;
                    self.transition(CaptureState::Recording, "recording started", &mut actions);
                }
                CaptureState::Recording | CaptureState::Correcting => {
                    debug!("已在录制中");
                }
                state => warn!("⚠️ {} 状态下无法开始录制, 请先画框", state),
            },
            Command::CaptureBackground => self.pending_background = true,
            Command::StopRecording => return self.stop("recording stopped"),
            Command::ClearBox => return self.stop("box cleared"),
            Command::Shutdown => return self.stop("shutdown"),
            Command::SetParameter { name, value } => {
                match self.config.apply_parameter(&name, value) {
                    Ok(()) => info!("🔧 参数 {} = {}", name, value),
                    Err(e) => warn!("⚠️ 忽略参数更新: {}", e),
                }
            }
        }
        actions
    }

    /// 会话级错误: 强制回到 Idle 并发出错误状态
    pub fn fail(&mut self, error: &FlowError) -> Vec<Action> {
        self.reset();
        if self.state != CaptureState::Idle {
            info!("🎬 {} → idle: {}", self.state, error);
            self.state = CaptureState::Idle;
        }
        vec![Action::Publish(ControlMessage::status(
            CaptureState::Idle.as_str(),
            format!("error: {}", error),
        ))]
    }

    pub fn on_frame(&mut self, frame: &Frame) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(last) = self.last_seq {
            if frame.seq <= last {
                trace!("跳过乱序帧 #{} (上一帧 #{})", frame.seq, last);
                return actions;
            }
        }
        self.last_seq = Some(frame.seq);
        self.stats.frames += 1;
        if std::mem::take(&mut self.pending_background) {
            actions.push(Action::PersistBackground { seq: frame.seq });
        }

        if let Some(region) = self.pending_init.take() {
            match self.tracker.init(frame, region) {
                Ok(state) => {
                    self.tracker_state = Some(state);
                    self.region = Some(region);
                    self.confidence = 1.0;
                    self.low_streak = 0;
                }
                Err(e) => {
                    warn!("⚠️ 追踪器初始化失败: {}", e);
                    self.reset();
                    self.transition(CaptureState::Idle, &e.to_string(), &mut actions);
                    return actions;
                }
            }
        } else if let Some(state) = self.tracker_state.take() {
            let (estimate, next) = self.tracker.update(frame, &state);
            self.tracker_state = Some(next);
            self.region = Some(estimate.region);
            self.confidence = estimate.confidence;
            trace!(
                "帧 #{} 追踪 {:?} conf={:.2}",
                frame.seq,
                estimate.region,
                estimate.confidence
            );
        }

        self.expire_in_flight(frame.seq);
        match self.state {
            CaptureState::Idle | CaptureState::Armed => {}
            CaptureState::Recording | CaptureState::Correcting => {
                self.step_recording(frame, &mut actions)
            }
            CaptureState::Lost => self.step_lost(frame, &mut actions),
        }
        actions
    }

    fn step_recording(&mut self, frame: &Frame, actions: &mut Vec<Action>) {
        self.cadence_frames += 1;

        if self.confidence < self.config.lost_threshold {
            self.low_streak += 1;
            if self.low_streak >= self.config.lost_after_frames {
                let lost = FlowError::TrackingLost {
                    frames: self.low_streak,
                };
                warn!("❓ 帧 #{}: {}", frame.seq, lost);
                self.tracker_state = None;
                self.transition(CaptureState::Lost, &lost.to_string(), actions);
                return;
            }
        } else {
            self.low_streak = 0;
            if self
                .rate
                .due(self.config.capture_interval, frame.seq, frame.timestamp)
            {
                let region = self.region.and_then(|r| r.clamp_to(frame.width, frame.height));
                if let (Some(region), Some(class_id)) = (region, self.class_id) {
                    self.rate.mark(frame.seq, frame.timestamp);
                    actions.push(Action::Persist {
                        seq: frame.seq,
                        region,
                        class_id,
                    });
                }
            }
        }

        let cadence_hit = self.cadence_frames % self.config.detector_cadence.max(1) == 0;
        if cadence_hit || self.confidence < self.config.soft_threshold {
            self.request_detection(frame.seq, actions);
        }
    }

    fn step_lost(&mut self, frame: &Frame, actions: &mut Vec<Action>) {
        if self.config.lost_recovery != LostRecovery::RearmFromDetector {
            return;
        }
        self.cadence_frames += 1;
        if self.cadence_frames % self.config.detector_cadence.max(1) == 0 {
            self.request_detection(frame.seq, actions);
        }
    }

    fn request_detection(&mut self, seq: u64, actions: &mut Vec<Action>) {
        if !self.detector_enabled || self.in_flight.is_some() {
            return;
        }
        self.in_flight = Some((seq, self.generation));
        actions.push(Action::RequestDetection {
            seq,
            generation: self.generation,
        });
        if self.state == CaptureState::Recording {
            self.transition(CaptureState::Correcting, "detector invoked", actions);
        }
    }

    /// 在途检测超过最大帧龄后放弃, 允许发起新请求
    fn expire_in_flight(&mut self, current: u64) {
        if let Some((seq, _)) = self.in_flight {
            if current.saturating_sub(seq) > self.config.max_detection_age {
                debug!("放弃帧 #{} 的检测 (已过 {} 帧)", seq, current - seq);
                self.in_flight = None;
            }
        }
    }

    /// 检测请求没能提交 (检测器忙)
    pub fn on_detection_dropped(&mut self, seq: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.in_flight.map(|(s, _)| s) == Some(seq) {
            self.in_flight = None;
            if self.state == CaptureState::Correcting {
                self.transition(CaptureState::Recording, "detector busy", &mut actions);
            }
        }
        actions
    }

    pub fn on_detection(&mut self, response: DetectionResponse) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.in_flight == Some((response.seq, response.generation)) {
            self.in_flight = None;
        }

        let current = self.last_seq.unwrap_or(response.seq);
        let age = current.saturating_sub(response.seq);
        // Lost 状态下只有 RearmFromDetector 策略接受检测结果, 否则等待操作员重新画框
        let expected_state = match self.state {
            CaptureState::Recording | CaptureState::Correcting => true,
            CaptureState::Lost => self.config.lost_recovery == LostRecovery::RearmFromDetector,
            _ => false,
        };
        if response.error.is_some()
            || response.generation != self.generation
            || !expected_state
            || age > self.config.max_detection_age
        {
            self.stats.detections_discarded += 1;
            match &response.error {
                Some(e) => debug!("丢弃帧 #{} 的检测结果: {}", response.seq, e),
                None => debug!(
                    "丢弃帧 #{} 的检测结果 (代数 {}/{}, 落后 {} 帧, 状态 {})",
                    response.seq, response.generation, self.generation, age, self.state
                ),
            }
            if self.state == CaptureState::Correcting && self.in_flight.is_none() {
                self.transition(CaptureState::Recording, "detection discarded", &mut actions);
            }
            return actions;
        }

        self.stats.detections_accepted += 1;
        let accepted: Vec<&Detection> = response
            .detections
            .iter()
            .filter(|d| d.confidence >= self.config.accept_confidence)
            .collect();
        for d in &accepted {
            actions.push(Action::Publish(ControlMessage::Detection {
                class_id: d.class_id,
                confidence: d.confidence,
                region: d.bbox,
                frame_seq: response.seq,
            }));
        }
        actions.push(Action::Publish(ControlMessage::DetectionCount {
            count: accepted.len() as u32,
        }));
        actions.push(Action::Publish(ControlMessage::FrameEnd {
            frame_seq: response.seq,
        }));

        let best = pick_best(&accepted, self.region);
        match self.state {
            CaptureState::Recording | CaptureState::Correcting => {
                if let Some(best) = best {
                    let iou = self.region.map(|r| r.iou(&best.bbox)).unwrap_or(0.0);
                    if iou < self.config.snap_iou_threshold {
                        info!(
                            "🧲 帧 #{}: 追踪框吸附到检测框 (IOU {:.2}, conf {:.2})",
                            response.seq, iou, best.confidence
                        );
                        self.region = Some(best.bbox);
                        self.pending_init = Some(best.bbox);
                        self.stats.snaps += 1;
                    }
                    self.low_streak = 0;
                }
                if self.state == CaptureState::Correcting {
                    self.transition(CaptureState::Recording, "detector checked", &mut actions);
                }
            }
            CaptureState::Lost => {
                if let Some(best) = best {
                    self.pending_init = Some(best.bbox);
                    self.transition(CaptureState::Armed, "re-armed from detector", &mut actions);
                }
            }
            _ => {}
        }
        actions
    }
}

/// 与追踪框重叠最多的检测, 其次按置信度
fn pick_best<'a>(detections: &[&'a Detection], region: Option<BBox>) -> Option<&'a Detection> {
    detections.iter().copied().max_by(|a, b| {
        let overlap = |d: &Detection| region.map(|r| r.iou(&d.bbox)).unwrap_or(0.0);
        overlap(a)
            .total_cmp(&overlap(b))
            .then(a.confidence.total_cmp(&b.confidence))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureInterval;
    use crate::detection::{Estimate, EstimateSource};
    use crate::error::Result;
    use std::time::Duration;

    /// 框原地不动, 置信度按脚本给出 (脚本用完后重复最后一个值)
    struct ScriptedTracker {
        confidences: Vec<f32>,
    }

    impl ScriptedTracker {
        fn constant(conf: f32) -> Self {
            Self {
                confidences: vec![conf],
            }
        }
    }

    impl Tracker for ScriptedTracker {
        type State = (BBox, usize);

        fn init(&self, _frame: &Frame, region: BBox) -> Result<Self::State> {
            Ok((region, 0))
        }

        fn update(&self, _frame: &Frame, state: &Self::State) -> (Estimate, Self::State) {
            let (region, step) = *state;
            let confidence = self
                .confidences
                .get(step)
                .or(self.confidences.last())
                .copied()
                .unwrap_or(0.0);
            (
                Estimate {
                    region,
                    confidence,
                    source: EstimateSource::Tracker,
                },
                (region, step + 1),
            )
        }
    }

    const BOX: BBox = BBox {
        x: 10.0,
        y: 10.0,
        w: 20.0,
        h: 20.0,
    };

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Duration::from_millis(seq * 33), 64, 64, vec![0; 64 * 64 * 4]).unwrap()
    }

    fn recording<T: Tracker>(tracker: T, config: CaptureConfig) -> Scheduler<T> {
        let mut s = Scheduler::new(tracker, config, true);
        s.handle(Command::DrawBox {
            region: BOX,
            class_id: 3,
        });
        s.handle(Command::StartRecording);
        assert_eq!(s.state(), CaptureState::Recording);
        s
    }

    fn persisted(actions: &[Action]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Persist { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    fn requested(actions: &[Action]) -> Option<(u64, u64)> {
        actions.iter().find_map(|a| match a {
            Action::RequestDetection { seq, generation } => Some((*seq, *generation)),
            _ => None,
        })
    }

    fn response(seq: u64, generation: u64, detections: Vec<Detection>) -> DetectionResponse {
        DetectionResponse {
            seq,
            generation,
            detections,
            inference_ms: 1.0,
            error: None,
        }
    }

    fn det(bbox: BBox, confidence: f32) -> Detection {
        Detection {
            class_id: 0,
            bbox,
            confidence,
        }
    }

    #[test]
    fn test_thirty_frames_every_fifth_persisted() {
        let mut s = recording(ScriptedTracker::constant(0.9), CaptureConfig::default());
        let mut actions = Vec::new();
        for seq in 1..=30 {
            actions.extend(s.on_frame(&frame(seq)));
        }
        assert_eq!(persisted(&actions), vec![5, 10, 15, 20, 25, 30]);
        assert!(actions.iter().all(|a| match a {
            Action::Persist { class_id, region, .. } => *class_id == 3 && *region == BOX,
            _ => true,
        }));
    }

    #[test]
    fn test_low_confidence_goes_lost_without_samples() {
        // 初始化帧 + 9 帧高置信度, 然后 10 帧 0.1
        let mut script = vec![0.9; 9];
        script.extend(vec![0.1; 10]);
        let mut s = recording(
            ScriptedTracker {
                confidences: script,
            },
            CaptureConfig::default(),
        );
        let mut actions = Vec::new();
        for seq in 1..=20 {
            actions.extend(s.on_frame(&frame(seq)));
        }
        assert_eq!(s.state(), CaptureState::Lost);
        assert!(persisted(&actions).iter().all(|&seq| seq <= 10));
        assert!(actions.contains(&Action::Publish(ControlMessage::status(
            "lost",
            FlowError::TrackingLost { frames: 5 }.to_string()
        ))));
    }

    #[test]
    fn test_double_stop_is_idempotent() {
        let mut s = recording(ScriptedTracker::constant(0.9), CaptureConfig::default());
        for seq in 1..=7 {
            s.on_frame(&frame(seq));
        }
        let first = s.handle(Command::StopRecording);
        assert_eq!(
            first,
            vec![Action::Publish(ControlMessage::status("idle", "recording stopped"))]
        );
        assert!(s.handle(Command::StopRecording).is_empty());
        assert_eq!(s.state(), CaptureState::Idle);
        // 停止后不再写入
        assert!(persisted(&s.on_frame(&frame(10))).is_empty());
    }

    #[test]
    fn test_background_capture_takes_next_frame_once() {
        let mut s = Scheduler::new(ScriptedTracker::constant(0.9), CaptureConfig::default(), true);
        assert!(s.handle(Command::CaptureBackground).is_empty());
        assert_eq!(s.state(), CaptureState::Idle);
        let first = s.on_frame(&frame(1));
        assert_eq!(first, vec![Action::PersistBackground { seq: 1 }]);
        assert!(s.on_frame(&frame(2)).is_empty());

        // 录制中也可以插入一帧背景, 不影响正常采样
        let mut s = recording(ScriptedTracker::constant(0.9), CaptureConfig::default());
        s.handle(Command::CaptureBackground);
        let actions = s.on_frame(&frame(1));
        assert!(actions.contains(&Action::PersistBackground { seq: 1 }));
        assert_eq!(s.state(), CaptureState::Recording);
    }

    #[test]
    fn test_detection_after_stop_is_discarded() {
        let config = CaptureConfig {
            detector_cadence: 3,
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.9), config);
        let mut request = None;
        for seq in 1..=3 {
            request = request.or(requested(&s.on_frame(&frame(seq))));
        }
        let (seq, generation) = request.unwrap();
        assert_eq!(s.state(), CaptureState::Correcting);

        s.handle(Command::StopRecording);
        let far = BBox::new(40.0, 40.0, 20.0, 20.0);
        let actions = s.on_detection(response(seq, generation, vec![det(far, 0.9)]));
        assert!(actions.is_empty());
        assert_eq!(s.stats().detections_discarded, 1);

        // 新会话也不接受旧代数的结果
        s.handle(Command::DrawBox {
            region: BOX,
            class_id: 3,
        });
        s.handle(Command::StartRecording);
        s.on_frame(&frame(4));
        s.on_detection(response(seq, generation, vec![det(far, 0.9)]));
        assert_eq!(s.stats().detections_discarded, 2);
        assert_eq!(s.region(), Some(BOX));
    }

    #[test]
    fn test_stale_detection_is_discarded() {
        let config = CaptureConfig {
            detector_cadence: 2,
            max_detection_age: 5,
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.9), config);
        s.on_frame(&frame(1));
        let (seq, generation) = requested(&s.on_frame(&frame(2))).unwrap();
        for n in 3..=10 {
            s.on_frame(&frame(n));
        }
        let far = BBox::new(40.0, 40.0, 20.0, 20.0);
        s.on_detection(response(seq, generation, vec![det(far, 0.9)]));
        assert_eq!(s.stats().detections_discarded, 1);
        assert_eq!(s.region(), Some(BOX));
    }

    #[test]
    fn test_snap_to_detector_when_overlap_is_low() {
        let config = CaptureConfig {
            detector_cadence: 2,
            capture_interval: CaptureInterval::Frames(1),
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.9), config);
        s.on_frame(&frame(1));
        let (seq, generation) = requested(&s.on_frame(&frame(2))).unwrap();

        let far = BBox::new(40.0, 40.0, 20.0, 20.0);
        let actions = s.on_detection(response(
            seq,
            generation,
            vec![det(far, 0.9), det(BBox::new(0.0, 0.0, 5.0, 5.0), 0.2)],
        ));
        assert_eq!(s.state(), CaptureState::Recording);
        assert_eq!(s.stats().snaps, 1);
        // 只发布可信检测
        let published: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Publish(ControlMessage::Detection { .. })))
            .collect();
        assert_eq!(published.len(), 1);
        assert!(actions.contains(&Action::Publish(ControlMessage::DetectionCount { count: 1 })));
        assert!(actions.contains(&Action::Publish(ControlMessage::FrameEnd { frame_seq: 2 })));

        // 下一帧用检测框重新初始化追踪器
        let actions = s.on_frame(&frame(3));
        assert!(actions.contains(&Action::Persist {
            seq: 3,
            region: far,
            class_id: 3
        }));
    }

    #[test]
    fn test_overlapping_detection_keeps_tracked_box() {
        let config = CaptureConfig {
            detector_cadence: 2,
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.9), config);
        s.on_frame(&frame(1));
        let (seq, generation) = requested(&s.on_frame(&frame(2))).unwrap();
        let near = BBox::new(11.0, 11.0, 20.0, 20.0);
        s.on_detection(response(seq, generation, vec![det(near, 0.9)]));
        assert_eq!(s.stats().snaps, 0);
        assert_eq!(s.stats().detections_accepted, 1);
        assert_eq!(s.region(), Some(BOX));
    }

    #[test]
    fn test_rearm_from_detector_after_lost() {
        let config = CaptureConfig {
            detector_cadence: 3,
            lost_recovery: LostRecovery::RearmFromDetector,
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.1), config);
        let mut seq = 0;
        let mut early = None;
        while s.state() != CaptureState::Lost {
            seq += 1;
            let actions = s.on_frame(&frame(seq));
            early = early.or(requested(&actions));
            assert!(persisted(&actions).is_empty());
        }
        // 低置信度触发的那次检测没能提交
        let (early_seq, _) = early.unwrap();
        s.on_detection_dropped(early_seq);

        let mut request = None;
        while request.is_none() {
            seq += 1;
            request = requested(&s.on_frame(&frame(seq)));
        }
        let (rseq, generation) = request.unwrap();
        let found = BBox::new(30.0, 20.0, 16.0, 16.0);
        s.on_detection(response(rseq, generation, vec![det(found, 0.8)]));
        assert_eq!(s.state(), CaptureState::Armed);

        s.on_frame(&frame(seq + 1));
        assert_eq!(s.region(), Some(found));
        s.handle(Command::StartRecording);
        assert_eq!(s.state(), CaptureState::Recording);
    }

    #[test]
    fn test_late_detection_does_not_rearm_under_redraw() {
        let mut s = recording(ScriptedTracker::constant(0.1), CaptureConfig::default());
        let mut seq = 0;
        let mut early = None;
        while s.state() != CaptureState::Lost {
            seq += 1;
            early = early.or(requested(&s.on_frame(&frame(seq))));
        }
        // 第一帧低置信度时发出的检测, 在进入 Lost 之后才返回
        let (early_seq, generation) = early.unwrap();
        let found = BBox::new(30.0, 20.0, 16.0, 16.0);
        let actions = s.on_detection(response(early_seq, generation, vec![det(found, 0.9)]));
        assert!(actions.is_empty());
        assert_eq!(s.state(), CaptureState::Lost);
        assert_eq!(s.stats().detections_accepted, 0);
        assert_eq!(s.stats().detections_discarded, 1);

        s.on_frame(&frame(seq + 1));
        assert_eq!(s.state(), CaptureState::Lost);
    }

    #[test]
    fn test_detector_error_is_discarded() {
        let config = CaptureConfig {
            detector_cadence: 2,
            ..CaptureConfig::default()
        };
        let mut s = recording(ScriptedTracker::constant(0.9), config);
        s.on_frame(&frame(1));
        let (seq, generation) = requested(&s.on_frame(&frame(2))).unwrap();
        assert_eq!(s.state(), CaptureState::Correcting);

        let mut failed = response(seq, generation, Vec::new());
        failed.error = Some("model exploded".into());
        let actions = s.on_detection(failed);
        assert_eq!(s.state(), CaptureState::Recording);
        assert_eq!(s.stats().detections_accepted, 0);
        assert_eq!(s.stats().detections_discarded, 1);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Publish(ControlMessage::FrameEnd { .. }))));
    }

    #[test]
    fn test_lost_waits_for_redraw_by_default() {
        let mut s = recording(ScriptedTracker::constant(0.0), CaptureConfig::default());
        for seq in 1..=10 {
            s.on_frame(&frame(seq));
        }
        assert_eq!(s.state(), CaptureState::Lost);
        s.handle(Command::DrawBox {
            region: BOX,
            class_id: 4,
        });
        assert_eq!(s.state(), CaptureState::Armed);
        assert_eq!(s.class_id(), Some(4));
    }

    #[test]
    fn test_start_requires_box_and_parameters_apply() {
        let mut s = Scheduler::new(ScriptedTracker::constant(0.9), CaptureConfig::default(), false);
        assert!(s.handle(Command::StartRecording).is_empty());
        assert_eq!(s.state(), CaptureState::Idle);

        s.handle(Command::SetParameter {
            name: "capture_interval".into(),
            value: 2.0,
        });
        s.handle(Command::SetParameter {
            name: "nonsense".into(),
            value: 1.0,
        });
        assert_eq!(s.config().capture_interval, CaptureInterval::Frames(2));
    }

    #[test]
    fn test_fail_forces_idle_with_error_status() {
        let mut s = recording(ScriptedTracker::constant(0.9), CaptureConfig::default());
        let err = FlowError::SourceUnavailable("synthetic".into());
        let actions = s.fail(&err);
        assert_eq!(s.state(), CaptureState::Idle);
        match &actions[0] {
            Action::Publish(ControlMessage::Status { state, detail }) => {
                assert_eq!(state, "idle");
                assert!(detail.contains("unavailable"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! 采样限速: 每个间隔最多写入一个样本, 与视频帧率无关

use std::time::Duration;

use crate::config::CaptureInterval;

#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    /// 上次写入的 (帧序号, 源时间戳)
    anchor: Option<(u64, Duration)>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 录制开始时重置
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// 该帧是否到了写入时间 (不改变状态)
    ///
    /// 录制后的第一帧作为锚点: 按帧间隔时第 N 帧写入第一个样本.
    pub fn due(&mut self, interval: CaptureInterval, seq: u64, timestamp: Duration) -> bool {
        let (anchor_seq, anchor_ts) = *self
            .anchor
            .get_or_insert((seq.saturating_sub(1), timestamp));
        match interval {
            CaptureInterval::Frames(n) => seq.saturating_sub(anchor_seq) >= n.max(1),
            CaptureInterval::Millis(ms) => {
                timestamp.saturating_sub(anchor_ts) >= Duration::from_millis(ms.max(1))
            }
        }
    }

    /// 记录一次写入
    pub fn mark(&mut self, seq: u64, timestamp: Duration) {
        self.anchor = Some((seq, timestamp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(interval: CaptureInterval, frames: u64, fps: u64) -> Vec<u64> {
        let mut rate = RateLimiter::new();
        let mut written = Vec::new();
        for seq in 1..=frames {
            let ts = Duration::from_millis((seq - 1) * 1000 / fps);
            if rate.due(interval, seq, ts) {
                rate.mark(seq, ts);
                written.push(seq);
            }
        }
        written
    }

    #[test]
    fn test_every_nth_frame() {
        assert_eq!(run(CaptureInterval::Frames(5), 30, 30), vec![5, 10, 15, 20, 25, 30]);
        assert_eq!(run(CaptureInterval::Frames(1), 3, 30), vec![1, 2, 3]);
    }

    #[test]
    fn test_time_interval_is_independent_of_frame_rate() {
        // 2 秒素材, 每 500ms 一个样本
        assert_eq!(run(CaptureInterval::Millis(500), 60, 30).len(), 3);
        assert_eq!(run(CaptureInterval::Millis(500), 120, 60).len(), 3);
    }

    #[test]
    fn test_reset_reanchors() {
        let mut rate = RateLimiter::new();
        assert!(!rate.due(CaptureInterval::Frames(5), 100, Duration::ZERO));
        rate.reset();
        assert!(!rate.due(CaptureInterval::Frames(5), 200, Duration::ZERO));
        assert!(rate.due(CaptureInterval::Frames(5), 204, Duration::ZERO));
    }
}

//! 自动重连包装器
//!
//! 内部源报告 `SourceUnavailable` 时关闭并重新打开, 最多 `max_attempts` 次,
//! 每次间隔 `backoff`. 用尽后把错误向上抛出 (会话级错误).
//! 重连后帧序号继续单调递增.

use std::time::Duration;

use tracing::{error, info, warn};

use super::{Frame, FrameSource, SourceEvent};
use crate::error::{FlowError, Result};

pub struct ReconnectingSource {
    inner: Box<dyn FrameSource>,
    max_attempts: u32,
    backoff: Duration,
    /// 对外的帧序号 (跨越重连保持单调)
    seq: u64,
    reconnects: u32,
}

impl ReconnectingSource {
    pub fn new(inner: Box<dyn FrameSource>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts,
            backoff,
            seq: 0,
            reconnects: 0,
        }
    }

    /// 成功重连的累计次数
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn open_with_retry(&mut self, cause: Option<&FlowError>) -> Result<()> {
        let mut last_err = match cause {
            Some(e) => e.to_string(),
            None => String::new(),
        };
        let first_try = if cause.is_none() { 0 } else { 1 };

        for attempt in first_try..=self.max_attempts {
            if attempt > 0 {
                warn!(
                    "⚠️ 视频源 {} 不可用, {}ms 后重试... ({}/{})",
                    self.inner.source_id(),
                    self.backoff.as_millis(),
                    attempt,
                    self.max_attempts
                );
                std::thread::sleep(self.backoff);
            }
            match self.inner.open() {
                Ok(()) => {
                    if attempt > 0 {
                        self.reconnects += 1;
                        info!("✅ 视频源 {} 重连成功", self.inner.source_id());
                    }
                    return Ok(());
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        error!(
            "❌ 视频源 {} 重连失败 (重试{}次)",
            self.inner.source_id(),
            self.max_attempts
        );
        Err(FlowError::SourceUnavailable(format!(
            "{}: {}",
            self.inner.source_id(),
            last_err
        )))
    }

    fn restamp(&mut self, frame: Frame) -> Frame {
        self.seq += 1;
        Frame {
            seq: self.seq,
            ..frame
        }
    }
}

impl FrameSource for ReconnectingSource {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn open(&mut self) -> Result<()> {
        self.open_with_retry(None)
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<SourceEvent> {
        match self.inner.next_frame(timeout) {
            Ok(SourceEvent::Frame(frame)) => Ok(SourceEvent::Frame(self.restamp(frame))),
            Ok(other) => Ok(other),
            Err(e) if matches!(e, FlowError::SourceUnavailable(_)) => {
                self.inner.close();
                self.open_with_retry(Some(&e))?;
                // 重连成功, 本次调用报告超时, 下次调用取新帧
                Ok(SourceEvent::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_live(&self) -> bool {
        self.inner.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// 每产出 `frames_per_connection` 帧断开一次; 前 `failed_opens` 次打开失败
    struct FlakySource {
        frames_per_connection: u64,
        produced: u64,
        failed_opens: u32,
        opens: Arc<AtomicU32>,
    }

    impl FrameSource for FlakySource {
        fn source_id(&self) -> &str {
            "flaky"
        }

        fn open(&mut self) -> Result<()> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failed_opens {
                return Err(FlowError::SourceUnavailable("refused".into()));
            }
            self.produced = 0;
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<SourceEvent> {
            if self.produced == self.frames_per_connection {
                return Err(FlowError::SourceUnavailable("dropped".into()));
            }
            self.produced += 1;
            let frame = Frame::new(self.produced, Duration::ZERO, 1, 1, vec![0; 4])?;
            Ok(SourceEvent::Frame(frame))
        }

        fn close(&mut self) {}
    }

    fn flaky(frames: u64, failed_opens: u32) -> (ReconnectingSource, Arc<AtomicU32>) {
        let opens = Arc::new(AtomicU32::new(0));
        let inner = FlakySource {
            frames_per_connection: frames,
            produced: 0,
            failed_opens,
            opens: opens.clone(),
        };
        (
            ReconnectingSource::new(Box::new(inner), 3, Duration::from_millis(1)),
            opens,
        )
    }

    #[test]
    fn test_reconnect_keeps_sequence_monotonic() {
        let (mut source, _) = flaky(2, 0);
        source.open().unwrap();
        let mut seqs = Vec::new();
        for _ in 0..8 {
            if let SourceEvent::Frame(f) = source.next_frame(Duration::ZERO).unwrap() {
                seqs.push(f.seq);
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(source.reconnects(), 2);
    }

    #[test]
    fn test_open_retries_then_succeeds() {
        let (mut source, opens) = flaky(5, 2);
        source.open().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_gives_up_after_bounded_attempts() {
        let (mut source, opens) = flaky(5, 100);
        let err = source.open().unwrap_err();
        assert!(err.is_session_fatal());
        // 首次打开 + 3 次重试
        assert_eq!(opens.load(Ordering::SeqCst), 4);
    }
}

//! 进程内控制通道 (测试和嵌入使用)

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{ControlChannel, ControlMessage};

/// `inject` 模拟宿主发来的消息; `sent` 记录所有出站消息
pub struct LoopbackChannel {
    inbound_tx: Sender<ControlMessage>,
    inbound_rx: Receiver<ControlMessage>,
    sent: Mutex<Vec<ControlMessage>>,
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackChannel {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn inject(&self, message: ControlMessage) {
        let _ = self.inbound_tx.send(message);
    }

    /// 已发送消息的快照
    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<ControlMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.kind() == kind)
            .collect()
    }
}

impl ControlChannel for LoopbackChannel {
    fn send(&self, message: ControlMessage) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
    }

    fn try_receive(&self) -> Option<ControlMessage> {
        self.inbound_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_records_and_injects() {
        let ch = LoopbackChannel::new();
        assert!(ch.try_receive().is_none());
        ch.inject(ControlMessage::StartRecording);
        assert_eq!(ch.try_receive(), Some(ControlMessage::StartRecording));

        ch.send(ControlMessage::FrameEnd { frame_seq: 1 });
        ch.send(ControlMessage::status("Idle", ""));
        assert_eq!(ch.sent().len(), 2);
        assert_eq!(ch.sent_of_kind("status").len(), 1);
    }
}

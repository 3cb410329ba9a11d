//! UDP 控制通道
//!
//! - 接收线程: 带读超时的 `recv_from`, 解码后放入入站队列
//! - 发送线程: 单线程顺序发送有界队列中的消息 (同类消息保序)
//! - 队列满时丢弃消息并计数, 绝不阻塞调用者

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use super::{codec, ControlChannel, ControlMessage};
use crate::config::ControlConfig;
use crate::error::{FlowError, Result};

/// 单个 OSC 数据报的最大长度
const MAX_DATAGRAM: usize = 65_507;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct UdpControlChannel {
    outbound: Sender<ControlMessage>,
    inbound: Receiver<ControlMessage>,
    dropped: Arc<AtomicU64>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl UdpControlChannel {
    pub fn bind(config: &ControlConfig) -> Result<Self> {
        let listen: SocketAddr = format!("{}:{}", config.listen_host, config.inbound_port)
            .parse()
            .map_err(|e| FlowError::Config(format!("bad listen address: {}", e)))?;
        let target: SocketAddr = format!("{}:{}", config.host, config.outbound_port)
            .parse()
            .map_err(|e| FlowError::Config(format!("bad outbound address: {}", e)))?;
        Self::bind_to(listen, target, config.send_queue)
    }

    pub fn bind_to(listen: SocketAddr, target: SocketAddr, send_queue: usize) -> Result<Self> {
        let socket = UdpSocket::bind(listen)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let send_socket = socket.try_clone()?;

        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let (in_tx, in_rx) = unbounded::<ControlMessage>();
        let (out_tx, out_rx) = bounded::<ControlMessage>(send_queue.max(1));

        let rx_running = running.clone();
        let receiver = std::thread::Builder::new()
            .name("osc-recv".into())
            .spawn(move || receive_loop(socket, in_tx, rx_running))?;

        let tx_running = running.clone();
        let sender = std::thread::Builder::new()
            .name("osc-send".into())
            .spawn(move || send_loop(send_socket, target, out_rx, tx_running))?;

        info!("✅ OSC 控制通道: 监听 {} → 发送 {}", local_addr, target);
        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
            dropped,
            local_addr,
            running,
            workers: vec![receiver, sender],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 因队列满被丢弃的出站消息数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_send(&self, message: ControlMessage) -> Result<()> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(m) => {
                FlowError::ControlChannelSendFailure(format!("queue full, dropped {}", m.kind()))
            }
            TrySendError::Disconnected(_) => {
                FlowError::ControlChannelSendFailure("sender stopped".to_string())
            }
        })
    }
}

impl ControlChannel for UdpControlChannel {
    fn send(&self, message: ControlMessage) {
        if let Err(e) = self.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("{}", e);
        }
    }

    fn try_receive(&self) -> Option<ControlMessage> {
        self.inbound.try_recv().ok()
    }
}

impl Drop for UdpControlChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn receive_loop(socket: UdpSocket, tx: Sender<ControlMessage>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                warn!("⚠️ OSC 接收错误: {}", e);
                continue;
            }
        };
        match codec::decode(&buf[..len]) {
            Ok(messages) => {
                for message in messages {
                    trace!("📥 {} from {}", message.kind(), from);
                    if tx.send(message).is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!("丢弃无法解码的数据报 ({} 字节, 来自 {}): {}", len, from, e),
        }
    }
}

fn send_loop(
    socket: UdpSocket,
    target: SocketAddr,
    rx: Receiver<ControlMessage>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let message = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(m) => m,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let bytes = match codec::encode(&message) {
            Ok(b) => b,
            Err(e) => {
                debug!("编码失败 {}: {}", message.kind(), e);
                continue;
            }
        };
        // 尽力而为: 发送失败只记录
        if let Err(e) = socket.send_to(&bytes, target) {
            trace!("OSC 发送失败 {}: {}", message.kind(), e);
        }
    }
}

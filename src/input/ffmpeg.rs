//! FFmpeg 解码源 (RTSP / 摄像头 / 视频文件)
//!
//! 解码在独立线程中运行, `FrameFilter` 把 YUV420P 转成 RGBA 后投递到
//! 容量为2的通道; 消费者跟不上时丢弃新帧, 保证解码线程不阻塞.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{debug, error, info, warn};

use super::{Frame, FrameSource, SourceEvent};
use crate::error::{FlowError, Result};

/// 解码线程 → 帧源
struct DecodeFilter {
    tx: Sender<Frame>,
    stop: Arc<AtomicBool>,
    started: Instant,
    seq: u64,
    // 一秒统计窗口
    count: usize,
    dropped: usize,
    last: Instant,
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        info!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: ez_ffmpeg::Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<ez_ffmpeg::Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("source closed".to_string());
        }

        let rgba = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped += 1;
                return Ok(None);
            }
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as usize, raw.height as usize);
            if w == 0 || h == 0 || w > 8192 || h > 8192 {
                self.dropped += 1;
                return Ok(None);
            }
            let (y, u, v) = (raw.data[0], raw.data[1], raw.data[2]);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if y.is_null() || u.is_null() || v.is_null() || y_stride < w || uv_stride < w / 2 {
                self.dropped += 1;
                return Ok(None);
            }
            let mut buffer = vec![255u8; w * h * 4];
            yuv420p_to_rgba(y, u, v, y_stride, uv_stride, &mut buffer, w, h);
            (w as u32, h as u32, buffer)
        };

        self.seq += 1;
        let (w, h, buffer) = rgba;
        if let Ok(decoded) = Frame::new(self.seq, self.started.elapsed(), w, h, buffer) {
            match self.tx.try_send(decoded) {
                Ok(()) => self.count += 1,
                Err(TrySendError::Full(_)) => self.dropped += 1,
                Err(TrySendError::Disconnected(_)) => return Err("consumer gone".to_string()),
            }
        }

        if self.last.elapsed().as_secs_f64() >= 1.0 {
            debug!(
                "📺 解码统计: {:.1}fps | 丢弃{}",
                self.count as f64 / self.last.elapsed().as_secs_f64(),
                self.dropped
            );
            self.count = 0;
            self.dropped = 0;
            self.last = Instant::now();
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!("✅ 解码线程退出");
    }
}

/// BT.601 定点 YUV420P → RGBA
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgba(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out = 0;
    for row in 0..height {
        let y_row = row * y_stride;
        let uv_row = (row >> 1) * uv_stride;
        for x in 0..width {
            let yv = *y_plane.add(y_row + x) as i32;
            let uv = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let vv = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;
            buffer[out] = (yv + ((vv * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out + 1] = (yv - ((uv * 44) >> 7) - ((vv * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out + 2] = (yv + ((uv * 227) >> 7)).clamp(0, 255) as u8;
            out += 4;
        }
    }
}

pub struct FfmpegSource {
    id: String,
    url: String,
    rx: Option<Receiver<Frame>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FfmpegSource {
    pub fn new(url: &str) -> Self {
        Self {
            id: format!("ffmpeg:{}", url),
            url: url.to_string(),
            rx: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn build_input(url: &str) -> Input {
        if url.starts_with("rtsp://") {
            Input::new(url).set_input_opts(
                [
                    ("rtsp_transport", "tcp"),
                    ("buffer_size", "67108864"),
                    ("rtsp_flags", "prefer_tcp"),
                ]
                .into(),
            )
        } else {
            Input::new(url)
        }
    }
}

impl FrameSource for FfmpegSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<()> {
        self.close();
        let (tx, rx) = bounded::<Frame>(2);
        let stop = Arc::new(AtomicBool::new(false));
        let filter = DecodeFilter {
            tx,
            stop: stop.clone(),
            started: Instant::now(),
            seq: 0,
            count: 0,
            dropped: 0,
            last: Instant::now(),
        };

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);
        let ctx = FfmpegContext::builder()
            .input(Self::build_input(&self.url))
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| FlowError::SourceUnavailable(format!("{}: 构建失败: {}", self.id, e)))?;
        let sch = ctx
            .start()
            .map_err(|e| FlowError::SourceUnavailable(format!("{}: 启动失败: {}", self.id, e)))?;

        let id = self.id.clone();
        let worker = std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || {
                if let Err(e) = sch.wait() {
                    warn!("⚠️ {} 解码结束: {}", id, e);
                }
            })?;

        info!("✅ {} 连接成功,开始解码!", self.id);
        self.rx = Some(rx);
        self.stop = stop;
        self.worker = Some(worker);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<SourceEvent> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| FlowError::SourceUnavailable(format!("{} is not open", self.id)))?;
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(SourceEvent::Frame(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(SourceEvent::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                if self.url.contains("://") {
                    error!("❌ {} 解码线程退出", self.id);
                    Err(FlowError::SourceUnavailable(self.id.clone()))
                } else {
                    // 本地文件读完
                    Ok(SourceEvent::EndOfStream)
                }
            }
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // 先丢弃接收端, 让阻塞中的解码线程退出
        self.rx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_live(&self) -> bool {
        self.url.contains("://")
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

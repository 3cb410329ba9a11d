//! 合成测试源 - 噪声背景上的纹理目标
//!
//! 完全确定: 同样的参数每次生成逐像素相同的帧序列, 用于离线调试和测试.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use super::{Frame, FrameSource, SourceEvent};
use crate::detection::BBox;
use crate::error::{FlowError, Result};

static SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)x(\d+)(?:@(\d+(?:\.\d+)?))?(?:/(\d+))?(\+still)?$").expect("valid regex")
});

/// 帧率未指定时时间戳使用的名义帧率
const NOMINAL_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Motion {
    /// 目标沿椭圆轨迹运动
    Orbit,
    /// 目标固定在画面中心
    Still,
}

pub struct SyntheticSource {
    id: String,
    width: u32,
    height: u32,
    /// Some → 按该帧率节流 (实时源); None → 尽快产出
    fps: Option<f64>,
    limit: Option<u64>,
    motion: Motion,

    background: Vec<u8>,
    texture: Vec<u8>,
    target_side: u32,

    index: u64,
    started: Option<Instant>,
    opened: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: Option<f64>, limit: Option<u64>, motion: Motion) -> Self {
        let width = width.max(16);
        let height = height.max(16);
        let target_side = (width.min(height) / 6).max(8);

        // 固定种子: 背景噪声 20..60, 目标纹理 120..255
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut background = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            let v: u8 = rng.gen_range(20..60);
            background.extend_from_slice(&[v, v, v.saturating_add(10), 255]);
        }
        let mut texture = Vec::with_capacity((target_side * target_side * 4) as usize);
        for y in 0..target_side {
            for x in 0..target_side {
                let checker = ((x / 4 + y / 4) % 2) as u8;
                let noise: u8 = rng.gen_range(0..40);
                let v = 150 + checker * 60 + noise;
                texture.extend_from_slice(&[v, v / 2, 255 - v / 2, 255]);
            }
        }

        Self {
            id: format!("synthetic:{}x{}", width, height),
            width,
            height,
            fps,
            limit,
            motion,
            background,
            texture,
            target_side,
            index: 0,
            started: None,
            opened: false,
        }
    }

    /// 解析 `<W>x<H>[@<fps>][/<frames>][+still]`
    pub fn parse(spec: &str) -> Result<Self> {
        let caps = SPEC_RE
            .captures(spec)
            .ok_or_else(|| FlowError::Config(format!("bad synthetic source spec '{}'", spec)))?;
        let num = |i: usize| caps.get(i).map(|m| m.as_str());
        let width = num(1).and_then(|s| s.parse().ok()).unwrap_or(640);
        let height = num(2).and_then(|s| s.parse().ok()).unwrap_or(480);
        let fps = num(3).and_then(|s| s.parse::<f64>().ok()).filter(|f| *f > 0.0);
        let limit = num(4).and_then(|s| s.parse().ok());
        let motion = if caps.get(5).is_some() {
            Motion::Still
        } else {
            Motion::Orbit
        };
        Ok(Self::new(width, height, fps, limit, motion))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// 第 `seq` 帧中目标的真实位置 (seq 从1开始)
    pub fn target_box(&self, seq: u64) -> BBox {
        let side = self.target_side as f32;
        let (cx, cy) = match self.motion {
            Motion::Still => (self.width as f32 / 2.0, self.height as f32 / 2.0),
            Motion::Orbit => {
                let t = seq as f32 * 0.05;
                (
                    self.width as f32 / 2.0 + self.width as f32 / 5.0 * t.cos(),
                    self.height as f32 / 2.0 + self.height as f32 / 5.0 * t.sin(),
                )
            }
        };
        let x = (cx - side / 2.0).round();
        let y = (cy - side / 2.0).round();
        BBox::new(x, y, side, side)
    }

    fn render(&self, seq: u64) -> Vec<u8> {
        let mut data = self.background.clone();
        let target = self.target_box(seq);
        let side = self.target_side as i64;
        let stride = self.width as i64 * 4;
        for ty in 0..side {
            let y = target.y as i64 + ty;
            if y < 0 || y >= self.height as i64 {
                continue;
            }
            for tx in 0..side {
                let x = target.x as i64 + tx;
                if x < 0 || x >= self.width as i64 {
                    continue;
                }
                let dst = (y * stride + x * 4) as usize;
                let src = ((ty * side + tx) * 4) as usize;
                data[dst..dst + 4].copy_from_slice(&self.texture[src..src + 4]);
            }
        }
        data
    }
}

impl FrameSource for SyntheticSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<SourceEvent> {
        if !self.opened {
            return Err(FlowError::SourceUnavailable(format!("{} is not open", self.id)));
        }
        if let Some(limit) = self.limit {
            if self.index >= limit {
                return Ok(SourceEvent::EndOfStream);
            }
        }

        self.index += 1;
        let seq = self.index;
        let fps = self.fps.unwrap_or(NOMINAL_FPS);
        let timestamp = Duration::from_secs_f64((seq - 1) as f64 / fps);

        // 实时模式: 按帧率节流
        if let (Some(_), Some(started)) = (self.fps, self.started) {
            let due = started + timestamp;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let frame = Frame::new(seq, timestamp, self.width, self.height, self.render(seq))?;
        Ok(SourceEvent::Frame(frame))
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn is_live(&self) -> bool {
        self.fps.is_some()
    }
}

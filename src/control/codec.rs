//! OSC 1.0 编解码
//!
//! 地址表:
//! - 入站 `/yoloflow/record/start`, `/yoloflow/record/stop`, `/yoloflow/record/background`,
//!   `/yoloflow/param/<name> <float>`, `/yoloflow/box x y w h [class]`,
//!   `/Closeyoloflowworkflow 1.0`
//! - 出站 `/yoloflow/detection`, `/yoloflow/detections/count`, `/yoloflow/frame_end`,
//!   `/yoloflow/status`, `/yoloflow/memory`, `/yoloflow/train/progress`, `/yoloflow/train/status`

use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};
use tracing::trace;

use super::ControlMessage;
use crate::detection::BBox;
use crate::error::{FlowError, Result};

pub const PREFIX: &str = "/yoloflow";
pub const ADDR_CLOSE: &str = "/Closeyoloflowworkflow";
/// 宿主发来但本进程不处理的地址
const IGNORED: [&str; 2] = ["/_samplerate", "/Openyoloflowworkflow"];

pub fn encode(message: &ControlMessage) -> Result<Vec<u8>> {
    let (addr, args) = to_osc(message);
    let packet = OscPacket::Message(OscMessage { addr, args });
    Ok(encoder::encode(&packet)?)
}

/// 解码一个数据报. bundle 被展开; 忽略的地址不产生消息
pub fn decode(datagram: &[u8]) -> Result<Vec<ControlMessage>> {
    let (_, packet) = decoder::decode_udp(datagram)?;
    let mut out = Vec::new();
    flatten(packet, &mut out)?;
    Ok(out)
}

fn flatten(packet: OscPacket, out: &mut Vec<ControlMessage>) -> Result<()> {
    match packet {
        OscPacket::Message(msg) => {
            if let Some(message) = from_osc(&msg)? {
                out.push(message);
            }
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out)?;
            }
        }
    }
    Ok(())
}

fn to_osc(message: &ControlMessage) -> (String, Vec<OscType>) {
    let addr = |suffix: &str| format!("{}/{}", PREFIX, suffix);
    match message {
        ControlMessage::StartRecording => (addr("record/start"), vec![]),
        ControlMessage::StopRecording => (addr("record/stop"), vec![]),
        ControlMessage::CaptureBackground => (addr("record/background"), vec![]),
        ControlMessage::SetParameter { name, value } => {
            (addr(&format!("param/{}", name)), vec![OscType::Float(*value)])
        }
        ControlMessage::DrawBox { region, class_id } => {
            let mut args = box_args(region);
            if let Some(id) = class_id {
                args.push(OscType::Int(*id as i32));
            }
            (addr("box"), args)
        }
        ControlMessage::Shutdown => (ADDR_CLOSE.to_string(), vec![OscType::Float(1.0)]),
        ControlMessage::Detection {
            class_id,
            confidence,
            region,
            frame_seq,
        } => {
            let mut args = vec![OscType::Int(*class_id as i32), OscType::Float(*confidence)];
            args.extend(box_args(region));
            args.push(OscType::Long(*frame_seq as i64));
            (addr("detection"), args)
        }
        ControlMessage::DetectionCount { count } => {
            (addr("detections/count"), vec![OscType::Int(*count as i32)])
        }
        ControlMessage::FrameEnd { frame_seq } => {
            (addr("frame_end"), vec![OscType::Long(*frame_seq as i64)])
        }
        ControlMessage::Status { state, detail } => (
            addr("status"),
            vec![OscType::String(state.clone()), OscType::String(detail.clone())],
        ),
        ControlMessage::Memory {
            path,
            width,
            height,
            channels,
        } => (
            addr("memory"),
            vec![
                OscType::String(path.clone()),
                OscType::Int(*width as i32),
                OscType::Int(*height as i32),
                OscType::Int(*channels as i32),
            ],
        ),
        ControlMessage::TrainProgress {
            run_id,
            epoch,
            total_epochs,
            metrics,
        } => {
            let mut args = vec![
                OscType::String(run_id.clone()),
                OscType::Int(*epoch as i32),
                OscType::Int(*total_epochs as i32),
            ];
            for (name, value) in metrics {
                args.push(OscType::String(name.clone()));
                args.push(OscType::Float(*value));
            }
            (addr("train/progress"), args)
        }
        ControlMessage::TrainStatus {
            run_id,
            status,
            detail,
        } => (
            addr("train/status"),
            vec![
                OscType::String(run_id.clone()),
                OscType::String(status.clone()),
                OscType::String(detail.clone()),
            ],
        ),
    }
}

fn box_args(region: &BBox) -> Vec<OscType> {
    vec![
        OscType::Float(region.x),
        OscType::Float(region.y),
        OscType::Float(region.w),
        OscType::Float(region.h),
    ]
}

// ========== 参数取值 (宿主可能发 int/float/double) ==========

fn arg_f32(args: &[OscType], i: usize) -> Option<f32> {
    match args.get(i)? {
        OscType::Float(v) => Some(*v),
        OscType::Double(v) => Some(*v as f32),
        OscType::Int(v) => Some(*v as f32),
        OscType::Long(v) => Some(*v as f32),
        OscType::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn arg_u64(args: &[OscType], i: usize) -> Option<u64> {
    match args.get(i)? {
        OscType::Int(v) => u64::try_from(*v).ok(),
        OscType::Long(v) => u64::try_from(*v).ok(),
        OscType::Float(v) if *v >= 0.0 => Some(*v as u64),
        OscType::Double(v) if *v >= 0.0 => Some(*v as u64),
        _ => None,
    }
}

fn arg_str(args: &[OscType], i: usize) -> Option<String> {
    match args.get(i)? {
        OscType::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn malformed(msg: &OscMessage) -> FlowError {
    FlowError::Codec(format!("malformed {} with {} args", msg.addr, msg.args.len()))
}

fn from_osc(msg: &OscMessage) -> Result<Option<ControlMessage>> {
    let args = &msg.args;
    if IGNORED.contains(&msg.addr.as_str()) {
        trace!("忽略地址 {}", msg.addr);
        return Ok(None);
    }
    if msg.addr == ADDR_CLOSE {
        // 只有非零值才表示关闭
        return Ok(match arg_f32(args, 0) {
            Some(v) if v != 0.0 => Some(ControlMessage::Shutdown),
            _ => None,
        });
    }

    let Some(path) = msg.addr.strip_prefix(PREFIX).and_then(|p| p.strip_prefix('/')) else {
        trace!("未知地址 {}", msg.addr);
        return Ok(None);
    };

    let message = match path {
        "record/start" => ControlMessage::StartRecording,
        "record/stop" => ControlMessage::StopRecording,
        "record/background" => ControlMessage::CaptureBackground,
        "box" => {
            let region = match (
                arg_f32(args, 0),
                arg_f32(args, 1),
                arg_f32(args, 2),
                arg_f32(args, 3),
            ) {
                (Some(x), Some(y), Some(w), Some(h)) => BBox::new(x, y, w, h),
                _ => return Err(malformed(msg)),
            };
            let class_id = arg_u64(args, 4).map(|v| v as u32);
            ControlMessage::DrawBox { region, class_id }
        }
        "detection" => {
            let (Some(class_id), Some(confidence)) = (arg_u64(args, 0), arg_f32(args, 1)) else {
                return Err(malformed(msg));
            };
            let region = match (
                arg_f32(args, 2),
                arg_f32(args, 3),
                arg_f32(args, 4),
                arg_f32(args, 5),
            ) {
                (Some(x), Some(y), Some(w), Some(h)) => BBox::new(x, y, w, h),
                _ => return Err(malformed(msg)),
            };
            ControlMessage::Detection {
                class_id: class_id as u32,
                confidence,
                region,
                frame_seq: arg_u64(args, 6).ok_or_else(|| malformed(msg))?,
            }
        }
        "detections/count" => ControlMessage::DetectionCount {
            count: arg_u64(args, 0).ok_or_else(|| malformed(msg))? as u32,
        },
        "frame_end" => ControlMessage::FrameEnd {
            frame_seq: arg_u64(args, 0).ok_or_else(|| malformed(msg))?,
        },
        "status" => ControlMessage::Status {
            state: arg_str(args, 0).ok_or_else(|| malformed(msg))?,
            detail: arg_str(args, 1).unwrap_or_default(),
        },
        "memory" => ControlMessage::Memory {
            path: arg_str(args, 0).ok_or_else(|| malformed(msg))?,
            width: arg_u64(args, 1).ok_or_else(|| malformed(msg))? as u32,
            height: arg_u64(args, 2).ok_or_else(|| malformed(msg))? as u32,
            channels: arg_u64(args, 3).ok_or_else(|| malformed(msg))? as u32,
        },
        "train/progress" => {
            let run_id = arg_str(args, 0).ok_or_else(|| malformed(msg))?;
            let epoch = arg_u64(args, 1).ok_or_else(|| malformed(msg))? as u32;
            let total_epochs = arg_u64(args, 2).ok_or_else(|| malformed(msg))? as u32;
            let mut metrics = Vec::new();
            let mut i = 3;
            while let (Some(name), Some(value)) = (arg_str(args, i), arg_f32(args, i + 1)) {
                metrics.push((name, value));
                i += 2;
            }
            ControlMessage::TrainProgress {
                run_id,
                epoch,
                total_epochs,
                metrics,
            }
        }
        "train/status" => ControlMessage::TrainStatus {
            run_id: arg_str(args, 0).ok_or_else(|| malformed(msg))?,
            status: arg_str(args, 1).ok_or_else(|| malformed(msg))?,
            detail: arg_str(args, 2).unwrap_or_default(),
        },
        other => match other.strip_prefix("param/") {
            Some(name) if !name.is_empty() => ControlMessage::SetParameter {
                name: name.to_string(),
                value: arg_f32(args, 0).ok_or_else(|| malformed(msg))?,
            },
            _ => {
                trace!("未知地址 {}", msg.addr);
                return Ok(None);
            }
        },
    };
    Ok(Some(message))
}

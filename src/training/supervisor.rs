//! 训练任务监管 (Training Supervisor)
//!
//! 每个任务一个目录 `<runs_dir>/run_YYYYmmdd_HHMMSS`:
//! - `config.json`  启动前写入的训练配置
//! - `status.json`  每次状态变化时重写
//! - `train.log`    训练进程的完整输出
//!
//! 同一设备同时只允许一个活动任务. 进程崩溃时目录保留, 便于事后排查.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace, warn};

use super::progress::{ProgressEvent, ProgressParser};
use super::runner::{JobHandle, JobRunner, JobSpec};
use crate::config::TrainingConfig;
use crate::control::{ControlChannel, ControlMessage};
use crate::error::{FlowError, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const STATUS_FILE: &str = "status.json";
pub const LOG_FILE: &str = "train.log";

/// 进程退出后继续读取剩余输出的时长
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// 状态只能向前走: Pending → Running → 终态
    pub fn can_become(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next != RunStatus::Pending,
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// 训练配置记录 (写入 `config.json` 交给训练程序)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainJob {
    /// `dataset.yaml` 路径
    pub data: PathBuf,
    pub device: String,
    pub epochs: u32,
    pub image_size: u32,
    pub batch: u32,
    pub base_model: String,
    pub augment: bool,
}

impl TrainJob {
    pub fn from_config(config: &TrainingConfig, data: impl Into<PathBuf>) -> Self {
        Self {
            data: data.into(),
            device: config.device.clone(),
            epochs: config.epochs,
            image_size: config.image_size,
            batch: config.batch,
            base_model: config.base_model.clone(),
            augment: config.augment,
        }
    }
}

#[derive(Serialize)]
struct JobFile<'a> {
    run_id: &'a str,
    output_dir: &'a Path,
    #[serde(flatten)]
    job: &'a TrainJob,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub device: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub epoch: u32,
    pub total_epochs: u32,
    pub started: String,
    pub finished: Option<String>,
    pub exit_code: Option<i32>,
    pub detail: String,
}

struct RunEntry {
    run: TrainingRun,
    handle: Option<Arc<dyn JobHandle>>,
    cancel_requested: bool,
}

/// 监控线程与监管者共享的任务表
struct Shared {
    runs: Mutex<BTreeMap<String, RunEntry>>,
    channel: Option<Arc<dyn ControlChannel>>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, RunEntry>>> {
        self.runs
            .lock()
            .map_err(|_| FlowError::TrainingProcessCrashed("run table poisoned".into()))
    }

    fn publish(&self, message: ControlMessage) {
        if let Some(channel) = &self.channel {
            channel.send(message);
        }
    }

    fn publish_status(&self, run: &TrainingRun) {
        self.publish(ControlMessage::TrainStatus {
            run_id: run.run_id.clone(),
            status: run.status.as_str().to_string(),
            detail: run.detail.clone(),
        });
    }

    /// 状态迁移; 非法迁移 (例如终态之后) 被忽略并返回 None
    fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        detail: String,
        exit_code: Option<i32>,
    ) -> Option<TrainingRun> {
        let run = {
            let mut runs = self.lock().ok()?;
            let entry = runs.get_mut(run_id)?;
            if !entry.run.status.can_become(to) {
                warn!(
                    "⚠️ 任务 {} 忽略状态迁移 {} → {}",
                    run_id,
                    entry.run.status.as_str(),
                    to.as_str()
                );
                return None;
            }
            entry.run.status = to;
            entry.run.detail = detail;
            if to.is_terminal() {
                entry.run.finished = Some(Local::now().to_rfc3339());
                entry.run.exit_code = exit_code;
                entry.handle = None;
            }
            entry.run.clone()
        };

        if let Err(e) = write_status(&run) {
            warn!("⚠️ 无法写入 {}: {}", run.run_dir.join(STATUS_FILE).display(), e);
        }
        match run.status {
            RunStatus::Failed => error!("❌ 训练任务 {} 失败: {}", run.run_id, run.detail),
            status => info!("🏋️ 训练任务 {} → {} {}", run.run_id, status.as_str(), run.detail),
        }
        self.publish_status(&run);
        Some(run)
    }

    fn record_progress(&self, run_id: &str, event: &ProgressEvent) {
        if let Ok(mut runs) = self.lock() {
            if let Some(entry) = runs.get_mut(run_id) {
                entry.run.epoch = event.epoch;
                entry.run.total_epochs = event.total_epochs;
            }
        }
        self.publish(ControlMessage::TrainProgress {
            run_id: run_id.to_string(),
            epoch: event.epoch,
            total_epochs: event.total_epochs,
            metrics: event.metrics.clone(),
        });
    }

    fn cancel_requested(&self, run_id: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|runs| runs.get(run_id).map(|e| e.cancel_requested))
            .unwrap_or(false)
    }
}

fn write_status(run: &TrainingRun) -> Result<()> {
    let path = run.run_dir.join(STATUS_FILE);
    let tmp = run.run_dir.join(format!(".{}.tmp", STATUS_FILE));
    fs::write(&tmp, serde_json::to_string_pretty(run)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// 创建任务目录; 同名目录已存在时追加 `_2`, `_3`...
pub(crate) fn allocate_run_dir(runs_dir: &Path, base: &str) -> Result<(String, PathBuf)> {
    fs::create_dir_all(runs_dir)?;
    for n in 1u32.. {
        let run_id = if n == 1 {
            base.to_string()
        } else {
            format!("{}_{}", base, n)
        };
        let dir = runs_dir.join(&run_id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((run_id, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FlowError::Config(format!(
        "no free run directory under {}",
        runs_dir.display()
    )))
}

pub struct TrainingSupervisor {
    runs_dir: PathBuf,
    runner: Arc<dyn JobRunner>,
    shared: Arc<Shared>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TrainingSupervisor {
    pub fn new(
        runs_dir: impl Into<PathBuf>,
        runner: Arc<dyn JobRunner>,
        channel: Option<Arc<dyn ControlChannel>>,
    ) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            runner,
            shared: Arc::new(Shared {
                runs: Mutex::new(BTreeMap::new()),
                channel,
            }),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// 启动训练任务
    ///
    /// 同一设备已有活动任务时返回 `RunAlreadyActive`, 不排队.
    pub fn start(&self, job: TrainJob) -> Result<TrainingRun> {
        let run = {
            let mut runs = self.shared.lock()?;
            if let Some(active) = runs
                .values()
                .find(|e| e.run.device == job.device && !e.run.status.is_terminal())
            {
                return Err(FlowError::RunAlreadyActive {
                    device: job.device.clone(),
                    run_id: active.run.run_id.clone(),
                });
            }

            let base = format!("run_{}", Local::now().format("%Y%m%d_%H%M%S"));
            let (run_id, run_dir) = allocate_run_dir(&self.runs_dir, &base)?;
            let config = JobFile {
                run_id: &run_id,
                output_dir: &run_dir,
                job: &job,
            };
            fs::write(run_dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;

            let run = TrainingRun {
                run_id: run_id.clone(),
                device: job.device.clone(),
                run_dir,
                status: RunStatus::Pending,
                epoch: 0,
                total_epochs: job.epochs,
                started: Local::now().to_rfc3339(),
                finished: None,
                exit_code: None,
                detail: String::new(),
            };
            write_status(&run)?;
            runs.insert(
                run_id,
                RunEntry {
                    run: run.clone(),
                    handle: None,
                    cancel_requested: false,
                },
            );
            run
        };
        self.shared.publish_status(&run);

        let spec = JobSpec {
            run_id: run.run_id.clone(),
            run_dir: run.run_dir.clone(),
            config_path: run.run_dir.join(CONFIG_FILE),
        };
        let (lines, handle) = match self.runner.launch(&spec) {
            Ok(launched) => launched,
            Err(e) => {
                self.shared
                    .transition(&run.run_id, RunStatus::Failed, e.to_string(), None);
                return Err(e);
            }
        };

        let cancelled = {
            let mut runs = self.shared.lock()?;
            match runs.get_mut(&run.run_id) {
                Some(entry) => {
                    entry.handle = Some(handle.clone());
                    entry.cancel_requested
                }
                None => true,
            }
        };
        if cancelled {
            // 启动期间被取消
            let _ = handle.kill();
        }
        // 启动期间被取消时迁移失败, 返回任务表里的当前状态
        let running = match self
            .shared
            .transition(&run.run_id, RunStatus::Running, String::new(), None)
        {
            Some(running) => running,
            None => self.status(&run.run_id)?,
        };

        let shared = self.shared.clone();
        let run_id = running.run_id.clone();
        let log_path = running.run_dir.join(LOG_FILE);
        let total_hint = running.total_epochs;
        let monitor = std::thread::Builder::new()
            .name(format!("train-{}", run_id))
            .spawn(move || monitor(shared, run_id, lines, handle, total_hint, log_path))?;
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.insert(running.run_id.clone(), monitor);
        }
        Ok(running)
    }

    /// 取消任务 (终止训练进程); 最终状态由监控线程写为 `Cancelled`
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let handle = {
            let mut runs = self.shared.lock()?;
            let entry = runs
                .get_mut(run_id)
                .ok_or_else(|| FlowError::UnknownRun(run_id.to_string()))?;
            if entry.run.status.is_terminal() {
                return Ok(());
            }
            entry.cancel_requested = true;
            entry.handle.clone()
        };
        info!("🛑 取消训练任务 {}", run_id);
        match handle {
            Some(handle) => handle.kill(),
            None => {
                self.shared.transition(
                    run_id,
                    RunStatus::Cancelled,
                    "cancelled before launch".into(),
                    None,
                );
                Ok(())
            }
        }
    }

    pub fn status(&self, run_id: &str) -> Result<TrainingRun> {
        self.shared
            .lock()?
            .get(run_id)
            .map(|e| e.run.clone())
            .ok_or_else(|| FlowError::UnknownRun(run_id.to_string()))
    }

    pub fn runs(&self) -> Vec<TrainingRun> {
        self.shared
            .lock()
            .map(|runs| runs.values().map(|e| e.run.clone()).collect())
            .unwrap_or_default()
    }

    /// 设备上的活动任务
    pub fn active_on(&self, device: &str) -> Option<TrainingRun> {
        self.runs()
            .into_iter()
            .find(|r| r.device == device && !r.status.is_terminal())
    }

    /// 等待任务结束并返回最终状态
    pub fn wait(&self, run_id: &str) -> Result<TrainingRun> {
        let monitor = self
            .monitors
            .lock()
            .ok()
            .and_then(|mut m| m.remove(run_id));
        if let Some(monitor) = monitor {
            let _ = monitor.join();
        }
        self.status(run_id)
    }
}

fn monitor(
    shared: Arc<Shared>,
    run_id: String,
    lines: Receiver<String>,
    handle: Arc<dyn JobHandle>,
    total_hint: u32,
    log_path: PathBuf,
) {
    let mut log = match File::create(&log_path) {
        Ok(f) => Some(BufWriter::new(f)),
        Err(e) => {
            warn!("⚠️ 无法创建 {}: {}", log_path.display(), e);
            None
        }
    };
    let mut parser = ProgressParser::new(total_hint);
    let mut record = |line: String| {
        if let Some(log) = log.as_mut() {
            let _ = writeln!(log, "{}", line);
        }
        trace!("[{}] {}", run_id, line);
        if let Some(event) = parser.parse(&line) {
            shared.record_progress(&run_id, &event);
        }
    };

    // 后代进程可能继承输出管道, 所以进程退出和输出结束要分开等
    let (exit_tx, exit_rx) = bounded::<Result<Option<i32>>>(1);
    let waiter = handle.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("train-wait-{}", run_id))
        .spawn(move || {
            let _ = exit_tx.send(waiter.wait());
        });

    let exit = match spawned {
        Err(e) => {
            let _ = handle.kill();
            Err(e.into())
        }
        Ok(_) => loop {
            select! {
                recv(lines) -> line => match line {
                    Ok(line) => record(line),
                    Err(_) => break exit_rx.recv().unwrap_or_else(|_| {
                        Err(FlowError::TrainingProcessCrashed("wait thread exited".into()))
                    }),
                },
                recv(exit_rx) -> exit => {
                    let deadline = Instant::now() + OUTPUT_DRAIN;
                    let mut closed = false;
                    while !closed {
                        match lines.recv_deadline(deadline) {
                            Ok(line) => record(line),
                            Err(RecvTimeoutError::Disconnected) => closed = true,
                            Err(RecvTimeoutError::Timeout) => break,
                        }
                    }
                    if !closed {
                        warn!("⚠️ 训练进程 {} 已退出, 终止仍占用输出的子进程", run_id);
                        let _ = handle.kill();
                    }
                    break exit.unwrap_or_else(|_| {
                        Err(FlowError::TrainingProcessCrashed("wait thread exited".into()))
                    });
                },
            }
        },
    };
    drop(record);
    if let Some(mut log) = log {
        let _ = log.flush();
    }

    let (status, detail, code) = if shared.cancel_requested(&run_id) {
        (RunStatus::Cancelled, "cancelled by operator".to_string(), None)
    } else {
        match exit {
            Ok(Some(0)) => (RunStatus::Completed, "exit code 0".to_string(), Some(0)),
            Ok(Some(code)) => (
                RunStatus::Failed,
                FlowError::TrainingProcessCrashed(format!("exit code {}", code)).to_string(),
                Some(code),
            ),
            Ok(None) => (
                RunStatus::Failed,
                FlowError::TrainingProcessCrashed("terminated by signal".into()).to_string(),
                None,
            ),
            Err(e) => (RunStatus::Failed, e.to_string(), None),
        }
    };
    shared.transition(&run_id, status, detail, code);
}

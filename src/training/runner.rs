//! 外部训练进程

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::error::{FlowError, Result};

const WAIT_POLL: Duration = Duration::from_millis(100);

/// 一次训练任务的启动参数
#[derive(Clone, Debug, PartialEq)]
pub struct JobSpec {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// 训练配置文件 (`<run_dir>/config.json`)
    pub config_path: PathBuf,
}

/// 运行中的任务
pub trait JobHandle: Send + Sync {
    /// 阻塞直到任务结束; 返回退出码 (被信号终止时为 None)
    fn wait(&self) -> Result<Option<i32>>;

    fn kill(&self) -> Result<()>;
}

/// 任务启动器: 返回输出行流和任务句柄; 任务结束后输出流关闭
pub trait JobRunner: Send + Sync {
    fn launch(&self, spec: &JobSpec) -> Result<(Receiver<String>, Arc<dyn JobHandle>)>;
}

/// 以子进程运行训练程序: `<program> <args...> --config <config_path>`
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

fn pump(stream: impl Read + Send + 'static, tx: Sender<String>, name: &str) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("train-{}", name))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.split(b'\n') {
                let Ok(line) = line else { break };
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if tx.send(text).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

impl JobRunner for ProcessRunner {
    fn launch(&self, spec: &JobSpec) -> Result<(Receiver<String>, Arc<dyn JobHandle>)> {
        info!(
            "🚀 启动训练进程: {} {} --config {}",
            self.program,
            self.args.join(" "),
            spec.config_path.display()
        );
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--config")
            .arg(&spec.config_path)
            .current_dir(&spec.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // 独立进程组: 取消时连同 DataLoader 等子进程一起终止
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| {
                FlowError::TrainingProcessCrashed(format!("failed to start {}: {}", self.program, e))
            })?;

        // Ultralytics 把进度条写到 stderr, 两路都收
        let (tx, rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, tx.clone(), "stdout")?;
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, tx, "stderr")?;
        }
        debug!("训练进程 pid {}", child.id());
        let handle: Arc<dyn JobHandle> = Arc::new(ProcessHandle {
            child: Mutex::new(child),
        });
        Ok((rx, handle))
    }
}

struct ProcessHandle {
    child: Mutex<Child>,
}

impl ProcessHandle {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Child>> {
        self.child
            .lock()
            .map_err(|_| FlowError::TrainingProcessCrashed("process handle poisoned".into()))
    }
}

impl JobHandle for ProcessHandle {
    fn wait(&self) -> Result<Option<i32>> {
        // 轮询而不是阻塞 wait(), 这样 kill 能拿到锁
        loop {
            if let Some(status) = self.lock()?.try_wait()? {
                return Ok(status.code());
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    fn kill(&self) -> Result<()> {
        let mut child = self.lock()?;
        // 进程组 id 就是子进程 pid; 子进程已退出时组里仍可能有后代进程
        #[cfg(unix)]
        unsafe {
            libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
        }
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        Ok(())
    }
}

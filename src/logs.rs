use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
};

pub const LOG_CAPACITY: usize = 100;
/// Existing lines replayed when following starts.
pub const INITIAL_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub text: String,
    pub is_error: bool,
}

impl LogEntry {
    pub fn classify(text: impl Into<String>) -> Self {
        let text = text.into();
        let lowered = text.to_lowercase();
        let is_error = lowered.contains("error") || lowered.contains("panic");
        Self { text, is_error }
    }
}

/// 固定容量的日志环形缓冲，超出容量时丢弃最旧的行。
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Follows a log file through `tail -F`, forwarding classified lines.
#[derive(Debug, Default)]
pub struct LogTailer {
    task: Option<JoinHandle<()>>,
    path: Option<PathBuf>,
}

impl LogTailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 开始跟随日志文件；已有跟随任务时先停止。
    pub fn start(&mut self, path: &Path, sink: mpsc::UnboundedSender<LogEntry>) {
        self.stop();
        let path = path.to_path_buf();
        self.path = Some(path.clone());
        self.task = Some(tokio::spawn(follow(path, sink)));
    }

    /// Idempotent; the `tail` child dies with the task.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.path = None;
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow(path: PathBuf, sink: mpsc::UnboundedSender<LogEntry>) {
    let spawned = Command::new("tail")
        .arg("-n")
        .arg(INITIAL_TAIL_LINES.to_string())
        .arg("-F")
        .arg(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to follow log file");
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return;
    };

    tracing::debug!(path = %path.display(), "following proxy log");
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if sink.send(LogEntry::classify(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "log follow interrupted");
                break;
            }
        }
    }
}

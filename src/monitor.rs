use std::{path::PathBuf, time::Duration};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinError,
    time::MissedTickBehavior,
};

use crate::{
    config::{self, ConnectionConfig, LocatorOverrides, SearchRoots},
    keys::{KeyRecord, KeyStore, KeyStoreError, generate_key},
    logs::{LOG_CAPACITY, LogBuffer, LogEntry, LogTailer},
    mask_key,
    service::{self, ServiceError, ServiceStatus},
    usage::{UsageClient, UsageSummary, compact_count},
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub overrides: LocatorOverrides,
    pub roots: SearchRoots,
    pub poll_interval: Duration,
    pub monitor_enabled: bool,
    pub log_path: PathBuf,
    pub log_capacity: usize,
}

impl MonitorOptions {
    pub fn new(overrides: LocatorOverrides, roots: SearchRoots) -> Self {
        Self {
            overrides,
            roots,
            poll_interval: POLL_INTERVAL,
            monitor_enabled: true,
            log_path: service::log_file_path(),
            log_capacity: LOG_CAPACITY,
        }
    }

    fn resolve(&self) -> ConnectionConfig {
        config::resolve(&self.overrides, &self.roots)
    }
}

/// 展示层读取的不可变状态快照。
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub config_path: Option<PathBuf>,
    pub base_url: String,
    pub monitor_enabled: bool,
    pub refreshing: bool,
    pub service: ServiceStatus,
    pub keys: Vec<KeyRecord>,
    pub usage: Option<UsageSummary>,
    pub usage_error: Option<String>,
    pub action_message: Option<String>,
    pub logs: Vec<LogEntry>,
    pub crash_count: u64,
    pub last_crash_at: Option<i64>,
    pub last_poll_at: Option<i64>,
    pub title: String,
}

/// Menu-bar title: `OFF`, `--` before the first summary, else the compact total.
pub fn menu_title(monitor_enabled: bool, usage: Option<&UsageSummary>) -> String {
    if !monitor_enabled {
        return "OFF".to_owned();
    }
    match usage {
        Some(summary) => compact_count(summary.display_requests()),
        None => "--".to_owned(),
    }
}

/// Flags a running -> stopped transition that no stop command asked for.
#[derive(Debug, Default)]
pub struct CrashDetector {
    was_running: bool,
    stop_requested: bool,
}

impl CrashDetector {
    pub fn stop_requested(&mut self) {
        self.stop_requested = true;
    }

    pub fn start_requested(&mut self) {
        self.stop_requested = false;
    }

    /// Returns true exactly once per unexpected exit.
    pub fn observe(&mut self, running: bool) -> bool {
        let crashed = self.was_running && !running && !self.stop_requested;
        if !running {
            self.stop_requested = false;
        }
        self.was_running = running;
        crashed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub message: String,
    pub key: Option<String>,
}

impl Outcome {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Keys(#[from] KeyStoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("background task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("monitor has shut down")]
    Closed,
}

type Reply = oneshot::Sender<Result<Outcome, ActionError>>;

enum Command {
    AddKey { raw: String, reply: Reply },
    GenerateKey { reply: Reply },
    RemoveKey { key: String, reply: Reply },
    SetEnabled { key: String, enabled: bool, reply: Reply },
    UpdateNote { key: String, note: String, reply: Reply },
    StartService { reply: Reply },
    StopService { reply: Reply },
    Refresh { reply: oneshot::Sender<()> },
    SetMonitoring { enabled: bool, reply: oneshot::Sender<()> },
    Shutdown,
}

/// 监控任务的句柄：命令经 mpsc 发送，状态经 watch 通道发布。
#[derive(Debug, Clone)]
pub struct Monitor {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AddKey { .. } => "AddKey",
            Self::GenerateKey { .. } => "GenerateKey",
            Self::RemoveKey { .. } => "RemoveKey",
            Self::SetEnabled { .. } => "SetEnabled",
            Self::UpdateNote { .. } => "UpdateNote",
            Self::StartService { .. } => "StartService",
            Self::StopService { .. } => "StopService",
            Self::Refresh { .. } => "Refresh",
            Self::SetMonitoring { .. } => "SetMonitoring",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Monitor {
    /// Spawns the control task; the first poll runs immediately.
    pub fn spawn(options: MonitorOptions, client: UsageClient) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (log_tx, log_rx) = mpsc::unbounded_channel();

        let state = MonitorState::new(
            options.resolve(),
            options.monitor_enabled,
            options.log_capacity,
        );
        let (publisher, snapshots) = watch::channel(state.snapshot());

        let worker = Worker {
            options,
            client,
            state,
            crash: CrashDetector::default(),
            tailer: LogTailer::new(),
            log_tx,
            publisher,
        };
        tokio::spawn(worker.run(command_rx, log_rx));

        Self {
            commands: command_tx,
            snapshots,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub async fn add_key(&self, raw: impl Into<String>) -> Result<Outcome, MonitorError> {
        let raw = raw.into();
        self.request(|reply| Command::AddKey { raw, reply }).await
    }

    pub async fn generate_key(&self) -> Result<Outcome, MonitorError> {
        self.request(|reply| Command::GenerateKey { reply }).await
    }

    pub async fn remove_key(&self, key: impl Into<String>) -> Result<Outcome, MonitorError> {
        let key = key.into();
        self.request(|reply| Command::RemoveKey { key, reply }).await
    }

    pub async fn set_enabled(
        &self,
        key: impl Into<String>,
        enabled: bool,
    ) -> Result<Outcome, MonitorError> {
        let key = key.into();
        self.request(|reply| Command::SetEnabled {
            key,
            enabled,
            reply,
        })
        .await
    }

    pub async fn update_note(
        &self,
        key: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<Outcome, MonitorError> {
        let key = key.into();
        let note = note.into();
        self.request(|reply| Command::UpdateNote { key, note, reply })
            .await
    }

    pub async fn start_service(&self) -> Result<Outcome, MonitorError> {
        self.request(|reply| Command::StartService { reply }).await
    }

    pub async fn stop_service(&self) -> Result<Outcome, MonitorError> {
        self.request(|reply| Command::StopService { reply }).await
    }

    /// Out-of-cycle poll; resolves once the snapshot is updated.
    pub async fn refresh(&self) -> Result<(), MonitorError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Refresh { reply }).await?;
        done.await.map_err(|_| MonitorError::Closed)
    }

    pub async fn set_monitoring(&self, enabled: bool) -> Result<(), MonitorError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::SetMonitoring { enabled, reply }).await?;
        done.await.map_err(|_| MonitorError::Closed)
    }

    /// Stops polling and the log tailer. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<F>(&self, build: F) -> Result<Outcome, MonitorError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, outcome) = oneshot::channel();
        self.send(build(reply)).await?;
        let result = outcome.await.map_err(|_| MonitorError::Closed)?;
        Ok(result?)
    }

    async fn send(&self, command: Command) -> Result<(), MonitorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MonitorError::Closed)
    }
}

#[derive(Debug)]
struct MonitorState {
    config: ConnectionConfig,
    monitor_enabled: bool,
    refreshing: bool,
    service: ServiceStatus,
    keys: Vec<KeyRecord>,
    usage: Option<UsageSummary>,
    usage_error: Option<String>,
    action_message: Option<String>,
    logs: LogBuffer,
    crash_count: u64,
    last_crash_at: Option<i64>,
    last_poll_at: Option<i64>,
}

impl MonitorState {
    fn new(config: ConnectionConfig, monitor_enabled: bool, log_capacity: usize) -> Self {
        Self {
            config,
            monitor_enabled,
            refreshing: false,
            service: ServiceStatus::default(),
            keys: Vec::new(),
            usage: None,
            usage_error: None,
            action_message: None,
            logs: LogBuffer::with_capacity(log_capacity),
            crash_count: 0,
            last_crash_at: None,
            last_poll_at: None,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            config_path: self.config.config_path.clone(),
            base_url: self.config.base_url.clone(),
            monitor_enabled: self.monitor_enabled,
            refreshing: self.refreshing,
            service: self.service.clone(),
            keys: self.keys.clone(),
            usage: self.usage.clone(),
            usage_error: self.usage_error.clone(),
            action_message: self.action_message.clone(),
            logs: self.logs.to_vec(),
            crash_count: self.crash_count,
            last_crash_at: self.last_crash_at,
            last_poll_at: self.last_poll_at,
            title: menu_title(self.monitor_enabled, self.usage.as_ref()),
        }
    }
}

struct Worker {
    options: MonitorOptions,
    client: UsageClient,
    state: MonitorState,
    crash: CrashDetector,
    tailer: LogTailer,
    log_tx: mpsc::UnboundedSender<LogEntry>,
    publisher: watch::Sender<Snapshot>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut log_rx: mpsc::UnboundedReceiver<LogEntry>,
    ) {
        self.poll().await;

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            let reset_ticker = tokio::select! {
                _ = ticker.tick(), if self.state.monitor_enabled => {
                    self.poll().await;
                    false
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                Some(entry) = log_rx.recv() => {
                    self.state.logs.push(entry);
                    self.publish();
                    false
                }
            };
            if reset_ticker {
                ticker.reset();
            }
        }

        self.tailer.stop();
        tracing::info!("monitor stopped");
    }

    /// Returns whether the poll timer should restart from now.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::AddKey { raw, reply } => {
                let result = self
                    .with_store(move |store| store.add_key(&raw))
                    .await
                    .map(|key| Outcome {
                        message: format!("added key {}", mask_key(&key)),
                        key: Some(key),
                    });
                self.finish(result, reply).await;
            }
            Command::GenerateKey { reply } => {
                let generated = generate_key();
                let result = self
                    .with_store(move |store| store.add_key(&generated))
                    .await
                    .map(|key| Outcome {
                        message: format!("generated key {}", mask_key(&key)),
                        key: Some(key),
                    });
                self.finish(result, reply).await;
            }
            Command::RemoveKey { key, reply } => {
                let label = mask_key(&key);
                let result = self
                    .with_store(move |store| store.remove_key(&key))
                    .await
                    .map(|removed| {
                        if removed {
                            Outcome::message(format!("removed key {label}"))
                        } else {
                            Outcome::message(format!("key {label} not found"))
                        }
                    });
                self.finish(result, reply).await;
            }
            Command::SetEnabled {
                key,
                enabled,
                reply,
            } => {
                let label = mask_key(&key);
                let result = self
                    .with_store(move |store| store.set_enabled(&key, enabled))
                    .await
                    .map(|_| {
                        let verb = if enabled { "enabled" } else { "disabled" };
                        Outcome::message(format!("{verb} key {label}"))
                    });
                self.finish(result, reply).await;
            }
            Command::UpdateNote { key, note, reply } => {
                let label = mask_key(&key);
                let result = self
                    .with_store(move |store| store.update_note(&key, &note))
                    .await
                    .map(|_| Outcome::message(format!("updated note for {label}")));
                self.finish(result, reply).await;
            }
            Command::StartService { reply } => {
                self.crash.start_requested();
                let config = self.options.resolve();
                let result = service::start(&config)
                    .await
                    .map(|status| Outcome::message(format!("local service {}", status.summary_line())))
                    .map_err(ActionError::from);
                self.finish(result, reply).await;
            }
            Command::StopService { reply } => {
                self.crash.stop_requested();
                let config = self.options.resolve();
                service::stop(&config).await;
                self.finish(Ok(Outcome::message("stop requested")), reply)
                    .await;
            }
            Command::Refresh { reply } => {
                self.poll().await;
                let _ = reply.send(());
            }
            Command::SetMonitoring { enabled, reply } => {
                self.state.monitor_enabled = enabled;
                tracing::info!(enabled, "usage monitoring toggled");
                if enabled {
                    self.poll().await;
                } else {
                    self.publish();
                }
                let _ = reply.send(());
                return enabled;
            }
            Command::Shutdown => {}
        }
        false
    }

    async fn with_store<T, F>(&self, apply: F) -> Result<T, ActionError>
    where
        F: FnOnce(&KeyStore) -> Result<T, KeyStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.options.resolve().config_path;
        let result = tokio::task::spawn_blocking(move || {
            let store = KeyStore::open(path.as_deref())?;
            apply(&store)
        })
        .await?;
        Ok(result?)
    }

    async fn finish(&mut self, result: Result<Outcome, ActionError>, reply: Reply) {
        match &result {
            Ok(outcome) => {
                tracing::info!(message = %outcome.message, "action completed");
                self.state.action_message = Some(outcome.message.clone());
            }
            Err(err) => {
                tracing::warn!(error = %err, "action failed");
                self.state.action_message = Some(err.to_string());
            }
        }
        self.poll().await;
        let _ = reply.send(result);
    }

    /// 一次完整轮询：usage -> 服务状态与 key 列表 -> 崩溃检测 -> 日志跟随。
    async fn poll(&mut self) {
        self.state.refreshing = true;
        self.publish();

        let config = self.options.resolve();

        if self.state.monitor_enabled {
            match self
                .client
                .fetch_usage_summary(&config.base_url, &config.management_key)
                .await
            {
                Ok(summary) => {
                    self.state.usage = Some(summary);
                    self.state.usage_error = None;
                }
                Err(err) => {
                    tracing::warn!(error = %err, base_url = %config.base_url, "usage poll failed");
                    self.state.usage_error = Some(err.friendly_message(&config.management_key));
                }
            }
        }

        let status = service::query_status(&config).await;
        match load_keys(config.config_path.clone()).await {
            Ok(keys) => self.state.keys = keys,
            Err(ActionError::Keys(KeyStoreError::ConfigNotFound)) => self.state.keys.clear(),
            Err(err) => tracing::warn!(error = %err, "failed to reload api keys"),
        }

        if self.crash.observe(status.running) {
            self.state.crash_count += 1;
            self.state.last_crash_at = Some(Utc::now().timestamp());
            self.state.action_message = Some("local service stopped unexpectedly".to_owned());
            tracing::warn!(port = config.port, "proxy exited without a stop request");
        }

        let running = status.running;
        self.state.service = status;
        self.state.config = config;

        if running && !self.tailer.is_active() {
            self.tailer.start(&self.options.log_path, self.log_tx.clone());
        }

        self.state.last_poll_at = Some(Utc::now().timestamp());
        self.state.refreshing = false;
        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.state.snapshot());
    }
}

async fn load_keys(path: Option<PathBuf>) -> Result<Vec<KeyRecord>, ActionError> {
    let result = tokio::task::spawn_blocking(move || {
        KeyStore::open(path.as_deref())?.load_entries()
    })
    .await?;
    Ok(result?)
}

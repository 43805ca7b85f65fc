use std::{
    fs::{File, OpenOptions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{BINARY_NAME, ConnectionConfig};

/// 启动后等待端口绑定的时间。
pub const START_SETTLE_DELAY: Duration = Duration::from_secs(1);
const LOG_FILE_NAME: &str = "cli-proxy-api.log";

/// 某一时刻对本地代理进程的观测结果，每次轮询整体替换。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub detail: Option<String>,
}

impl ServiceStatus {
    pub fn summary_line(&self) -> String {
        match (self.running, self.pid, self.detail.as_deref()) {
            (true, Some(pid), _) => format!("running (pid {pid})"),
            (true, None, _) => "running".to_owned(),
            (false, _, Some(detail)) => format!("stopped ({detail})"),
            (false, _, None) => "stopped".to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("config.yaml not found, cannot control the local service")]
    ConfigNotFound,
    #[error("binary not found at {}", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("failed to start the local service")]
    FailedToStart,
    #[error("failed to launch process: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed path the proxy's combined output is redirected to.
pub fn log_file_path() -> PathBuf {
    std::env::temp_dir().join(LOG_FILE_NAME)
}

pub async fn query_status(config: &ConnectionConfig) -> ServiceStatus {
    if let Some(pid) = pid_listening_on(config.port).await {
        return ServiceStatus {
            running: true,
            pid: Some(pid),
            detail: None,
        };
    }

    let detail = config
        .binary_path()
        .filter(|binary| !is_executable(binary))
        .map(|binary| format!("missing binary: {}", binary.display()));

    ServiceStatus {
        running: false,
        pid: None,
        detail,
    }
}

/// 以独立进程组启动代理，输出写入临时日志文件，等待片刻后重新确认状态。
pub async fn start(config: &ConnectionConfig) -> Result<ServiceStatus, ServiceError> {
    let config_path = config
        .config_path
        .as_deref()
        .ok_or(ServiceError::ConfigNotFound)?;
    let binary = config
        .binary_path()
        .ok_or_else(|| ServiceError::BinaryNotFound(PathBuf::from(BINARY_NAME)))?;
    if !is_executable(&binary) {
        return Err(ServiceError::BinaryNotFound(binary));
    }

    let log_path = log_file_path();
    let stdout = open_log_file(&log_path)?;
    let stderr = stdout.try_clone()?;

    let child = Command::new(&binary)
        .arg("-config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()?;
    tracing::info!(
        binary = %binary.display(),
        pid = child.id(),
        log = %log_path.display(),
        "launched proxy"
    );
    // Dropping the handle leaves the child running; the runtime reaps it on exit.
    drop(child);

    tokio::time::sleep(START_SETTLE_DELAY).await;

    let status = query_status(config).await;
    if !status.running {
        tracing::warn!(port = config.port, "proxy did not bind its port after start");
        return Err(ServiceError::FailedToStart);
    }
    Ok(status)
}

/// Best effort: SIGTERM to the port owner, then a command-line match fallback.
pub async fn stop(config: &ConnectionConfig) {
    if let Some(pid) = pid_listening_on(config.port).await {
        match i32::try_from(pid) {
            Ok(raw) => {
                if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    tracing::debug!(pid, error = %err, "SIGTERM failed");
                } else {
                    tracing::info!(pid, "sent SIGTERM to proxy");
                }
            }
            Err(_) => tracing::debug!(pid, "pid out of range"),
        }
    }

    if let Some(config_path) = config.config_path.as_deref() {
        let pattern = stop_pattern(config_path);
        let result = Command::new("pkill")
            .arg("-f")
            .arg(&pattern)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = result {
            tracing::debug!(error = %err, "pkill unavailable");
        }
    }
}

/// `pkill -f` takes an extended regex; the path is matched literally.
fn stop_pattern(config_path: &Path) -> String {
    let path = config_path.display().to_string();
    format!("{BINARY_NAME} -config {}", escape_regex(&path))
}

fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// 通过 `lsof` 查询监听该端口的进程。
pub async fn pid_listening_on(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .arg("-n")
        .arg("-P")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    parse_first_pid(&String::from_utf8_lossy(&output.stdout))
}

fn parse_first_pid(output: &str) -> Option<u32> {
    output.lines().next()?.trim().parse().ok()
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_in(dir: &Path, port: u16) -> ConnectionConfig {
        let config_path = dir.join("config.yaml");
        fs::write(&config_path, format!("port: {port}\n")).unwrap();
        ConnectionConfig {
            base_url: format!("http://localhost:{port}"),
            management_key: String::new(),
            port,
            config_path: Some(config_path),
        }
    }

    #[test]
    fn first_pid_line_wins() {
        assert_eq!(parse_first_pid("4242\n4343\n"), Some(4242));
        assert_eq!(parse_first_pid("  17 \n"), Some(17));
        assert_eq!(parse_first_pid(""), None);
        assert_eq!(parse_first_pid("garbage"), None);
    }

    #[test]
    fn executable_bit_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(BINARY_NAME);
        fs::write(&binary, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable(&binary));
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&binary));
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn summary_line_reflects_status() {
        let running = ServiceStatus {
            running: true,
            pid: Some(12),
            detail: None,
        };
        assert_eq!(running.summary_line(), "running (pid 12)");
        assert_eq!(ServiceStatus::default().summary_line(), "stopped");
    }

    #[test]
    fn stop_pattern_names_binary_and_config() {
        assert_eq!(
            stop_pattern(Path::new("/opt/proxy/config.yaml")),
            r"cli-proxy-api -config /opt/proxy/config\.yaml"
        );
        assert_eq!(
            stop_pattern(Path::new("/srv/c++ (v2)/[a]/config.yaml")),
            r"cli-proxy-api -config /srv/c\+\+ \(v2\)/\[a\]/config\.yaml"
        );
    }

    #[tokio::test]
    async fn start_without_config_path_fails() {
        let config = ConnectionConfig {
            base_url: "http://localhost:1".into(),
            management_key: String::new(),
            port: 1,
            config_path: None,
        };
        assert!(matches!(
            start(&config).await,
            Err(ServiceError::ConfigNotFound)
        ));
    }

    #[tokio::test]
    async fn start_reports_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 1);
        match start(&config).await {
            Err(ServiceError::BinaryNotFound(path)) => {
                assert_eq!(path, dir.path().join(BINARY_NAME));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_the_port_owner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), port);

        let status = query_status(&config).await;
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(status.detail.is_none());
        assert_eq!(
            status.summary_line(),
            format!("running (pid {})", std::process::id())
        );

        drop(listener);
        assert!(!query_status(&config).await.running);
    }

    #[tokio::test]
    async fn status_names_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 1);
        let status = query_status(&config).await;
        assert!(!status.running);
        assert!(status.detail.unwrap().contains(BINARY_NAME));
    }
}

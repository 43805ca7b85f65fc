//! 本地 CLIProxyAPI 服务的监管组件：配置发现、API key 管理、进程控制、
//! usage 统计与日志跟随。

pub mod config;
pub mod keys;
pub mod logs;
pub mod monitor;
pub mod service;
pub mod usage;

pub use config::{ConnectionConfig, LocatorOverrides, SearchRoots};
pub use keys::{KeyRecord, KeyStore, KeyStoreError, generate_key};
pub use logs::{LogBuffer, LogEntry, LogTailer};
pub use monitor::{ActionError, Monitor, MonitorError, MonitorOptions, Outcome, Snapshot};
pub use service::{ServiceError, ServiceStatus};
pub use usage::{KeyUsage, UsageClient, UsageError, UsageSummary, compact_count};

const MASK_MIN_LEN: usize = 14;
const MASK_HEAD: usize = 7;
const MASK_TAIL: usize = 4;

/// 展示用的 key 脱敏：保留前 7 位与后 4 位，短 key 原样返回。
pub fn mask_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "(unknown)".to_owned();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= MASK_MIN_LEN {
        return trimmed.to_owned();
    }
    let head: String = chars[..MASK_HEAD].iter().collect();
    let tail: String = chars[chars.len() - MASK_TAIL..].iter().collect();
    format!("{head}...{tail}")
}

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use url::Url;

/// 代理默认监听端口。
pub const DEFAULT_PORT: u16 = 8317;
/// 代理可执行文件名，与 config.yaml 位于同一目录。
pub const BINARY_NAME: &str = "cli-proxy-api";

pub const ENV_BASE_URL: &str = "CLIPROXY_BASE_URL";
pub const ENV_MANAGEMENT_KEY: &str = "CLIPROXY_MANAGEMENT_KEY";
pub const ENV_CONFIG_PATH: &str = "CLIPROXY_CONFIG_PATH";

/// 一次解析得到的连接参数快照。每次调用 [`resolve`] 都重新读取文件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub management_key: String,
    pub port: u16,
    pub config_path: Option<PathBuf>,
}

impl ConnectionConfig {
    fn fallback(management_key: String) -> Self {
        Self {
            base_url: format!("http://localhost:{DEFAULT_PORT}"),
            management_key,
            port: DEFAULT_PORT,
            config_path: None,
        }
    }

    pub fn has_config_file(&self) -> bool {
        self.config_path.is_some()
    }

    /// `cli-proxy-api` next to the resolved config file.
    pub fn binary_path(&self) -> Option<PathBuf> {
        let parent = self.config_path.as_deref()?.parent()?;
        if parent.as_os_str().is_empty() {
            return None;
        }
        Some(parent.join(BINARY_NAME))
    }
}

/// Values that take precedence over file discovery.
#[derive(Debug, Clone, Default)]
pub struct LocatorOverrides {
    pub base_url: Option<String>,
    pub management_key: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl LocatorOverrides {
    fn trimmed_base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn trimmed_management_key(&self) -> Option<&str> {
        self.management_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Directories the conventional candidate paths are relative to.
#[derive(Debug, Clone)]
pub struct SearchRoots {
    pub cwd: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl SearchRoots {
    pub fn current() -> Self {
        Self {
            cwd: std::env::current_dir().ok(),
            home: dirs::home_dir(),
        }
    }
}

/// 按环境变量、候选路径、默认值的顺序解析连接参数，永不失败。
pub fn resolve(overrides: &LocatorOverrides, roots: &SearchRoots) -> ConnectionConfig {
    let env_key = overrides.trimmed_management_key().map(str::to_owned);

    if let Some(base_url) = overrides.trimmed_base_url() {
        return ConnectionConfig {
            base_url: base_url.to_owned(),
            management_key: env_key.unwrap_or_default(),
            port: port_from_url(base_url),
            config_path: None,
        };
    }

    for path in candidate_paths(overrides, roots) {
        if let Some(mut parsed) = parse_config_file(&path) {
            if let Some(key) = env_key {
                parsed.management_key = key;
            }
            return parsed;
        }
    }

    ConnectionConfig::fallback(env_key.unwrap_or_default())
}

pub fn candidate_paths(overrides: &LocatorOverrides, roots: &SearchRoots) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(explicit) = overrides
        .config_path
        .as_ref()
        .filter(|path| !path.as_os_str().is_empty())
    {
        paths.push(explicit.clone());
    }

    if let Some(cwd) = roots.cwd.as_ref() {
        paths.push(cwd.join("config.yaml"));
        paths.push(cwd.join("../CLIProxyAPI/config.yaml"));
    }

    if let Some(home) = roots.home.as_ref() {
        paths.push(home.join("CLIProxyAPI/config.yaml"));
        paths.push(home.join(".cliproxyapi/config.yaml"));
    }

    let mut seen = HashSet::new();
    paths.retain(|path| seen.insert(path.clone()));
    paths
}

fn parse_config_file(path: &Path) -> Option<ConnectionConfig> {
    if !path.is_file() {
        return None;
    }
    let raw = fs::read_to_string(path).ok()?;
    let port = parse_port(&raw).unwrap_or(DEFAULT_PORT);
    let management_key = parse_management_secret(&raw).unwrap_or_default();

    Some(ConnectionConfig {
        base_url: format!("http://localhost:{port}"),
        management_key,
        port,
        config_path: Some(path.to_path_buf()),
    })
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

/// First top-level `port:`; an unparsable value falls back to the default.
pub fn parse_port(yaml: &str) -> Option<u16> {
    let line = yaml.lines().find(|line| line.starts_with("port:"))?;
    let value = line["port:".len()..].trim();
    strip_inline_comment(value).parse().ok()
}

/// `remote-management.secret-key`, quotes stripped.
pub fn parse_management_secret(yaml: &str) -> Option<String> {
    let mut in_block = false;

    for line in yaml.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if !is_indented(line) {
            in_block = trimmed == "remote-management:";
            continue;
        }

        if in_block && let Some(rest) = trimmed.strip_prefix("secret-key:") {
            return Some(unquote(rest.trim()).to_owned());
        }
    }

    None
}

fn strip_inline_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end(),
        None => value,
    }
}

pub(crate) fn unquote(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

fn port_from_url(base_url: &str) -> u16 {
    Url::parse(base_url)
        .ok()
        .and_then(|url| url.port_or_known_default())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn roots_in(dir: &Path) -> SearchRoots {
        SearchRoots {
            cwd: Some(dir.to_path_buf()),
            home: None,
        }
    }

    fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn env_base_url_short_circuits_file_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "config.yaml", "port: 9000\n");
        let overrides = LocatorOverrides {
            base_url: Some("  http://10.0.0.2:9999  ".into()),
            management_key: Some("secret".into()),
            config_path: None,
        };

        let config = resolve(&overrides, &roots_in(dir.path()));
        assert_eq!(config.base_url, "http://10.0.0.2:9999");
        assert_eq!(config.management_key, "secret");
        assert_eq!(config.port, 9999);
        assert!(config.config_path.is_none());
        assert!(config.binary_path().is_none());
    }

    #[test]
    fn extracts_port_and_secret_among_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let body = "\
# port: 1111
host: \"\"
port: 8421
auth:
  port: 7777
remote-management:
  allow-remote: false
  # secret-key: \"commented\"
  secret-key: \"mgmt-123\"
  disable-control-panel: true
api-keys:
  - \"sk-one\"
";
        let path = write_config(dir.path(), "config.yaml", body);

        let config = resolve(&LocatorOverrides::default(), &roots_in(dir.path()));
        assert_eq!(config.port, 8421);
        assert_eq!(config.base_url, "http://localhost:8421");
        assert_eq!(config.management_key, "mgmt-123");
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(config.binary_path(), Some(dir.path().join(BINARY_NAME)));
    }

    #[test]
    fn secret_outside_remote_management_is_ignored() {
        let body = "\
remote-management:
  allow-remote: true
debug: false
other:
  secret-key: 'not-this-one'
";
        assert_eq!(parse_management_secret(body), None);
        assert_eq!(
            parse_management_secret("remote-management:\n  secret-key: 'abc'\n").as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn missing_or_bad_port_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "config.yaml", "port: not-a-number\n");
        let config = resolve(&LocatorOverrides::default(), &roots_in(dir.path()));
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.has_config_file());
    }

    #[test]
    fn explicit_path_wins_over_cwd_candidate() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "config.yaml", "port: 1000\n");
        let explicit = write_config(dir.path(), "custom.yaml", "port: 2000\n");
        let overrides = LocatorOverrides {
            config_path: Some(explicit.clone()),
            management_key: Some("from-env".into()),
            ..Default::default()
        };

        let config = resolve(&overrides, &roots_in(dir.path()));
        assert_eq!(config.port, 2000);
        assert_eq!(config.config_path, Some(explicit));
        assert_eq!(config.management_key, "from-env");
    }

    #[test]
    fn nothing_found_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve(&LocatorOverrides::default(), &roots_in(dir.path()));
        assert_eq!(config.base_url, "http://localhost:8317");
        assert_eq!(config.management_key, "");
        assert!(config.config_path.is_none());
    }

    #[test]
    fn candidates_are_deduplicated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = LocatorOverrides {
            config_path: Some(dir.path().join("config.yaml")),
            ..Default::default()
        };
        let roots = SearchRoots {
            cwd: Some(dir.path().to_path_buf()),
            home: Some(PathBuf::from("/home/op")),
        };

        let paths = candidate_paths(&overrides, &roots);
        assert_eq!(paths[0], dir.path().join("config.yaml"));
        assert_eq!(paths[1], dir.path().join("../CLIProxyAPI/config.yaml"));
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[3], PathBuf::from("/home/op/.cliproxyapi/config.yaml"));
    }
}

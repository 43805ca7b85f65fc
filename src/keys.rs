use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use rand::{RngCore, rngs::OsRng};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::{config::unquote, mask_key};

const BLOCK_HEADER: &str = "api-keys:";
const DISABLED_MARKER: &str = "disabled";
/// 新生成 key 的前缀。
pub const KEY_PREFIX: &str = "sk-";
const KEY_BYTES: usize = 32;

// Serialises load-modify-save sequences; the file is rewritten as a whole.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// config.yaml 中 `api-keys:` 块里的一条记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRecord {
    pub key: String,
    pub note: String,
    pub enabled: bool,
}

impl KeyRecord {
    fn new(key: String) -> Self {
        Self {
            key,
            note: String::new(),
            enabled: true,
        }
    }

    pub fn masked(&self) -> String {
        mask_key(&self.key)
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("config.yaml not found")]
    ConfigNotFound,
    #[error("key already exists")]
    KeyAlreadyExists,
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key must not contain whitespace, quotes or '#'")]
    InvalidKey,
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
}

/// 直接读写 config.yaml 的 key 存储，不做任何内存缓存。
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn open(config_path: Option<&Path>) -> Result<Self, KeyStoreError> {
        let path = config_path.ok_or(KeyStoreError::ConfigNotFound)?;
        if !path.is_file() {
            return Err(KeyStoreError::ConfigNotFound);
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_entries(&self) -> Result<Vec<KeyRecord>, KeyStoreError> {
        let raw = self.read()?;
        Ok(parse_entries(&raw))
    }

    /// Appends an enabled record and returns the trimmed key.
    pub fn add_key(&self, raw_key: &str) -> Result<String, KeyStoreError> {
        let key = raw_key.trim();
        if key.is_empty() {
            return Err(KeyStoreError::EmptyKey);
        }
        if !is_valid_key(key) {
            return Err(KeyStoreError::InvalidKey);
        }

        self.mutate(|records| {
            if records.iter().any(|record| record.key == key) {
                return Err(KeyStoreError::KeyAlreadyExists);
            }
            records.push(KeyRecord::new(key.to_owned()));
            Ok(true)
        })?;
        Ok(key.to_owned())
    }

    /// Returns whether anything was removed.
    pub fn remove_key(&self, key: &str) -> Result<bool, KeyStoreError> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|record| record.key != key);
            Ok(records.len() != before)
        })
    }

    pub fn update_note(&self, key: &str, note: &str) -> Result<bool, KeyStoreError> {
        let note = normalize_note(note);
        self.mutate(|records| {
            Ok(match records.iter_mut().find(|record| record.key == key) {
                Some(record) if record.note != note => {
                    record.note = note;
                    true
                }
                _ => false,
            })
        })
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<bool, KeyStoreError> {
        self.mutate(|records| {
            Ok(match records.iter_mut().find(|record| record.key == key) {
                Some(record) if record.enabled != enabled => {
                    record.enabled = enabled;
                    true
                }
                _ => false,
            })
        })
    }

    fn read(&self) -> Result<String, KeyStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(KeyStoreError::ConfigNotFound),
            Err(err) => Err(err.into()),
        }
    }

    fn mutate<F>(&self, apply: F) -> Result<bool, KeyStoreError>
    where
        F: FnOnce(&mut Vec<KeyRecord>) -> Result<bool, KeyStoreError>,
    {
        let _guard = WRITE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let raw = self.read()?;
        let mut records = parse_entries(&raw);
        if !apply(&mut records)? {
            return Ok(false);
        }

        let updated = splice_block(&raw, &records);
        write_atomically(&self.path, &updated)?;
        tracing::debug!(path = %self.path.display(), keys = records.len(), "rewrote api-keys block");
        Ok(true)
    }
}

/// `sk-` followed by 32 random bytes in lowercase hex.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", hex::encode(bytes))
}

/// A key must survive a quoted single-line render and parse back unchanged.
fn is_valid_key(key: &str) -> bool {
    key.chars()
        .all(|c| !c.is_whitespace() && !c.is_control() && !matches!(c, '"' | '\'' | '#'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    start: usize,
    end: usize,
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

fn locate_block(lines: &[&str]) -> Option<BlockRange> {
    let start = lines.iter().position(|line| line.trim() == BLOCK_HEADER)?;

    let mut end = lines.len();
    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim();
        if is_indented(line) || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        end = idx;
        break;
    }

    // Trailing blank lines and plain comments belong to whatever follows.
    while end > start + 1 {
        let trimmed = lines[end - 1].trim();
        let loose = trimmed.is_empty()
            || (trimmed.starts_with('#') && parse_key_line(lines[end - 1]).is_none());
        if !loose {
            break;
        }
        end -= 1;
    }

    Some(BlockRange { start, end })
}

fn parse_entries(raw: &str) -> Vec<KeyRecord> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let Some(block) = locate_block(&lines) else {
        return Vec::new();
    };
    lines[block.start + 1..block.end]
        .iter()
        .filter_map(|line| parse_key_line(line))
        .collect()
}

fn parse_key_line(line: &str) -> Option<KeyRecord> {
    let trimmed = line.trim();
    let (commented_out, body) = match trimmed.strip_prefix('#') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };
    let body = body.strip_prefix('-')?.trim_start();
    if body.is_empty() {
        return None;
    }

    let (key, comment) = split_key_and_comment(body);
    if key.is_empty() {
        return None;
    }

    let disabled = commented_out || comment.to_ascii_lowercase().contains(DISABLED_MARKER);
    Some(KeyRecord {
        key: key.to_owned(),
        note: strip_disabled_marker(comment),
        enabled: !disabled,
    })
}

fn split_key_and_comment(body: &str) -> (&str, &str) {
    if let Some(quote) = body.chars().next().filter(|c| *c == '"' || *c == '\'')
        && let Some(close) = body[1..].find(quote)
    {
        let key = &body[1..1 + close];
        let rest = body[2 + close..].trim_start();
        let comment = rest.strip_prefix('#').unwrap_or("");
        return (key.trim(), comment.trim());
    }

    match body.split_once('#') {
        Some((key, comment)) => (unquote(key.trim()), comment.trim()),
        None => (unquote(body.trim()), ""),
    }
}

fn strip_disabled_marker(comment: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with the original.
    let lowered = comment.to_ascii_lowercase();
    let mut note = String::with_capacity(comment.len());
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(DISABLED_MARKER) {
        let at = cursor + found;
        note.push_str(&comment[cursor..at]);
        cursor = at + DISABLED_MARKER.len();
    }
    note.push_str(&comment[cursor..]);
    note.trim_matches(|c: char| c.is_whitespace() || c == '#')
        .to_owned()
}

// Single line, without anything the loader would read back as a marker.
fn normalize_note(note: &str) -> String {
    let mut note = collapse_whitespace(note);
    loop {
        let stripped = collapse_whitespace(&strip_disabled_marker(&note));
        if stripped == note {
            return note;
        }
        note = stripped;
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_line(record: &KeyRecord) -> String {
    let mut line = format!("  - \"{}\"", record.key);
    if !record.enabled {
        line.push_str(" # disabled");
    }
    if !record.note.is_empty() {
        line.push_str(" # ");
        line.push_str(&record.note);
    }
    line
}

// `line_end` is the part of the file's line terminator that precedes `\n`.
fn render_block(records: &[KeyRecord], line_end: &str) -> Vec<String> {
    std::iter::once(BLOCK_HEADER.to_owned())
        .chain(records.iter().map(render_line))
        .map(|line| format!("{line}{line_end}"))
        .collect()
}

fn splice_block(raw: &str, records: &[KeyRecord]) -> String {
    let line_end = if raw.contains("\r\n") { "\r" } else { "" };
    let mut lines: Vec<&str> = raw.split('\n').collect();
    let block = render_block(records, line_end);

    let spliced: Vec<String> = match locate_block(&lines) {
        Some(range) => lines[..range.start]
            .iter()
            .map(|line| (*line).to_owned())
            .chain(block)
            .chain(lines[range.end..].iter().map(|line| (*line).to_owned()))
            .collect(),
        None => {
            if lines.last().is_some_and(|line| line.is_empty()) {
                lines.pop();
            }
            let mut out: Vec<String> = lines.iter().map(|line| (*line).to_owned()).collect();
            if out.last().is_some_and(|line| !line.trim().is_empty()) {
                out.push(line_end.to_owned());
            }
            out.extend(block);
            out.push(String::new());
            out
        }
    };

    spliced.join("\n")
}

fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), metadata.permissions())?;
    }
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

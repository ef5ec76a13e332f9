//! Disk-backed store of response snapshots, partitioned into named generations
//!
//! Each generation is a directory under the store root. Each entry is a JSON file
//! named by the SHA-256 digest of its request key, so a lookup reads exactly one
//! file. Writes land in a uniquely named temporary file that is then renamed over
//! the entry, which makes every replace atomic: a reader sees either the old
//! snapshot or the new one, never a mix of two writers.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::request::{RequestKey, Response};

/// File written into a generation once its install has fully completed
const MARKER_FILE: &str = "generation.json";

/// Sequence for temporary file names within this process
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors surfaced by the cache store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Local storage could not be created, written, or removed
    #[error("cache store unavailable: {0}")]
    Unavailable(#[from] io::Error),

    /// An entry or marker could not be encoded
    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// Generation labels must be non-empty
    #[error("generation label must not be empty")]
    EmptyLabel,
}

/// On-disk form of a cached response
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    /// Canonical request key, checked on read
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    /// Base64-encoded body bytes
    body: String,
    stored_at: DateTime<Utc>,
}

/// A response snapshot read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    /// HTTP status code (always 2xx)
    pub status: u16,
    /// Headers in received order
    pub headers: Vec<(String, String)>,
    /// Body bytes
    pub body: Bytes,
    /// When the snapshot was written; informational only
    pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
    /// Replays the snapshot as a response
    pub fn into_response(self) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Install-complete record kept inside a generation directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMarker {
    /// Generation label
    pub label: String,
    /// When the install finished
    pub installed_at: DateTime<Utc>,
    /// When the generation last became active; `None` while it has only been installed
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

/// Addresses one generation of the store
///
/// Obtained from [`CacheStore::open`]; every read and write names its generation
/// through a handle rather than an ambient "current" partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationHandle {
    label: String,
    dir: PathBuf,
}

impl GenerationHandle {
    /// The generation label
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Durable, keyed storage of response snapshots
#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Directory holding one subdirectory per generation
    root: PathBuf,
}

impl CacheStore {
    /// Creates a store in the XDG-compliant cache directory
    ///
    /// Uses `~/.cache/shellcache/` on Linux. Returns `None` if no home directory
    /// can be determined.
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "shellcache")?;
        Some(Self::with_dir(project_dirs.cache_dir().to_path_buf()))
    }

    /// Creates a store rooted at a specific directory
    pub fn with_dir(root: PathBuf) -> Self {
        Self { root }
    }

    /// The store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn handle(&self, label: &str) -> GenerationHandle {
        GenerationHandle {
            label: label.to_string(),
            dir: self.root.join(encode_label(label)),
        }
    }

    /// Opens a generation, creating it if absent
    ///
    /// Idempotent. Fails only when local storage cannot hold the generation.
    pub fn open(&self, label: &str) -> Result<GenerationHandle, StoreError> {
        if label.is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        let handle = self.handle(label);
        fs::create_dir_all(&handle.dir)?;
        Ok(handle)
    }

    /// Reads the snapshot stored for a key
    ///
    /// Missing, unreadable, or corrupt entries are all reported as a miss.
    pub fn lookup(&self, handle: &GenerationHandle, key: &RequestKey) -> Option<CachedEntry> {
        let content = fs::read(entry_path(handle, key)).ok()?;
        let stored: StoredEntry = serde_json::from_slice(&content).ok()?;
        if stored.key != key.as_str() {
            return None;
        }
        let body = BASE64.decode(stored.body).ok()?;

        Some(CachedEntry {
            status: stored.status,
            headers: stored.headers,
            body: Bytes::from(body),
            stored_at: stored.stored_at,
        })
    }

    /// Stores a response under a key, replacing any previous snapshot
    ///
    /// Non-2xx responses are declined and `Ok(false)` is returned; declining is
    /// not a failure. The generation directory is recreated if it was purged;
    /// strategy writes go through the lifecycle write gate so only the active
    /// generation is ever recreated this way.
    pub fn put(
        &self,
        handle: &GenerationHandle,
        key: &RequestKey,
        response: &Response,
    ) -> Result<bool, StoreError> {
        if !response.is_success() {
            debug!(
                generation = handle.label(),
                key = %key,
                status = response.status,
                "declining to cache non-success response"
            );
            return Ok(false);
        }

        let stored = StoredEntry {
            key: key.as_str().to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
            stored_at: Utc::now(),
        };
        let json = serde_json::to_vec(&stored)?;

        fs::create_dir_all(&handle.dir)?;
        write_atomic(&handle.dir, &format!("{}.json", key.digest()), &json)?;
        Ok(true)
    }

    /// Lists the labels of every generation held by the store
    pub fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut labels = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(label) = entry.file_name().to_str().and_then(decode_label) {
                labels.insert(label);
            }
        }
        Ok(labels)
    }

    /// Removes a generation and all its entries
    ///
    /// Deleting an absent generation is a no-op.
    pub fn delete(&self, label: &str) -> Result<(), StoreError> {
        if label.is_empty() {
            return Ok(());
        }
        match fs::remove_dir_all(self.handle(label).dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records that a generation finished installing
    pub fn mark_installed(&self, handle: &GenerationHandle) -> Result<GenerationMarker, StoreError> {
        let marker = GenerationMarker {
            label: handle.label.clone(),
            installed_at: Utc::now(),
            activated_at: None,
        };
        fs::create_dir_all(&handle.dir)?;
        self.write_marker(handle, &marker)?;
        Ok(marker)
    }

    /// Records that an installed generation became active
    ///
    /// Returns `Ok(None)` without writing when the generation has no install
    /// marker, so a purged generation is never turned back into a resumable one.
    pub fn mark_activated(
        &self,
        handle: &GenerationHandle,
    ) -> Result<Option<GenerationMarker>, StoreError> {
        let Some(mut marker) = self.installed_marker(handle.label()) else {
            return Ok(None);
        };
        marker.activated_at = Some(Utc::now());
        self.write_marker(handle, &marker)?;
        Ok(Some(marker))
    }

    fn write_marker(&self, handle: &GenerationHandle, marker: &GenerationMarker) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(marker)?;
        write_atomic(&handle.dir, MARKER_FILE, &json)?;
        Ok(())
    }

    /// Reads the install-complete marker of a generation, if present
    pub fn installed_marker(&self, label: &str) -> Option<GenerationMarker> {
        if label.is_empty() {
            return None;
        }
        let content = fs::read(self.handle(label).dir.join(MARKER_FILE)).ok()?;
        let marker: GenerationMarker = serde_json::from_slice(&content).ok()?;
        (marker.label == label).then_some(marker)
    }
}

fn entry_path(handle: &GenerationHandle, key: &RequestKey) -> PathBuf {
    handle.dir.join(format!("{}.json", key.digest()))
}

/// Writes `bytes` to `dir/name` through a temp file and rename
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp = dir.join(format!(".{}.{}.{}.tmp", name, std::process::id(), seq));
    fs::write(&temp, bytes)?;
    if let Err(e) = fs::rename(&temp, dir.join(name)) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Maps an opaque label to a safe directory name
///
/// ASCII alphanumerics and `-` pass through, as does `.` except in first
/// position. Every other byte becomes `_` followed by two hex digits.
fn encode_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for (i, byte) in label.bytes().enumerate() {
        let c = byte as char;
        if c.is_ascii_alphanumeric() || c == '-' || (c == '.' && i > 0) {
            out.push(c);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

fn decode_label(name: &str) -> Option<String> {
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

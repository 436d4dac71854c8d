//! 原始数据存储：每次报告运行一个目录
//!
//! Checks save raw command output here by name. The directory is enumerated
//! by the archive step and removed when the run ends.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::utils::{DiagError, Result};

// ── 数据结构 ────────────────────────────────────────────────────────────────

pub struct ArtifactStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: SystemTime,
    pub is_dir: bool,
}

/// Handle to one saved blob, produced by [`ArtifactStore::items`].
#[derive(Debug, Clone)]
pub struct StoreItem {
    path: PathBuf,
    info: ItemInfo,
}

/// Open blob stream. The underlying file is released when this is dropped.
pub struct ItemReader {
    file: File,
}

// ── ArtifactStore ───────────────────────────────────────────────────────────

impl ArtifactStore {
    /// Creates (or reuses) the raw-data directory for one run.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            DiagError::Store(format!("cannot create {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Streams `content` into the blob `name`; an existing blob is replaced.
    pub fn save(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        let path = self.blob_path(name)?;
        let mut file = File::create(&path).map_err(|e| {
            DiagError::Store(format!("cannot create {}: {}", path.display(), e))
        })?;
        let n = io::copy(content, &mut file)
            .map_err(|e| DiagError::Store(format!("cannot write {}: {}", name, e)))?;
        debug!(name, bytes = n, "artifact saved");
        Ok(())
    }

    pub fn save_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut reader = bytes;
        self.save(name, &mut reader)
    }

    /// Current blobs sorted by name; directories are skipped.
    pub fn items(&self) -> Result<Vec<StoreItem>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            DiagError::Store(format!("cannot list {}: {}", self.root.display(), e))
        })?;

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                continue;
            }
            items.push(StoreItem {
                path: entry.path(),
                info: item_info(&entry.file_name().to_string_lossy(), &metadata),
            });
        }
        items.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        Ok(items)
    }

    /// Removes every blob of this run. Calling it again is a no-op.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiagError::Store(format!(
                "cannot remove {}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(DiagError::Store(format!("invalid artifact name: {:?}", name)));
        }
        Ok(self.root.join(name))
    }
}

/// 把路径转成平面的 artifact 名：/etc/docker/daemon.json → etc_docker_daemon.json
pub fn artifact_name(path: &str) -> String {
    path.trim_start_matches('/').replace(['/', '\\'], "_")
}

// ── StoreItem ───────────────────────────────────────────────────────────────

impl StoreItem {
    pub fn info(&self) -> &ItemInfo {
        &self.info
    }

    pub fn open(&self) -> Result<ItemReader> {
        let file = File::open(&self.path).map_err(|e| {
            DiagError::Store(format!("cannot open {}: {}", self.info.name, e))
        })?;
        Ok(ItemReader { file })
    }
}

impl Read for ItemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

fn item_info(name: &str, metadata: &fs::Metadata) -> ItemInfo {
    use std::os::unix::fs::MetadataExt;

    ItemInfo {
        name: name.to_string(),
        size: metadata.len(),
        mode: metadata.mode(),
        mod_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: metadata.is_dir(),
    }
}

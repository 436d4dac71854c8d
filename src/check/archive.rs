//! 打包：把 ArtifactStore 的内容写成一个 tar.gz

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::check::store::ArtifactStore;
use crate::utils::{DiagError, Result};

/// Packages a store into one bundle named after the report.
pub trait Archiver {
    fn archive(&self, bundle_name: &str, store: &ArtifactStore) -> Result<()>;
}

/// Writes `<out_dir>/<bundle>.tar.gz`, every entry under `<bundle>/`.
pub struct TarGzArchiver {
    out_dir: PathBuf,
}

impl TarGzArchiver {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    pub fn bundle_path(&self, bundle_name: &str) -> PathBuf {
        self.out_dir.join(format!("{}.tar.gz", bundle_name))
    }
}

impl Archiver for TarGzArchiver {
    fn archive(&self, bundle_name: &str, store: &ArtifactStore) -> Result<()> {
        let path = self.bundle_path(bundle_name);
        let file = File::create(&path).map_err(|e| {
            DiagError::Archive(format!("cannot create {}: {}", path.display(), e))
        })?;

        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let items = store.items()?;

        for item in &items {
            let meta = item.info();
            let entry_path = Path::new(bundle_name).join(&meta.name);

            let mut header = tar::Header::new_gnu();
            header.set_size(meta.size);
            header.set_mode(meta.mode & 0o7777);
            header.set_mtime(
                meta.mod_time
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            );

            // 每个 item 读完即释放，再处理下一个
            let mut reader = item.open()?;
            builder
                .append_data(&mut header, &entry_path, &mut reader)
                .map_err(|e| DiagError::Archive(format!("{}: {}", meta.name, e)))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| DiagError::Archive(format!("finishing tar: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| DiagError::Archive(format!("finishing gzip: {}", e)))?;

        info!(path = %path.display(), entries = items.len(), "archive written");
        Ok(())
    }
}

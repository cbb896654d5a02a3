use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;
use uuid::Uuid;

/// Owner of uploaded bytes. The room registry only ever asks it to forget
/// a blob; reading and writing happen in the HTTP handlers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Deletes the blob behind `handle`. A blob that is already gone is
    /// not an error.
    async fn delete(&self, handle: &str) -> io::Result<()>;
}

/// Blobs as flat files in one directory, named by their handle.
#[derive(Debug)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(DiskBlobStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates an empty blob and returns its handle with the open file.
    /// The handle keeps a sanitized copy of `extension`.
    pub async fn create(&self, extension: Option<&str>) -> io::Result<(String, fs::File)> {
        let mut handle = Uuid::new_v4().simple().to_string();
        if let Some(ext) = extension.map(sanitize_extension).filter(|ext| !ext.is_empty()) {
            handle.push('.');
            handle.push_str(&ext);
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(&handle)?)
            .await?;
        Ok((handle, file))
    }

    pub async fn open(&self, handle: &str) -> io::Result<fs::File> {
        fs::File::open(self.path(handle)?).await
    }

    /// Removes every blob left behind by an earlier process. Rooms live
    /// in memory only, so nothing on disk can be referenced at startup.
    pub async fn purge(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Purged {} orphaned blob(s) from {}", removed, self.root.display());
        }
        Ok(removed)
    }

    fn path(&self, handle: &str) -> io::Result<PathBuf> {
        let safe = !handle.is_empty()
            && !handle.starts_with('.')
            && handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !safe {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob handle {handle:?}"),
            ));
        }
        Ok(self.root.join(handle))
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn delete(&self, handle: &str) -> io::Result<()> {
        match fs::remove_file(self.path(handle)?).await {
            Ok(()) => {
                debug!("Deleted blob {}", handle);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn sanitize_extension(ext: &str) -> String {
    ext.chars()
        .filter(char::is_ascii_alphanumeric)
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase()
}

//! Object storage for downloaded documents.
//!
//! Objects are keyed by their identity, not their content:
//! `{protocol}/{document_id}.{ext}`, with the protocol's `/` and `.`
//! replaced by `-`. Integrity is checked through the SHA-256 hash recorded
//! on the document reference.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use seisync_core::{defaults, Error, Result, StoredObject};

/// Storage backend trait for pluggable object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write data under the given key, replacing any previous object.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read the object stored under the key.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete the object; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists under the key.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Filesystem storage backend rooted at a base directory.
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base directory.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(Error::InvalidInput(format!("invalid storage key: {}", key)));
        }
        Ok(self.base_path.join(relative))
    }

    /// Check that the base directory is writable, readable and deletable.
    ///
    /// Run once at startup so a misconfigured `STORAGE_PATH` fails the run
    /// before any document is claimed.
    pub async fn validate(&self) -> Result<()> {
        let sentinel = ".health-check/sentinel.bin";
        let data = b"storage-health-check";

        self.put(sentinel, data).await?;
        let read_back = self.get(sentinel).await?;
        if read_back != data {
            return Err(Error::Storage("read-back mismatch".to_string()));
        }
        self.delete(sentinel).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;
        debug!(storage_key = %key, full_path = %full_path.display(), size = data.len(), "object_storage: put");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "object_storage: create_dir_all failed");
                e
            })?;
        }

        // Temp file + rename so readers never observe a partial object.
        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "object_storage: File::create failed");
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "object_storage: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        if fs::try_exists(&full_path).await? {
            fs::remove_file(full_path).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key)?;
        Ok(fs::try_exists(full_path).await?)
    }
}

/// SHA-256 of the data as lowercase hex.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Storage key of a document: `{protocol}/{document_id}.{ext}`.
///
/// `00002.006238/2025-95`, `123`, `pdf` → `00002-006238-2025-95/123.pdf`
///
/// Both parts are reduced to `[A-Za-z0-9_-]`, so API-supplied values can
/// never name a path outside the storage root.
pub fn document_key(protocol: &str, document_id: &str, extension: &str) -> String {
    format!(
        "{}/{}.{}",
        key_segment(protocol),
        key_segment(document_id),
        extension
    )
}

fn key_segment(raw: &str) -> String {
    let segment: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

/// Pick the object extension: the served file name first, then the
/// sniffed content type, then [`defaults::FALLBACK_EXTENSION`].
pub fn detect_extension(filename: Option<&str>, data: &[u8]) -> String {
    let from_name = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase());

    from_name
        .or_else(|| infer::get(data).map(|kind| kind.extension().to_string()))
        .unwrap_or_else(|| defaults::FALLBACK_EXTENSION.to_string())
}

/// Hash and store a document's bytes under its derived key.
pub async fn store_document(
    backend: &dyn StorageBackend,
    protocol: &str,
    document_id: &str,
    filename: Option<&str>,
    content_type: Option<String>,
    data: &[u8],
) -> Result<StoredObject> {
    let extension = detect_extension(filename, data);
    let storage_key = document_key(protocol, document_id, &extension);
    let content_hash = compute_content_hash(data);

    backend.put(&storage_key, data).await?;

    let content_type = content_type.or_else(|| infer::get(data).map(|k| k.mime_type().to_string()));
    Ok(StoredObject {
        storage_key,
        content_hash,
        size_bytes: data.len() as i64,
        content_type,
    })
}

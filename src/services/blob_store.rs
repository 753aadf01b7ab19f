//! src/services/blob_store.rs
//!
//! Blob storage for project archives. The registry only sees the [`BlobStore`]
//! trait; [`LocalBlobStore`] keeps payloads as flat files beneath a configured
//! root directory (`root/{key}`).
//!
//! Writes happen in two steps: the payload is streamed into a staging area
//! (`stage`), then published under a key (`publish`). Publishing never
//! replaces an existing key, and a staged payload can be offered under
//! several keys until one is free.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Readable handle to a stored payload.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Payload chunks as they arrive from a client.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A fully received, durably written payload that has no key yet.
#[derive(Debug)]
pub struct StagedBlob {
    /// Backend-specific handle (a temp file name for [`LocalBlobStore`]).
    pub handle: String,
    pub size: u64,
}

/// A storage location for archive payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Tag recorded on each project row (e.g. "local").
    fn storage_class(&self) -> &str;

    /// Consume `chunks` into durable staging storage.
    ///
    /// On error nothing is left behind.
    async fn stage(&self, chunks: ByteStream) -> BlobResult<StagedBlob>;

    /// Make a staged payload visible under `key`.
    ///
    /// Fails with `AlreadyExists` if the key is taken; the staged payload is
    /// then still available for another key.
    async fn publish(&self, staged: &StagedBlob, key: &str) -> BlobResult<()>;

    /// Release a staged payload. Published copies are unaffected.
    async fn discard(&self, staged: StagedBlob);

    /// Read the whole payload stored under `key`.
    async fn read(&self, key: &str) -> BlobResult<Bytes>;

    /// Open the payload stored under `key` for streaming.
    async fn open(&self, key: &str) -> BlobResult<BlobReader>;

    /// Remove the payload stored under `key`.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Verify the location is writable and readable.
    async fn health_check(&self) -> BlobResult<()>;

    /// Store `bytes` under `key` in one call. Fails with `AlreadyExists` if the key is taken.
    async fn write(&self, key: &str, bytes: &[u8]) -> BlobResult<()> {
        let chunk = Bytes::copy_from_slice(bytes);
        let staged = self.stage(Box::pin(stream::once(async move { Ok::<_, io::Error>(chunk) }))).await?;
        let published = self.publish(&staged, key).await;
        self.discard(staged).await;
        published
    }
}

const MAX_BLOB_KEY_LEN: usize = 255;
const STAGING_PREFIX: &str = ".tmp-";

/// Payloads stored as files directly under `root`.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    storage_class: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, storage_class: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            storage_class: storage_class.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are single path components: no separators, no `..`, no control bytes.
    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        if key.is_empty()
            || key.len() > MAX_BLOB_KEY_LEN
            || key.starts_with('.')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
        {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn staged_path(&self, staged: &StagedBlob) -> BlobResult<PathBuf> {
        if !staged.handle.starts_with(STAGING_PREFIX) || staged.handle.contains('/') {
            return Err(BlobError::InvalidKey(staged.handle.clone()));
        }
        Ok(self.root.join(&staged.handle))
    }

    fn map_not_found(key: &str, err: io::Error) -> BlobError {
        if err.kind() == ErrorKind::NotFound {
            BlobError::NotFound(key.to_string())
        } else {
            BlobError::Io(err)
        }
    }

    async fn copy_to(&self, tmp_path: &Path, mut chunks: ByteStream) -> io::Result<u64> {
        let mut file = File::create(tmp_path).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn storage_class(&self) -> &str {
        &self.storage_class
    }

    /// Stream chunks into a temp file under the root and fsync it.
    async fn stage(&self, chunks: ByteStream) -> BlobResult<StagedBlob> {
        fs::create_dir_all(&self.root).await?;
        let handle = format!("{}{}", STAGING_PREFIX, Uuid::new_v4());
        let tmp_path = self.root.join(&handle);

        match self.copy_to(&tmp_path, chunks).await {
            Ok(size) => {
                debug!(%handle, size, "staged blob");
                Ok(StagedBlob { handle, size })
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(BlobError::Io(err))
            }
        }
    }

    /// Hard-link the staged file into place.
    ///
    /// Linking fails when the destination exists, so a concurrent writer that
    /// drew the same key can never overwrite a payload that is already stored.
    async fn publish(&self, staged: &StagedBlob, key: &str) -> BlobResult<()> {
        let file_path = self.blob_path(key)?;
        let tmp_path = self.staged_path(staged)?;
        match fs::hard_link(&tmp_path, &file_path).await {
            Ok(()) => {
                debug!(key, size = staged.size, "stored blob at {}", file_path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(BlobError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn discard(&self, staged: StagedBlob) {
        let Ok(tmp_path) = self.staged_path(&staged) else {
            return;
        };
        if let Err(err) = fs::remove_file(&tmp_path).await {
            debug!("failed to remove temp file {}: {}", tmp_path.display(), err);
        }
    }

    async fn read(&self, key: &str) -> BlobResult<Bytes> {
        let file_path = self.blob_path(key)?;
        fs::read(&file_path)
            .await
            .map(Bytes::from)
            .map_err(|err| Self::map_not_found(key, err))
    }

    async fn open(&self, key: &str) -> BlobResult<BlobReader> {
        let file_path = self.blob_path(key)?;
        let file = File::open(&file_path)
            .await
            .map_err(|err| Self::map_not_found(key, err))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let file_path = self.blob_path(key)?;
        fs::remove_file(&file_path)
            .await
            .map_err(|err| Self::map_not_found(key, err))?;
        debug!("removed blob {}", file_path.display());
        Ok(())
    }

    /// Best-effort write/read/delete of a probe file under the root.
    async fn health_check(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(BlobError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn store() -> (LocalBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalBlobStore::new(dir.path().join("blobs"), "local"), dir)
    }

    fn chunked(parts: &[&'static str]) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut entries = fs::read_dir(dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn write_then_read_returns_identical_bytes() {
        let (blobs, _dir) = store();
        let payload = b"PK\x03\x04\x14\x00\x00\x00\x08\x00";
        blobs.write("abc.zip", payload).await.unwrap();

        let read = blobs.read("abc.zip").await.unwrap();
        assert_eq!(&read[..], payload);

        let mut reader = blobs.open("abc.zip").await.unwrap();
        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, payload);
    }

    #[tokio::test]
    async fn staged_chunks_are_concatenated_in_order() {
        let (blobs, _dir) = store();
        let staged = blobs
            .stage(chunked(&["PK\x03\x04", "", "middle", "-end"]))
            .await
            .unwrap();
        assert_eq!(staged.size, 14);

        blobs.publish(&staged, "chunks.zip").await.unwrap();
        blobs.discard(staged).await;
        assert_eq!(&blobs.read("chunks.zip").await.unwrap()[..], b"PK\x03\x04middle-end");
        assert_eq!(file_names(blobs.root()).await, vec!["chunks.zip".to_string()]);
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_staged() {
        let (blobs, _dir) = store();
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"PK")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ];
        let err = blobs.stage(Box::pin(stream::iter(chunks))).await.unwrap_err();
        assert!(matches!(err, BlobError::Io(ref e) if e.kind() == ErrorKind::ConnectionReset));
        assert!(file_names(blobs.root()).await.is_empty());
    }

    #[tokio::test]
    async fn staged_payload_survives_a_taken_key() {
        let (blobs, _dir) = store();
        blobs.write("taken.zip", b"first").await.unwrap();

        let staged = blobs.stage(chunked(&["second"])).await.unwrap();
        let err = blobs.publish(&staged, "taken.zip").await.unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(ref k) if k == "taken.zip"));

        blobs.publish(&staged, "free.zip").await.unwrap();
        blobs.discard(staged).await;
        assert_eq!(&blobs.read("taken.zip").await.unwrap()[..], b"first");
        assert_eq!(&blobs.read("free.zip").await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn write_never_replaces_an_existing_key() {
        let (blobs, _dir) = store();
        blobs.write("taken.zip", b"first").await.unwrap();

        let err = blobs.write("taken.zip", b"second").await.unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(ref k) if k == "taken.zip"));
        assert_eq!(&blobs.read("taken.zip").await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files_behind() {
        let (blobs, _dir) = store();
        blobs.write("one.zip", b"1").await.unwrap();
        let _ = blobs.write("one.zip", b"2").await;

        assert_eq!(file_names(blobs.root()).await, vec!["one.zip".to_string()]);
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (blobs, _dir) = store();
        for key in ["", "../escape.zip", "a/b.zip", "a\\b.zip", ".hidden", "nul\0.zip"] {
            let err = blobs.write(key, b"x").await.unwrap_err();
            assert!(matches!(err, BlobError::InvalidKey(_)), "accepted {key:?}");
        }
    }

    #[tokio::test]
    async fn missing_blobs_report_not_found() {
        let (blobs, _dir) = store();
        assert!(matches!(
            blobs.read("missing.zip").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            blobs.open("missing.zip").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            blobs.delete("missing.zip").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_payload() {
        let (blobs, _dir) = store();
        blobs.write("gone.zip", b"bye").await.unwrap();
        blobs.delete("gone.zip").await.unwrap();
        assert!(matches!(
            blobs.read("gone.zip").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_check_passes_on_writable_root() {
        let (blobs, _dir) = store();
        blobs.health_check().await.unwrap();
        assert_eq!(blobs.storage_class(), "local");
    }
}

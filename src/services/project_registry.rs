//! src/services/project_registry.rs
//!
//! ProjectRegistry — maps an identifier to a stored archive and the row that
//! records it. `create` publishes the blob first and the row second; a row always
//! implies its blob. The two writes are not transactional across resources, so
//! a failed insert triggers a best-effort delete of the blob it just wrote.

use crate::{
    models::project::{NewProject, Project, storage_key_for},
    services::{
        blob_store::{BlobError, BlobReader, BlobStore, ByteStream, StagedBlob},
        identifier,
        project_store::{ProjectStore, StoreError},
    },
};
use bytes::Bytes;
use futures::stream;
use std::{io, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default upper bound on identifier draws per `create` call.
pub const DEFAULT_MAX_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to store archive: {0}")]
    StorageWrite(#[source] BlobError),
    #[error("failed to read archive: {0}")]
    StorageRead(#[source] BlobError),
    #[error("identifier `{0}` was taken concurrently; retry the upload")]
    DuplicateIdentifier(String),
    #[error("failed to persist project: {0}")]
    Persistence(#[source] StoreError),
    #[error("no free identifier found after {attempts} attempts")]
    IdentifierExhausted { attempts: usize },
    #[error("project `{0}` not found")]
    NotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

type IdentifierSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Creates and looks up projects.
///
/// The row store and blob store are injected, so the registry holds no
/// global state and can be shared freely between request handlers.
#[derive(Clone)]
pub struct ProjectRegistry {
    store: Arc<dyn ProjectStore>,
    blobs: Arc<dyn BlobStore>,
    max_attempts: usize,
    next_identifier: IdentifierSource,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn ProjectStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_identifier: Arc::new(identifier::generate),
        }
    }

    /// Bound the number of identifier draws per `create` (at least one).
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Replace the identifier generator.
    pub fn with_identifier_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.next_identifier = Arc::new(source);
        self
    }

    pub fn storage_class(&self) -> &str {
        self.blobs.storage_class()
    }

    /// Store `payload` under a fresh identifier and record it.
    pub async fn create(&self, payload: &[u8]) -> RegistryResult<Project> {
        let chunk = Bytes::copy_from_slice(payload);
        self.create_from_stream(Box::pin(stream::once(async move {
            Ok::<_, io::Error>(chunk)
        })))
        .await
    }

    /// Store a streamed payload under a fresh identifier and record it.
    ///
    /// The payload is staged once. Identifiers already present in the store,
    /// or whose blob key is already taken, are redrawn and the staged payload
    /// is offered again. Once the blob is published the row is inserted and
    /// committed; if that fails the blob is deleted again (best effort) and
    /// the error is returned.
    pub async fn create_from_stream(&self, chunks: ByteStream) -> RegistryResult<Project> {
        let start = Instant::now();
        let staged = self
            .blobs
            .stage(chunks)
            .await
            .map_err(RegistryError::StorageWrite)?;

        let result = self.publish_and_record(&staged, start).await;
        self.blobs.discard(staged).await;
        result
    }

    async fn publish_and_record(
        &self,
        staged: &StagedBlob,
        start: Instant,
    ) -> RegistryResult<Project> {
        let storage_class = self.blobs.storage_class().to_string();

        for attempt in 1..=self.max_attempts {
            let identifier = (self.next_identifier)();

            if self
                .store
                .find_by_identifier(&identifier)
                .await
                .map_err(RegistryError::Persistence)?
                .is_some()
            {
                debug!(attempt, %identifier, "identifier already in use, redrawing");
                continue;
            }

            let storage_key = storage_key_for(&identifier);
            match self.blobs.publish(staged, &storage_key).await {
                Ok(()) => {}
                Err(BlobError::AlreadyExists(key)) => {
                    debug!(attempt, %identifier, %key, "blob key already taken, redrawing");
                    continue;
                }
                Err(err) => return Err(RegistryError::StorageWrite(err)),
            }

            // Stamped here so the row records insertion time, not upload start.
            let new_project = NewProject::new(&identifier, &storage_class);
            return match self.store.insert(new_project).await {
                Ok(project) => {
                    debug!(
                        identifier = %project.identifier,
                        storage_class = %storage_class,
                        storage_key = %storage_key,
                        size = staged.size,
                        "Created new project in {:?}",
                        start.elapsed()
                    );
                    Ok(project)
                }
                Err(err) => {
                    self.discard_blob(&storage_key).await;
                    match err {
                        StoreError::Duplicate(identifier) => {
                            Err(RegistryError::DuplicateIdentifier(identifier))
                        }
                        other => Err(RegistryError::Persistence(other)),
                    }
                }
            };
        }

        Err(RegistryError::IdentifierExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Look up a project by identifier.
    ///
    /// Malformed identifiers cannot exist in the store and return `None`
    /// without a query.
    pub async fn get(&self, identifier: &str) -> RegistryResult<Option<Project>> {
        if !identifier::is_well_formed(identifier) {
            return Ok(None);
        }
        let start = Instant::now();
        let project = self
            .store
            .find_by_identifier(identifier)
            .await
            .map_err(RegistryError::Persistence)?;
        debug!(
            %identifier,
            found = project.is_some(),
            "Got project in {:?}",
            start.elapsed()
        );
        Ok(project)
    }

    /// Look up a project and open its archive for reading.
    pub async fn open_archive(&self, identifier: &str) -> RegistryResult<(Project, BlobReader)> {
        let project = self
            .get(identifier)
            .await?
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;

        let Some(key) = project.storage_key.as_deref() else {
            return Err(RegistryError::NotFound(identifier.to_string()));
        };
        let reader = self.blobs.open(key).await.map_err(|err| match err {
            BlobError::NotFound(_) => RegistryError::NotFound(identifier.to_string()),
            other => RegistryError::StorageRead(other),
        })?;
        Ok((project, reader))
    }

    pub async fn count(&self) -> RegistryResult<i64> {
        self.store.count().await.map_err(RegistryError::Persistence)
    }

    pub fn store(&self) -> &dyn ProjectStore {
        self.store.as_ref()
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    /// Compensating delete after a failed insert.
    async fn discard_blob(&self, key: &str) {
        match self.blobs.delete(key).await {
            Ok(()) => debug!(%key, "removed blob after failed insert"),
            Err(BlobError::NotFound(_)) => {}
            Err(err) => warn!(%key, error = %err, "orphaned blob left behind after failed insert"),
        }
    }
}

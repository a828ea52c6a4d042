use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("failed to write artifact {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact name {0:?} is not a plain file name")]
    InvalidName(String),
}

/// Where a persisted artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicReference {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    pub job_id: String,
    pub file_name: String,
    pub content_type: String,
}

/// Persists raw artifact bytes and returns a public reference for the job
/// record. References that are already public never pass through here.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn persist(
        &self,
        bytes: &[u8],
        meta: &ArtifactMeta,
    ) -> Result<PublicReference, ArtifactStoreError>;
}

/// Writes artifacts under `<root>/<job_id>/<file_name>` and advertises
/// them below a configured public base URL.
pub struct DiskArtifactStore {
    root: PathBuf,
    public_base: Url,
}

impl DiskArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base: Url) -> Self {
        Self {
            root: root.into(),
            public_base,
        }
    }

    fn validate_name(name: &str) -> Result<(), ArtifactStoreError> {
        let plain = !name.is_empty()
            && !name.contains('/')
            && !name.contains('\\')
            && name != "."
            && name != "..";
        if plain {
            Ok(())
        } else {
            Err(ArtifactStoreError::InvalidName(name.to_string()))
        }
    }
}

#[async_trait]
impl ArtifactStore for DiskArtifactStore {
    async fn persist(
        &self,
        bytes: &[u8],
        meta: &ArtifactMeta,
    ) -> Result<PublicReference, ArtifactStoreError> {
        Self::validate_name(&meta.job_id)?;
        Self::validate_name(&meta.file_name)?;

        let dir = self.root.join(&meta.job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactStoreError::Io {
                name: meta.file_name.clone(),
                source,
            })?;
        let path = dir.join(&meta.file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| ArtifactStoreError::Io {
                name: meta.file_name.clone(),
                source,
            })?;

        let mut url = self.public_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&meta.job_id)
                .push(&meta.file_name);
        }
        info!(
            job_id = meta.job_id,
            file = meta.file_name,
            size = bytes.len(),
            "artifact persisted"
        );
        Ok(PublicReference {
            url: url.to_string(),
        })
    }
}

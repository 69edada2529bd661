//! Publishing the stats snapshot.
//!
//! ## Sinks
//!
//! - [`FilesystemSink`] - writes a temp file and renames it into place
//! - `GcsSink` (feature: gcs) - one upload request per snapshot
//!
//! Both replace the destination object whole or leave it untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::{SinkConfig, SinkTarget};
use crate::context::RunContext;
use crate::error::{JobError, SinkError};
use crate::summary::Snapshot;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub cache_control: String,
}

/// Destination for the published snapshot.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Replace `object` with `bytes`. Readers must see either the previous
    /// object or the complete new one.
    async fn atomic_write(
        &self,
        object: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), SinkError>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

pub struct SnapshotPublisher<'a> {
    sink: &'a dyn SnapshotSink,
    object: String,
    cache_control: String,
}

impl<'a> SnapshotPublisher<'a> {
    pub fn new(sink: &'a dyn SnapshotSink, config: &SinkConfig) -> Self {
        Self {
            sink,
            object: config.object.clone(),
            cache_control: config.cache_control.clone(),
        }
    }

    /// Serialize and publish. Nothing is written if serialization fails.
    pub async fn publish(&self, ctx: &RunContext, snapshot: &Snapshot) -> Result<usize, JobError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let size = bytes.len();
        let metadata = ObjectMetadata {
            content_type: JSON_CONTENT_TYPE.to_string(),
            cache_control: self.cache_control.clone(),
        };

        ctx.bound(
            "write snapshot",
            self.sink.atomic_write(&self.object, bytes, &metadata),
        )
        .await?
        .map_err(|source| JobError::Publish {
            object: self.object.clone(),
            source,
        })?;

        tracing::info!(
            "published {} ({} bytes) via {}",
            self.object,
            size,
            self.sink.sink_type()
        );
        Ok(size)
    }
}

/// Snapshot files in a local directory.
///
/// Object names may contain `/`; intermediate directories are created on write.
pub struct FilesystemSink {
    base_path: PathBuf,
}

impl FilesystemSink {
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn path_for(&self, object: &str) -> PathBuf {
        self.base_path.join(object)
    }
}

/// Temp file that is removed on drop unless committed.
///
/// Covers early returns and a write future dropped on cancel or timeout.
struct StagedFile {
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "failed to remove temp file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl SnapshotSink for FilesystemSink {
    async fn atomic_write(
        &self,
        object: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), SinkError> {
        let path = self.path_for(object);
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(SinkError::Backend(format!("invalid object name {:?}", object)));
        };
        fs::create_dir_all(parent).await?;

        // same directory as the target so the rename never crosses filesystems
        let mut staged = StagedFile::new(parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            std::process::id()
        )));

        let mut file = fs::File::create(&staged.path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staged.path, &path).await?;
        staged.commit();

        // local files carry no http metadata
        tracing::debug!(
            "wrote {} ({}, {})",
            path.display(),
            metadata.content_type,
            metadata.cache_control
        );
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(feature = "gcs")]
pub use gcs::GcsSink;

#[cfg(feature = "gcs")]
mod gcs {
    use async_trait::async_trait;
    use google_cloud_storage::client::{Client, ClientConfig};
    use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
    use google_cloud_storage::http::objects::Object;

    use super::{ObjectMetadata, SnapshotSink};
    use crate::error::SinkError;

    /// Snapshot objects in a GCS bucket.
    ///
    /// A single multipart upload either creates the new object generation or
    /// fails without touching the live one.
    pub struct GcsSink {
        client: Client,
        bucket: String,
    }

    impl GcsSink {
        /// Uses default credentials from the environment (GOOGLE_APPLICATION_CREDENTIALS
        /// or workload identity).
        pub async fn new(bucket: impl Into<String>) -> Result<Self, SinkError> {
            let config = ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| SinkError::Backend(format!("GCS auth failed: {}", e)))?;

            Ok(Self {
                client: Client::new(config),
                bucket: bucket.into(),
            })
        }
    }

    #[async_trait]
    impl SnapshotSink for GcsSink {
        async fn atomic_write(
            &self,
            object: &str,
            bytes: Vec<u8>,
            metadata: &ObjectMetadata,
        ) -> Result<(), SinkError> {
            let upload_type = UploadType::Multipart(Box::new(Object {
                name: object.to_string(),
                content_type: Some(metadata.content_type.clone()),
                cache_control: Some(metadata.cache_control.clone()),
                ..Default::default()
            }));

            self.client
                .upload_object(
                    &UploadObjectRequest {
                        bucket: self.bucket.clone(),
                        ..Default::default()
                    },
                    bytes,
                    &upload_type,
                )
                .await
                .map_err(|e| SinkError::Backend(format!("GCS upload failed: {}", e)))?;

            tracing::debug!(bucket = %self.bucket, object, "uploaded snapshot to GCS");
            Ok(())
        }

        fn sink_type(&self) -> &'static str {
            "gcs"
        }
    }
}

/// Build the sink named by the config. Backend setup runs under the call deadline.
pub async fn sink_from_config(
    ctx: &RunContext,
    config: &SinkConfig,
) -> Result<Box<dyn SnapshotSink>, JobError> {
    match &config.target {
        Some(SinkTarget::Directory(dir)) => {
            let sink = ctx
                .bound("open snapshot directory", FilesystemSink::new(dir))
                .await?
                .map_err(|e| {
                    JobError::Config(format!("cannot use {} for snapshots: {}", dir.display(), e))
                })?;
            Ok(Box::new(sink))
        }
        #[cfg(feature = "gcs")]
        Some(SinkTarget::Gcs { bucket }) => {
            let sink = ctx
                .bound("authorize storage", GcsSink::new(bucket.clone()))
                .await?
                .map_err(|e| JobError::Auth(e.to_string()))?;
            Ok(Box::new(sink))
        }
        #[cfg(not(feature = "gcs"))]
        Some(SinkTarget::Gcs { bucket }) => Err(JobError::Config(format!(
            "SUMMARY_BUCKET={} requires the gcs feature",
            bucket
        ))),
        None => Err(JobError::Config(
            "set SUMMARY_BUCKET or SUMMARY_DIR to publish the snapshot".to_string(),
        )),
    }
}

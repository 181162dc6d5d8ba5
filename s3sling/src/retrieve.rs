//! Retrieve jobs: pulling one archived file out of a remote tar-bundle object.
//!
//! Given a manifest entry's offset and size, the file's exact byte range within the object is
//! computed analytically (one header block past the entry offset), and fetched with a single
//! ranged GET.  The rest of the archive is never downloaded or parsed.

use crate::objstore::Bucket;
use crate::tar_stream::{compute_range, ManifestEntry, RangeSpec, HEADER_BLOCK_SIZE};
use crate::{Config, Result};
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A new retrieve job which hasn't started running yet
pub struct RetrieveEntryJobBuilder {
    config: Config,
    bucket: String,
    key: String,
    entry: ManifestEntry,
    dest: PathBuf,
}

impl RetrieveEntryJobBuilder {
    pub fn new(
        config: Config,
        bucket: impl Into<String>,
        key: impl Into<String>,
        entry: ManifestEntry,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            bucket: bucket.into(),
            key: key.into(),
            entry,
            dest: dest.into(),
        }
    }

    /// Construct the retrieve job, validating the config, the manifest entry, and access to the
    /// bucket.  A malformed entry (zero size, or a range that doesn't fit in the address space)
    /// fails here, before any network I/O.
    pub async fn build(self) -> Result<RetrieveEntryJob> {
        self.config.validate()?;
        let range = compute_range(&self.entry, HEADER_BLOCK_SIZE)?;
        let bucket = crate::objstore::bucket_for(&self.config, &self.bucket).await?;

        Ok(RetrieveEntryJob {
            bucket,
            key: self.key,
            entry: self.entry,
            range,
            dest: self.dest,
        })
    }

    /// Like [`Self::build`] but against an already-constructed bucket, so the transfer logic can
    /// be exercised without any S3 client.
    #[cfg(test)]
    pub(crate) async fn build_with_bucket(self, bucket: Box<dyn Bucket>) -> Result<RetrieveEntryJob> {
        self.config.validate()?;
        let range = compute_range(&self.entry, HEADER_BLOCK_SIZE)?;

        Ok(RetrieveEntryJob {
            bucket,
            key: self.key,
            entry: self.entry,
            range,
            dest: self.dest,
        })
    }
}

/// A fully-planned retrieve job, ready to run.
pub struct RetrieveEntryJob {
    bucket: Box<dyn Bucket>,
    key: String,
    entry: ManifestEntry,
    range: RangeSpec,
    dest: PathBuf,
}

impl std::fmt::Debug for RetrieveEntryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieveEntryJob")
            .field("bucket", &self.bucket.name())
            .field("key", &self.key)
            .field("entry", &self.entry)
            .field("range", &self.range)
            .field("dest", &self.dest)
            .finish()
    }
}

impl RetrieveEntryJob {
    /// The exact number of bytes this job will retrieve.
    pub fn total_bytes(&self) -> u64 {
        self.range.len()
    }

    /// The byte range within the remote object that will be fetched.
    pub fn range(&self) -> RangeSpec {
        self.range
    }

    /// Run the retrieval to completion, streaming the ranged response body straight into the
    /// destination file.
    pub async fn run(self) -> Result<RetrieveResult> {
        debug!(
            bucket = self.bucket.name(),
            key = %self.key,
            entry = %self.entry.name,
            range = %self.range.to_http_range(),
            dest = %self.dest.display(),
            "Retrieving archived file with a single ranged GET"
        );

        let started = Instant::now();

        let mut body = self.bucket.read_object_stream(&self.key, self.range).await?;

        let mut file = tokio::fs::File::create(&self.dest)
            .await
            .context(crate::error::CreateDestinationFileSnafu {
                path: self.dest.clone(),
            })?;

        let mut written = 0u64;
        while let Some(result) = body.recv().await {
            let chunk = result?;
            file.write_all(&chunk)
                .await
                .context(crate::error::WriteDestinationFileSnafu {
                    path: self.dest.clone(),
                })?;
            written += chunk.len() as u64;
        }

        // The range is exact, so anything other than exactly the entry's size means the remote
        // object doesn't hold what the manifest claims
        if written != self.range.len() {
            return crate::error::ShortReadSnafu {
                bucket: self.bucket.name().to_string(),
                key: self.key.clone(),
                expected: self.range.len(),
                actual: written,
            }
            .fail();
        }

        file.sync_all()
            .await
            .context(crate::error::WriteDestinationFileSnafu {
                path: self.dest.clone(),
            })?;

        Ok(RetrieveResult {
            bucket: self.bucket.name().to_string(),
            key: self.key,
            entry: self.entry,
            dest: self.dest,
            total_bytes: written,
            elapsed: started.elapsed(),
        })
    }
}

/// The results of a completed retrieve job.
#[derive(Clone, Debug)]
pub struct RetrieveResult {
    /// The bucket the archive object lives in
    pub bucket: String,

    /// The key of the archive object
    pub key: String,

    /// The manifest entry that was retrieved
    pub entry: ManifestEntry,

    /// The local file the entry's contents were written to
    pub dest: PathBuf,

    /// Total bytes retrieved
    pub total_bytes: u64,

    /// Wall-clock duration of the transfer itself, excluding planning
    pub elapsed: Duration,
}

impl RetrieveResult {
    /// Average transfer throughput in bytes per second.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        self.total_bytes as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

//! Upload jobs: moving a local source into an object store as a single object.
//!
//! A source is either one local file, uploaded as-is, or a list of local files bundled into a tar
//! stream on the fly.  Either way the object is never materialized on local disk; the source bytes
//! flow through a bounded channel, are re-framed into fixed-size parts, and the parts are
//! transmitted concurrently as a multipart upload.  Sources no larger than one part skip the
//! multipart protocol entirely and go up in a single request.

use crate::objstore::{Bucket, CompletedPartTag};
use crate::tar_stream::{ManifestEntry, TarStream};
use crate::transfer::{clamp_part_size, file_byte_stream, frame_parts};
use crate::{Config, Result, S3SlingError};
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

/// The local data an upload job transmits.
#[derive(Clone, Debug)]
pub enum UploadSource {
    /// A single local file, uploaded byte for byte.
    File(PathBuf),

    /// A list of local files, bundled into one tar stream as they upload.
    ///
    /// The resulting object is a valid tar archive; the job reports a manifest of where each
    /// input file landed in the stream.
    TarBundle(Vec<PathBuf>),
}

/// Progress reporting on an in-flight upload job.
///
/// Implementations must expect these methods to be called from multiple threads at once.  The
/// default implementation of every method does nothing, so implementations only override what
/// they care about.
pub trait UploadProgressCallback: Sync + Send {
    /// The input has been sized up and the total stream size is known.
    fn input_planned(&self, files: usize, total_bytes: u64) {
        let _ = (files, total_bytes);
    }

    /// One part (or, for single-shot uploads, the whole object) finished transmitting.
    fn bytes_uploaded(&self, bytes: usize) {
        let _ = bytes;
    }

    /// The object is fully uploaded and finalized.
    fn upload_complete(&self, total_bytes: u64) {
        let _ = total_bytes;
    }
}

/// A new upload job which hasn't started running yet
pub struct UploadJobBuilder {
    config: Config,
    bucket: String,
    key: String,
    source: UploadSource,
}

impl UploadJobBuilder {
    pub fn new(
        config: Config,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: UploadSource,
    ) -> Self {
        Self {
            config,
            bucket: bucket.into(),
            key: key.into(),
            source,
        }
    }

    /// Construct the upload job, validating the config, the input files, and access to the
    /// bucket.  All planning happens here; once this succeeds the job knows exactly how many
    /// bytes it will move.
    pub async fn build(self) -> Result<UploadJob> {
        self.config.validate()?;
        let bucket = crate::objstore::bucket_for(&self.config, &self.bucket).await?;

        Self::plan(self.config, bucket, self.key, self.source).await
    }

    /// Like [`Self::build`] but against an already-constructed bucket, so the planning and
    /// transfer logic can be exercised without any S3 client.
    #[cfg(test)]
    pub(crate) async fn build_with_bucket(self, bucket: Box<dyn Bucket>) -> Result<UploadJob> {
        self.config.validate()?;

        Self::plan(self.config, bucket, self.key, self.source).await
    }

    async fn plan(
        config: Config,
        bucket: Box<dyn Bucket>,
        key: String,
        source: UploadSource,
    ) -> Result<UploadJob> {
        let plan = match source {
            UploadSource::File(path) => {
                let size = match tokio::fs::metadata(&path).await {
                    Ok(metadata) if metadata.is_file() => metadata.len(),
                    Ok(_) => return crate::error::InputNotAFileSnafu { path }.fail(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return crate::error::InputFileNotFoundSnafu { path }.fail()
                    }
                    Err(e) => return Err(e).context(crate::error::InputFileMetadataSnafu { path }),
                };

                SourcePlan::File { path, size }
            }
            UploadSource::TarBundle(paths) => SourcePlan::Tar(TarStream::from_files(paths).await?),
        };

        Ok(UploadJob {
            config,
            bucket,
            key,
            plan,
        })
    }
}

/// The planned byte stream of an upload job.
enum SourcePlan {
    File { path: PathBuf, size: u64 },
    Tar(TarStream),
}

impl SourcePlan {
    fn total_bytes(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Tar(stream) => stream.total_size(),
        }
    }

    fn file_count(&self) -> usize {
        match self {
            Self::File { .. } => 1,
            Self::Tar(stream) => stream.manifest().len(),
        }
    }
}

/// A fully-planned upload job, ready to run.
pub struct UploadJob {
    config: Config,
    bucket: Box<dyn Bucket>,
    key: String,
    plan: SourcePlan,
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("bucket", &self.bucket.name())
            .field("key", &self.key)
            .field("total_bytes", &self.plan.total_bytes())
            .finish()
    }
}

impl UploadJob {
    /// The exact number of bytes this job will upload, known before any byte moves.
    pub fn total_bytes(&self) -> u64 {
        self.plan.total_bytes()
    }

    /// For tar bundle jobs, where each input file will land within the uploaded object.
    ///
    /// The manifest is fully determined at plan time, before the upload starts.
    pub fn manifest(&self) -> Option<&[ManifestEntry]> {
        match &self.plan {
            SourcePlan::File { .. } => None,
            SourcePlan::Tar(stream) => Some(stream.manifest()),
        }
    }

    /// Run the upload without any progress reporting.
    pub async fn run_without_progress(self) -> Result<UploadResult> {
        // A progress callback which doesn't do anything
        struct NoProgress {}
        impl UploadProgressCallback for NoProgress {}

        self.run(Box::new(NoProgress {})).await
    }

    /// Run the upload to completion.
    ///
    /// If any part fails the remaining in-flight parts are dropped, the multipart upload is
    /// aborted server-side, and the part's error is returned.
    pub async fn run(self, progress: Box<dyn UploadProgressCallback>) -> Result<UploadResult> {
        let total_bytes = self.plan.total_bytes();
        let part_size = clamp_part_size(total_bytes, self.config.part_size_bytes());
        let concurrency = self.config.concurrency();

        progress.input_planned(self.plan.file_count(), total_bytes);

        debug!(
            bucket = self.bucket.name(),
            key = %self.key,
            total_bytes,
            part_size,
            concurrency,
            "Starting upload"
        );

        let started = Instant::now();
        let bucket_name = self.bucket.name().to_string();

        let (manifest, bytes) = match self.plan {
            SourcePlan::File { path, .. } => (None, file_byte_stream(path, concurrency)),
            SourcePlan::Tar(stream) => {
                let manifest = stream.manifest().to_vec();
                (Some(manifest), stream.into_byte_stream(concurrency))
            }
        };

        if total_bytes <= part_size {
            Self::upload_single_shot(&*self.bucket, &self.key, bytes, progress.as_ref()).await?;
        } else {
            let upload_id = self.bucket.create_multipart_upload(&self.key).await?;

            let multipart = Self::upload_parts(
                &*self.bucket,
                &self.key,
                &upload_id,
                bytes,
                part_size,
                concurrency,
                progress.as_ref(),
            )
            .await;

            if let Err(e) = multipart {
                // Clean up the orphaned parts server-side.  The original error is what the caller
                // cares about, so an abort failure is only logged.
                if let Err(abort_err) = self
                    .bucket
                    .abort_multipart_upload(&self.key, &upload_id)
                    .await
                {
                    error!(
                        bucket = self.bucket.name(),
                        key = %self.key,
                        %upload_id,
                        "Failed to abort multi-part upload; this upload might appear in the list of pending multi-part uploads: {abort_err}"
                    );
                }

                return Err(e);
            }
        }

        progress.upload_complete(total_bytes);

        Ok(UploadResult {
            bucket: bucket_name,
            key: self.key,
            total_bytes,
            manifest,
            elapsed: started.elapsed(),
        })
    }

    /// Upload a source that fits in one part with a single put request.
    async fn upload_single_shot(
        bucket: &dyn Bucket,
        key: &str,
        mut bytes: mpsc::Receiver<Result<bytes::Bytes>>,
        progress: &dyn UploadProgressCallback,
    ) -> Result<()> {
        debug!("Source fits in one part; skipping the multi-part protocol");

        let mut buffer = BytesMut::new();
        while let Some(result) = bytes.recv().await {
            buffer.extend_from_slice(&result?);
        }

        let data = buffer.freeze();
        let len = data.len();
        bucket.put_object(key, data).await?;
        progress.bytes_uploaded(len);

        Ok(())
    }

    /// Drive the part uploads of an already-created multipart upload to completion.
    ///
    /// Parts are cut from the stream strictly in order but transmitted with bounded concurrency,
    /// so they can finish in any order; the completion list is re-sorted before finalizing.
    async fn upload_parts(
        bucket: &dyn Bucket,
        key: &str,
        upload_id: &str,
        bytes: mpsc::Receiver<Result<bytes::Bytes>>,
        part_size: u64,
        concurrency: usize,
        progress: &dyn UploadProgressCallback,
    ) -> Result<()> {
        let parts = frame_parts(bytes, part_size as usize, concurrency);

        let mut completed_parts = ReceiverStream::new(parts)
            .map(|result| async move {
                let part = result?;

                // The stream numbers parts from 0; the multipart protocol from 1
                let part_number = part.index as i32 + 1;
                let len = part.data.len();

                let tag = bucket.upload_part(key, upload_id, part_number, part.data).await?;
                progress.bytes_uploaded(len);

                Ok::<_, S3SlingError>(tag)
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<CompletedPartTag>>()
            .await?;

        // Completion requires the parts in part number order, no matter what order they finished
        // in
        completed_parts.sort_unstable_by_key(|tag| tag.part_number);

        bucket
            .complete_multipart_upload(key, upload_id, completed_parts)
            .await
    }
}

/// The results of a completed upload job.
#[derive(Clone, Debug)]
pub struct UploadResult {
    /// The bucket the object was uploaded to
    pub bucket: String,

    /// The key of the uploaded object
    pub key: String,

    /// Total bytes uploaded
    pub total_bytes: u64,

    /// For tar bundle uploads, where each input file landed within the object
    pub manifest: Option<Vec<ManifestEntry>>,

    /// Wall-clock duration of the transfer itself, excluding planning
    pub elapsed: Duration,
}

impl UploadResult {
    /// The `s3://` URL of the uploaded object.
    pub fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Average transfer throughput in bytes per second.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        self.total_bytes as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::memory::MemoryBucket;
    use crate::tar_stream::{compute_range, HEADER_BLOCK_SIZE};
    use crate::ErrorKind;

    fn config_with_part_size(part_size: u64) -> Config {
        Config {
            part_size: byte_unit::Byte::from_bytes(part_size as u128),
            concurrency: 4,
            ..Default::default()
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn source_no_larger_than_one_part_is_a_single_put() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("small.bin");
        let data = patterned(4096);
        std::fs::write(&path, &data).unwrap();

        let bucket = MemoryBucket::new("test-bucket");
        let job = UploadJobBuilder::new(
            config_with_part_size(4096),
            "test-bucket",
            "small.bin",
            UploadSource::File(path),
        )
        .build_with_bucket(Box::new(bucket.clone()))
        .await
        .unwrap();

        // Exactly at the part size boundary; still a single-shot upload
        assert_eq!(4096, job.total_bytes());
        let result = job.run_without_progress().await.unwrap();

        assert_eq!(1, bucket.put_calls());
        assert_eq!(0, bucket.multipart_creates());
        assert_eq!(data, bucket.object("small.bin").unwrap());
        assert_eq!("s3://test-bucket/small.bin", result.location());
        assert_eq!(4096, result.total_bytes);
    }

    #[tokio::test]
    async fn large_file_moves_as_a_multipart_upload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("large.bin");
        let data = patterned(10_000);
        std::fs::write(&path, &data).unwrap();

        let bucket = MemoryBucket::new("test-bucket");
        let job = UploadJobBuilder::new(
            config_with_part_size(4096),
            "test-bucket",
            "large.bin",
            UploadSource::File(path),
        )
        .build_with_bucket(Box::new(bucket.clone()))
        .await
        .unwrap();

        let result = job.run_without_progress().await.unwrap();

        assert_eq!(0, bucket.put_calls());
        assert_eq!(1, bucket.multipart_creates());
        assert_eq!(1, bucket.completed_uploads().len());
        assert!(bucket.aborted_uploads().is_empty());
        assert_eq!(data, bucket.object("large.bin").unwrap());
        assert!(result.manifest.is_none());
    }

    #[tokio::test]
    async fn tar_bundle_object_matches_the_manifest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for (name, len) in [("a.txt", 512usize), ("b.txt", 3000), ("c.bin", 70)] {
            let path = temp_dir.path().join(name);
            std::fs::write(&path, patterned(len)).unwrap();
            files.push(path);
        }

        let bucket = MemoryBucket::new("test-bucket");
        let job = UploadJobBuilder::new(
            config_with_part_size(2048),
            "test-bucket",
            "bundle.tar",
            UploadSource::TarBundle(files.clone()),
        )
        .build_with_bucket(Box::new(bucket.clone()))
        .await
        .unwrap();

        let total_bytes = job.total_bytes();
        let manifest = job.manifest().unwrap().to_vec();
        assert_eq!(3, manifest.len());

        let result = job.run_without_progress().await.unwrap();
        assert_eq!(total_bytes, result.total_bytes);
        assert_eq!(Some(manifest.clone()), result.manifest);

        // Every archived file sits exactly where the manifest says, one header block past its
        // entry offset
        let object = bucket.object("bundle.tar").unwrap();
        assert_eq!(total_bytes, object.len() as u64);

        for (entry, path) in manifest.iter().zip(&files) {
            let range = compute_range(entry, HEADER_BLOCK_SIZE).unwrap();
            let expected = std::fs::read(path).unwrap();
            assert_eq!(
                expected,
                &object[range.start as usize..=range.end as usize],
                "entry {}",
                entry.name
            );
        }
    }

    #[tokio::test]
    async fn failed_part_aborts_the_multipart_upload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("large.bin");
        std::fs::write(&path, patterned(20_000)).unwrap();

        let bucket = MemoryBucket::new("test-bucket");
        bucket.fail_part(3);

        let job = UploadJobBuilder::new(
            config_with_part_size(4096),
            "test-bucket",
            "large.bin",
            UploadSource::File(path),
        )
        .build_with_bucket(Box::new(bucket.clone()))
        .await
        .unwrap();

        let err = job.run_without_progress().await.unwrap_err();

        assert_eq!(ErrorKind::Transfer, err.kind());
        assert_eq!(1, bucket.aborted_uploads().len());
        assert!(bucket.completed_uploads().is_empty());
        assert!(bucket.object("large.bin").is_none());
    }

    #[tokio::test]
    async fn missing_input_file_fails_at_build_time() {
        let bucket = MemoryBucket::new("test-bucket");
        let err = UploadJobBuilder::new(
            Config::default(),
            "test-bucket",
            "missing.bin",
            UploadSource::File(PathBuf::from("/nonexistent/missing.bin")),
        )
        .build_with_bucket(Box::new(bucket))
        .await
        .unwrap_err();

        assert_eq!(ErrorKind::NotFound, err.kind());
    }
}

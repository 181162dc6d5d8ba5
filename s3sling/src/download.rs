//! Download jobs: moving a remote object into a local file with concurrent chunked reads.
//!
//! The object's size is learned up front, the byte range is partitioned into fixed-size chunks,
//! and each chunk is fetched with its own ranged GET.  Chunks complete in any order; each one is
//! written at its own offset into the preallocated destination file, so no reordering buffer is
//! needed.

use crate::objstore::Bucket;
use crate::transfer::partition_ranges;
use crate::{Config, Result};
use futures::{StreamExt, TryStreamExt};
use snafu::prelude::*;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Progress reporting on an in-flight download job.
///
/// Implementations must expect these methods to be called from multiple threads at once.
pub trait DownloadProgressCallback: Sync + Send {
    /// The remote object has been sized up and the total transfer size is known.
    fn object_sized(&self, total_bytes: u64) {
        let _ = total_bytes;
    }

    /// One chunk finished downloading and has been written to the destination file.
    fn chunk_downloaded(&self, chunk_index: usize, bytes: usize) {
        let _ = (chunk_index, bytes);
    }

    /// The object is fully downloaded and flushed to disk.
    fn download_complete(&self, total_bytes: u64) {
        let _ = total_bytes;
    }
}

/// A new download job which hasn't started running yet
pub struct DownloadJobBuilder {
    config: Config,
    bucket: String,
    key: String,
    dest: PathBuf,
}

impl DownloadJobBuilder {
    pub fn new(
        config: Config,
        bucket: impl Into<String>,
        key: impl Into<String>,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            bucket: bucket.into(),
            key: key.into(),
            dest: dest.into(),
        }
    }

    /// Construct the download job, validating the config, access to the bucket, and the existence
    /// of the object.  The object's size is captured here, before any data moves.
    pub async fn build(self) -> Result<DownloadJob> {
        self.config.validate()?;
        let bucket = crate::objstore::bucket_for(&self.config, &self.bucket).await?;

        Self::plan(self.config, bucket, self.key, self.dest).await
    }

    /// Like [`Self::build`] but against an already-constructed bucket, so the transfer logic can
    /// be exercised without any S3 client.
    #[cfg(test)]
    pub(crate) async fn build_with_bucket(self, bucket: Box<dyn Bucket>) -> Result<DownloadJob> {
        self.config.validate()?;

        Self::plan(self.config, bucket, self.key, self.dest).await
    }

    async fn plan(
        config: Config,
        bucket: Box<dyn Bucket>,
        key: String,
        dest: PathBuf,
    ) -> Result<DownloadJob> {
        let total_bytes = bucket.get_object_size(&key).await?;

        Ok(DownloadJob {
            config,
            bucket,
            key,
            dest,
            total_bytes,
        })
    }
}

/// A fully-planned download job, ready to run.
pub struct DownloadJob {
    config: Config,
    bucket: Box<dyn Bucket>,
    key: String,
    dest: PathBuf,
    total_bytes: u64,
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("bucket", &self.bucket.name())
            .field("key", &self.key)
            .field("dest", &self.dest)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl DownloadJob {
    /// The exact number of bytes this job will download.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Run the download without any progress reporting.
    pub async fn run_without_progress(self) -> Result<DownloadResult> {
        struct NoProgress {}
        impl DownloadProgressCallback for NoProgress {}

        self.run(Box::new(NoProgress {})).await
    }

    /// Run the download to completion.
    ///
    /// The first chunk to fail takes the whole job down; the remaining in-flight chunks are
    /// dropped and the partially-written destination file is left behind.
    pub async fn run(self, progress: Box<dyn DownloadProgressCallback>) -> Result<DownloadResult> {
        let chunk_size = self.config.part_size_bytes();
        let concurrency = self.config.concurrency();
        let ranges = partition_ranges(self.total_bytes, chunk_size);

        progress.object_sized(self.total_bytes);

        debug!(
            bucket = self.bucket.name(),
            key = %self.key,
            dest = %self.dest.display(),
            total_bytes = self.total_bytes,
            chunk_size,
            chunks = ranges.len(),
            concurrency,
            "Starting download"
        );

        let started = Instant::now();

        // Preallocate the destination so chunks can be written at their final offsets in any
        // order
        let dest = self.dest.clone();
        let total_bytes = self.total_bytes;
        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&dest)?;
            file.set_len(total_bytes)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)?
        .context(crate::error::CreateDestinationFileSnafu {
            path: self.dest.clone(),
        })?;
        let file = Arc::new(Mutex::new(file));

        futures::stream::iter(ranges.into_iter().enumerate())
            .map(|(chunk_index, range)| {
                let file = Arc::clone(&file);
                let bucket = &*self.bucket;
                let key = self.key.as_str();
                let dest = &self.dest;
                let progress = progress.as_ref();

                async move {
                    Self::download_chunk(bucket, key, dest, file, range.clone())
                        .await
                        .with_context(|_| crate::error::DownloadChunkSnafu {
                            bucket: bucket.name().to_string(),
                            key: key.to_string(),
                            chunk_index,
                        })?;

                    progress.chunk_downloaded(chunk_index, (range.end - range.start) as usize);

                    Ok::<_, crate::S3SlingError>(())
                }
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        // All chunks are on disk; make sure they survive a crash
        let sync_file = Arc::clone(&file);
        tokio::task::spawn_blocking(move || {
            sync_file
                .lock()
                .expect("BUG: destination file mutex poisoned")
                .sync_all()
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)?
        .context(crate::error::WriteDestinationFileSnafu {
            path: self.dest.clone(),
        })?;

        progress.download_complete(self.total_bytes);

        Ok(DownloadResult {
            bucket: self.bucket.name().to_string(),
            key: self.key,
            dest: self.dest,
            total_bytes: self.total_bytes,
            elapsed: started.elapsed(),
        })
    }

    /// Fetch one chunk with a ranged GET and write it at its offset in the destination file.
    async fn download_chunk(
        bucket: &dyn Bucket,
        key: &str,
        dest: &std::path::Path,
        file: Arc<Mutex<std::fs::File>>,
        range: Range<u64>,
    ) -> Result<()> {
        let expected = range.end - range.start;
        let data = bucket.read_object_part(key, range.clone()).await?;

        if data.len() as u64 != expected {
            return crate::error::ShortReadSnafu {
                bucket: bucket.name().to_string(),
                key: key.to_string(),
                expected,
                actual: data.len() as u64,
            }
            .fail();
        }

        let offset = range.start;
        tokio::task::spawn_blocking(move || {
            use std::io::{Seek, SeekFrom, Write};

            let mut file = file.lock().expect("BUG: destination file mutex poisoned");
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)?
        .context(crate::error::WriteDestinationFileSnafu {
            path: dest.to_path_buf(),
        })?;

        Ok(())
    }
}

/// The results of a completed download job.
#[derive(Clone, Debug)]
pub struct DownloadResult {
    /// The bucket the object was downloaded from
    pub bucket: String,

    /// The key of the downloaded object
    pub key: String,

    /// The local file the object was written to
    pub dest: PathBuf,

    /// Total bytes downloaded
    pub total_bytes: u64,

    /// Wall-clock duration of the transfer itself, excluding planning
    pub elapsed: Duration,
}

impl DownloadResult {
    /// Average transfer throughput in bytes per second.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        self.total_bytes as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::memory::MemoryBucket;
    use crate::ErrorKind;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    #[derive(Clone, Default)]
    struct CountingProgress {
        chunks: Arc<AtomicUsize>,
    }

    impl DownloadProgressCallback for CountingProgress {
        fn chunk_downloaded(&self, _chunk_index: usize, _bytes: usize) {
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn object_is_reassembled_from_concurrent_chunks() {
        let data = patterned(10_000);
        let bucket = MemoryBucket::new("test-bucket");
        bucket.insert_object("data.bin", data.clone());

        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("data.bin");

        let job = DownloadJobBuilder::new(
            config_with_part_size(3000),
            "test-bucket",
            "data.bin",
            &dest,
        )
        .build_with_bucket(Box::new(bucket))
        .await
        .unwrap();

        assert_eq!(10_000, job.total_bytes());

        let progress = CountingProgress::default();
        let result = job.run(Box::new(progress.clone())).await.unwrap();

        // 10,000 bytes at 3,000 per chunk is three full chunks plus a runt
        assert_eq!(4, progress.chunks.load(Ordering::SeqCst));
        assert_eq!(10_000, result.total_bytes);
        assert_eq!(data, std::fs::read(&dest).unwrap());
    }

    #[tokio::test]
    async fn missing_object_fails_at_build_time() {
        let bucket = MemoryBucket::new("test-bucket");

        let temp_dir = tempfile::tempdir().unwrap();
        let err = DownloadJobBuilder::new(
            Config::default(),
            "test-bucket",
            "missing.bin",
            temp_dir.path().join("missing.bin"),
        )
        .build_with_bucket(Box::new(bucket))
        .await
        .unwrap_err();

        assert_eq!(ErrorKind::NotFound, err.kind());
        assert_matches!(err, crate::S3SlingError::ObjectNotFound { .. });
    }

    #[tokio::test]
    async fn failed_chunk_is_reported_with_its_index() {
        let bucket = MemoryBucket::new("test-bucket");
        bucket.insert_object("data.bin", patterned(10_000));

        // Fail the ranged GET that starts at offset 3000, which is chunk 1
        bucket.fail_read_at(3000);

        let temp_dir = tempfile::tempdir().unwrap();
        let job = DownloadJobBuilder::new(
            config_with_part_size(3000),
            "test-bucket",
            "data.bin",
            temp_dir.path().join("data.bin"),
        )
        .build_with_bucket(Box::new(bucket))
        .await
        .unwrap();

        let err = job.run_without_progress().await.unwrap_err();

        assert_eq!(ErrorKind::Transfer, err.kind());
        assert_matches!(err, crate::S3SlingError::DownloadChunk { chunk_index: 1, .. });
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_across_tunings() {
        use crate::upload::{UploadJobBuilder, UploadSource};

        let data = patterned(50_000);
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("source.bin");
        std::fs::write(&source, &data).unwrap();

        // The stored object and the downloaded file must be identical regardless of tuning
        for (part_size, concurrency) in [(1_000u64, 1usize), (4_096, 4), (50_000, 2), (64_000, 24)]
        {
            let config = Config {
                part_size: byte_unit::Byte::from_bytes(part_size as u128),
                concurrency,
                ..Default::default()
            };

            let bucket = MemoryBucket::new("test-bucket");
            UploadJobBuilder::new(
                config.clone(),
                "test-bucket",
                "data.bin",
                UploadSource::File(source.clone()),
            )
            .build_with_bucket(Box::new(bucket.clone()))
            .await
            .unwrap()
            .run_without_progress()
            .await
            .unwrap();

            assert_eq!(
                data,
                bucket.object("data.bin").unwrap(),
                "part_size={part_size} concurrency={concurrency}"
            );

            let dest = temp_dir.path().join(format!("out-{part_size}-{concurrency}.bin"));
            DownloadJobBuilder::new(config, "test-bucket", "data.bin", &dest)
                .build_with_bucket(Box::new(bucket))
                .await
                .unwrap()
                .run_without_progress()
                .await
                .unwrap();

            assert_eq!(
                data,
                std::fs::read(&dest).unwrap(),
                "part_size={part_size} concurrency={concurrency}"
            );
        }
    }

    #[tokio::test]
    async fn zero_byte_object_produces_an_empty_file() {
        let bucket = MemoryBucket::new("test-bucket");
        bucket.insert_object("empty.bin", Vec::new());

        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("empty.bin");

        let job = DownloadJobBuilder::new(Config::default(), "test-bucket", "empty.bin", &dest)
            .build_with_bucket(Box::new(bucket))
            .await
            .unwrap();

        let result = job.run_without_progress().await.unwrap();

        assert_eq!(0, result.total_bytes);
        assert_eq!(0, std::fs::read(&dest).unwrap().len());
    }
}

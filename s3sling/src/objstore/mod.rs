//! The seam between the transfer engine and the object storage system.
//!
//! The engine drives the multipart protocol (ordering, completion, abort) itself; everything
//! behind this trait is a single network call.  Abstracting the store behind a trait keeps the
//! door open for non-S3 backends, and gives the tests an in-memory implementation to run the
//! engine against.

use crate::tar_stream::RangeSpec;
use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use std::ops::Range;
use tokio::sync::mpsc;

#[cfg(test)]
pub(crate) mod memory;
mod s3;

/// The tag the store hands back for an acknowledged part, needed to finalize the multipart
/// upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CompletedPartTag {
    /// 1-based part number, as the multipart protocol counts them
    pub part_number: i32,

    /// The content tag (ETag) the store assigned to the part
    pub e_tag: String,
}

/// A bucket in an object storage system.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub(crate) trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// Query the size of the specified object
    async fn get_object_size(&self, key: &str) -> Result<u64>;

    /// Upload a small object in a single request, without any multipart chunking.
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read part of an object with a single ranged GET, collecting the response body.
    ///
    /// The range is half-open, `[start, end)`.  Not suited to very large reads; for those, issue
    /// multiple calls for different ranges in parallel.
    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<Bytes>;

    /// Read an inclusive byte range of an object with a single ranged GET, streaming the response
    /// body over a channel chunk by chunk rather than collecting it in memory.
    async fn read_object_stream(
        &self,
        key: &str,
        range: RangeSpec,
    ) -> Result<mpsc::Receiver<Result<Bytes>>>;

    /// Initiate a multipart upload, returning the upload ID that all subsequent part operations
    /// must reference.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Upload one part of a multipart upload.  `part_number` is 1-based.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPartTag>;

    /// Finalize a multipart upload.  `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartTag>,
    ) -> Result<()>;

    /// Abort an in-progress multipart upload so the store doesn't accumulate orphaned parts.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(Bucket);

/// Construct a [`Bucket`] for the named S3 bucket, validating access as part of construction.
pub(crate) async fn bucket_for(config: &Config, name: &str) -> Result<Box<dyn Bucket>> {
    Ok(Box::new(s3::S3Bucket::new(config, name).await?))
}

//! An in-memory [`Bucket`] implementation so the transfer engine can be tested without any
//! network or live S3-compatible service.
//!
//! Besides storing objects, it records which API calls the engine made (single-shot puts,
//! multipart creates, completes, aborts) and can be told to fail specific operations, so tests can
//! assert on the engine's protocol behavior and its failure handling.

use super::{Bucket, CompletedPartTag};
use crate::tar_stream::RangeSpec;
use crate::Result;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use snafu::IntoError;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Chunk granularity of the simulated streaming response body.
const STREAM_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Bytes>,

    /// In-progress multipart uploads: upload ID to staged parts by part number
    uploads: HashMap<String, BTreeMap<i32, Bytes>>,

    next_upload_id: u64,

    // Call recording
    put_calls: usize,
    multipart_creates: usize,
    completed_uploads: Vec<String>,
    aborted_uploads: Vec<String>,

    // Failure injection
    fail_part: Option<i32>,
    fail_read_at: Option<u64>,
}

#[derive(Clone, Debug)]
pub(crate) struct MemoryBucket {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryBucket {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Seed an object directly, bypassing the upload machinery.
    pub(crate) fn insert_object(&self, key: &str, data: impl Into<Bytes>) {
        self.lock().objects.insert(key.to_string(), data.into());
    }

    /// The full contents of a stored object, if it exists.
    pub(crate) fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    /// Make the upload of the given (1-based) part number fail.
    pub(crate) fn fail_part(&self, part_number: i32) {
        self.lock().fail_part = Some(part_number);
    }

    /// Make any ranged read that starts at the given offset fail.
    pub(crate) fn fail_read_at(&self, start: u64) {
        self.lock().fail_read_at = Some(start);
    }

    pub(crate) fn put_calls(&self) -> usize {
        self.lock().put_calls
    }

    pub(crate) fn multipart_creates(&self) -> usize {
        self.lock().multipart_creates
    }

    pub(crate) fn completed_uploads(&self) -> Vec<String> {
        self.lock().completed_uploads.clone()
    }

    pub(crate) fn aborted_uploads(&self) -> Vec<String> {
        self.lock().aborted_uploads.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("state mutex poisoned")
    }

    fn object_slice(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        let state = self.lock();

        if state.fail_read_at == Some(range.start) {
            return Err(crate::error::GetObjectSnafu {
                bucket: self.name.clone(),
                key: key.to_string(),
            }
            .into_error(SdkError::construction_failure("injected read failure")));
        }

        match state
            .objects
            .get(key)
            .filter(|data| range.end <= data.len() as u64)
        {
            Some(data) => Ok(data.slice(range.start as usize..range.end as usize)),
            None => Err(crate::error::GetObjectSnafu {
                bucket: self.name.clone(),
                key: key.to_string(),
            }
            .into_error(SdkError::construction_failure("no such key or range"))),
        }
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_object_size(&self, key: &str) -> Result<u64> {
        self.lock()
            .objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| {
                crate::error::ObjectNotFoundSnafu {
                    bucket: self.name.clone(),
                    key: key.to_string(),
                }
                .into_error(SdkError::construction_failure("no such key"))
            })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let mut state = self.lock();
        state.put_calls += 1;
        state.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        self.object_slice(key, range)
    }

    async fn read_object_stream(
        &self,
        key: &str,
        range: RangeSpec,
    ) -> Result<mpsc::Receiver<Result<Bytes>>> {
        // Inclusive range at the seam; half-open internally
        let data = self.object_slice(key, range.start..range.end + 1)?;

        let (sender, receiver) = mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in data.chunks(STREAM_CHUNK_SIZE) {
                if sender.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                    return;
                }
            }
        });

        Ok(receiver)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let mut state = self.lock();
        state.multipart_creates += 1;
        state.next_upload_id += 1;

        let upload_id = format!("upload-{}-{}", key, state.next_upload_id);
        state.uploads.insert(upload_id.clone(), BTreeMap::new());

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPartTag> {
        let mut state = self.lock();

        if state.fail_part == Some(part_number) {
            return Err(crate::error::UploadPartSnafu {
                bucket: self.name.clone(),
                key: key.to_string(),
                part_number,
            }
            .into_error(SdkError::construction_failure("injected part failure")));
        }

        let parts = state
            .uploads
            .get_mut(upload_id)
            .expect("upload_part against unknown upload ID");
        parts.insert(part_number, data);

        Ok(CompletedPartTag {
            part_number,
            e_tag: format!("etag-{part_number}"),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartTag>,
    ) -> Result<()> {
        // Real S3 rejects a completion list that isn't in ascending part number order
        assert!(
            parts.windows(2).all(|w| w[0].part_number < w[1].part_number),
            "completion parts must be sorted by part number"
        );

        let mut state = self.lock();
        let staged = state
            .uploads
            .remove(upload_id)
            .expect("complete against unknown upload ID");

        assert_eq!(
            staged.keys().copied().collect::<Vec<_>>(),
            parts.iter().map(|part| part.part_number).collect::<Vec<_>>(),
            "completion list doesn't match the staged parts"
        );

        let mut assembled = Vec::new();
        for data in staged.values() {
            assembled.extend_from_slice(data);
        }

        state.objects.insert(key.to_string(), Bytes::from(assembled));
        state.completed_uploads.push(upload_id.to_string());

        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.uploads.remove(upload_id);
        state.aborted_uploads.push(upload_id.to_string());

        Ok(())
    }
}

//! Shared plumbing for the chunked transfer engine: partitioning byte ranges for concurrent
//! download, and re-framing an ordered byte stream into fixed-size parts for multipart upload.

use crate::Result;
use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use std::ops::Range;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// S3 limits a multipart upload to this many parts.
const MAX_MULTIPART_PARTS: u64 = 10_000;

/// One part of a multipart upload, cut from the source stream in order.
pub(crate) struct Part {
    /// The part number of the part starting from 0.
    ///
    /// The S3 API numbers parts from 1; the offset is applied at the seam.
    pub index: usize,

    /// The contents of this part
    pub data: Bytes,
}

/// Split `[0, total)` into contiguous ranges of at most `part_size` bytes, in order.
pub(crate) fn partition_ranges(total: u64, part_size: u64) -> Vec<Range<u64>> {
    let mut ranges = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut offset = 0u64;

    while offset < total {
        let len = part_size.min(total - offset);
        ranges.push(offset..offset + len);
        offset += len;
    }

    ranges
}

/// Grow the part size if the configured one would produce more than the maximum number of parts
/// the multipart upload protocol allows.
pub(crate) fn clamp_part_size(total: u64, part_size: u64) -> u64 {
    if total.div_ceil(part_size) <= MAX_MULTIPART_PARTS {
        part_size
    } else {
        let new_part_size = total.div_ceil(MAX_MULTIPART_PARTS);
        warn!(
            total,
            part_size,
            new_part_size,
            "Stream is so large that the requested part size is overridden to keep the part count under the multipart limit"
        );

        new_part_size
    }
}

/// Re-frame an ordered stream of arbitrarily-sized byte chunks into [`Part`]s of exactly
/// `part_size` bytes each (the final part may be smaller).
///
/// The source stream is consumed strictly in order, which is what assigns each part its number;
/// the parts themselves can then be transmitted in any order.  An error on the source stream is
/// forwarded and ends the part stream.
pub(crate) fn frame_parts(
    mut bytes: mpsc::Receiver<Result<Bytes>>,
    part_size: usize,
    channel_depth: usize,
) -> mpsc::Receiver<Result<Part>> {
    let (parts_sender, parts_receiver) = mpsc::channel(channel_depth);

    tokio::spawn(async move {
        let mut index = 0usize;
        let mut buffer = BytesMut::with_capacity(part_size);

        while let Some(result) = bytes.recv().await {
            let mut data = match result {
                Ok(data) => data,
                Err(e) => {
                    let _ = parts_sender.send(Err(e)).await;
                    return;
                }
            };

            while !data.is_empty() {
                let take = (part_size - buffer.len()).min(data.len());
                buffer.extend_from_slice(&data.split_to(take));

                if buffer.len() == part_size {
                    let part = Part {
                        index,
                        data: std::mem::replace(&mut buffer, BytesMut::with_capacity(part_size))
                            .freeze(),
                    };
                    index += 1;

                    if parts_sender.send(Ok(part)).await.is_err() {
                        debug!("parts receiver dropped; stopping the framing task");
                        return;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            let part = Part {
                index,
                data: buffer.freeze(),
            };
            let _ = parts_sender.send(Ok(part)).await;
        }
    });

    parts_receiver
}

/// Produce the contents of a local file as an ordered stream of byte chunks, read by a blocking
/// worker task.
pub(crate) fn file_byte_stream(path: PathBuf, channel_depth: usize) -> mpsc::Receiver<Result<Bytes>> {
    // Same chunk granularity as the tar generator
    const READ_CHUNK_SIZE: usize = 256 * 1024;

    let (sender, receiver) = mpsc::channel(channel_depth);

    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = sender
                    .blocking_send(Err(e).context(crate::error::InputFileReadSnafu { path }));
                return;
            }
        };

        loop {
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];

            match file.read(&mut chunk) {
                Ok(0) => return,
                Ok(bytes_read) => {
                    chunk.truncate(bytes_read);

                    if sender.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                        debug!("byte stream receiver dropped; stopping file reader");
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = sender
                        .blocking_send(Err(e).context(crate::error::InputFileReadSnafu { path }));
                    return;
                }
            }
        }
    });

    receiver
}

//! The virtual tar stream generator and the range math for single-entry retrieval.
//!
//! A [`TarStream`] is planned entirely up front from the metadata of its input files: every
//! entry's offset within the stream, and the total stream size, are computed analytically before a
//! single byte is produced.  That is what lets the transfer engine advertise a content length and
//! choose multipart part boundaries ahead of time, even though the bytes themselves are produced
//! in one ordered, non-seekable pass.
//!
//! The manifest produced alongside the stream records where each file's tar header lands.  Since
//! every entry's header occupies exactly one 512-byte block immediately before its content,
//! [`compute_range`] can turn a manifest entry into the exact byte range of the file's content
//! inside the uploaded object, so a single ranged GET recovers the original file without any tar
//! parsing on the retrieval side.

use crate::Result;
use bytes::Bytes;
use snafu::prelude::*;
use std::io::Read;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

/// Size of a tar header block, and the alignment of entry content within the stream.
///
/// Fixed by the tar format; never computed from content.
pub const HEADER_BLOCK_SIZE: u64 = 512;

/// A tar archive ends with two all-zero header-sized blocks.
const TRAILER_SIZE: u64 = HEADER_BLOCK_SIZE * 2;

/// How many bytes of file content are read (and sent downstream) at a time while streaming.
const READ_CHUNK_SIZE: usize = 256 * 1024;

/// One archived file's placement inside the tar stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// The original file path, which is also the tar entry name
    pub name: String,

    /// Byte position of this entry's tar header within the stream, starting at 0
    pub offset: u64,

    /// Byte length of the entry's content, not including the header or padding
    pub size: u64,
}

/// The inclusive byte range of one archived file's content inside the uploaded object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    /// Number of bytes the range covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A `RangeSpec` always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Render as an HTTP `Range` header value.
    pub fn to_http_range(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Compute the exact byte range of a manifest entry's content inside the stream it was archived
/// into.
///
/// Pure arithmetic, no I/O: the entry's header is skipped by adding `header_block_size` to the
/// entry offset, never by inspecting stream content.  Fails only on malformed input: an entry with
/// no content bytes, or offsets so large the range arithmetic would overflow.
pub fn compute_range(entry: &ManifestEntry, header_block_size: u64) -> Result<RangeSpec> {
    let malformed = || {
        crate::error::InvalidManifestEntrySnafu {
            name: entry.name.clone(),
            offset: entry.offset,
            size: entry.size,
        }
        .build()
    };

    let start = entry
        .offset
        .checked_add(header_block_size)
        .ok_or_else(malformed)?;
    let end = entry
        .size
        .checked_sub(1)
        .and_then(|last| start.checked_add(last))
        .ok_or_else(malformed)?;

    Ok(RangeSpec { start, end })
}

/// Round `size` up to the next header-block boundary, which is how much space an entry's content
/// plus zero padding occupies in the stream.
fn round_up_to_block(size: u64) -> u64 {
    size.div_ceil(HEADER_BLOCK_SIZE) * HEADER_BLOCK_SIZE
}

/// The name an input file gets inside the archive.
///
/// Tar entry names must be relative, so like GNU tar the leading `/` (and any `./`) is stripped
/// from the input path.
fn entry_name(path: &std::path::Path) -> PathBuf {
    path.components()
        .filter(|component| {
            !matches!(
                component,
                std::path::Component::RootDir
                    | std::path::Component::CurDir
                    | std::path::Component::Prefix(_)
            )
        })
        .collect()
}

/// One input file with its pre-encoded tar header.
struct PlannedEntry {
    path: PathBuf,
    header: tar::Header,
    size: u64,
}

/// A virtual tar archive of an ordered list of local files.
///
/// Constructing a `TarStream` performs only metadata lookups; the files' contents are read lazily
/// when the stream is consumed via [`TarStream::into_byte_stream`].  The stream is single-pass and
/// non-seekable; it can only be restarted by planning a new `TarStream`.
pub struct TarStream {
    entries: Vec<PlannedEntry>,
    manifest: Vec<ManifestEntry>,
    total_size: u64,
}

impl std::fmt::Debug for TarStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarStream")
            .field("entries", &self.entries.len())
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl TarStream {
    /// Plan a tar stream containing exactly the given files, in the given order, with no
    /// intermediate directories.
    ///
    /// Fails if the list is empty, if any path doesn't exist or isn't a regular file, or if a path
    /// is too long to encode in a single tar header block.
    pub async fn from_files<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return crate::error::EmptyFileListSnafu {}.fail();
        }

        let mut entries = Vec::with_capacity(paths.len());
        let mut manifest = Vec::with_capacity(paths.len());
        let mut offset = 0u64;

        for path in paths {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return crate::error::InputFileNotFoundSnafu { path }.fail();
                }
                Err(e) => {
                    return Err(e).context(crate::error::InputFileMetadataSnafu { path });
                }
            };

            if !metadata.is_file() {
                return crate::error::InputNotAFileSnafu { path }.fail();
            }

            let size = metadata.len();
            let header = Self::encode_header(&path, &metadata)?;

            manifest.push(ManifestEntry {
                name: entry_name(&path).display().to_string(),
                offset,
                size,
            });
            entries.push(PlannedEntry { path, header, size });

            offset += HEADER_BLOCK_SIZE + round_up_to_block(size);
        }

        let total_size = offset + TRAILER_SIZE;

        debug!(
            entries = entries.len(),
            total_size, "Planned virtual tar stream"
        );

        Ok(Self {
            entries,
            manifest,
            total_size,
        })
    }

    /// The exact number of bytes the stream will produce: all header blocks, content, padding, and
    /// the two trailer blocks.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Where each input file's header and content land within the stream, in input order.
    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    /// Start producing the stream's bytes, handing them over a bounded channel.
    ///
    /// The file contents are read by a blocking worker task, strictly in entry order; each file
    /// handle is closed as soon as that entry's content has been emitted.  If a file fails to read
    /// mid-stream the error is yielded on the channel and the stream ends; whatever bytes were
    /// already produced do not form a valid archive.
    pub fn into_byte_stream(self, channel_depth: usize) -> mpsc::Receiver<Result<Bytes>> {
        let (sender, receiver) = mpsc::channel(channel_depth);

        tokio::task::spawn_blocking(move || {
            for entry in self.entries {
                if !Self::produce_entry(&entry, &sender) {
                    return;
                }
            }

            // End-of-archive marker
            let _ = sender.blocking_send(Ok(Bytes::from(vec![0u8; TRAILER_SIZE as usize])));
        });

        receiver
    }

    /// Emit one entry's header, content, and padding.  Returns `false` if the stream should stop,
    /// either because of an error (already sent on the channel) or because the receiver is gone.
    fn produce_entry(entry: &PlannedEntry, sender: &mpsc::Sender<Result<Bytes>>) -> bool {
        if sender
            .blocking_send(Ok(Bytes::copy_from_slice(entry.header.as_bytes())))
            .is_err()
        {
            debug!("byte stream receiver dropped; stopping tar generator");
            return false;
        }

        let file = match std::fs::File::open(&entry.path) {
            Ok(file) => file,
            Err(e) => {
                let _ = sender.blocking_send(
                    Err(e).context(crate::error::InputFileReadSnafu {
                        path: entry.path.clone(),
                    }),
                );
                return false;
            }
        };

        // Read no more than the planned size; the offsets of every subsequent entry depend on this
        // entry occupying exactly the space computed at plan time
        let mut reader = file.take(entry.size);
        let mut emitted = 0u64;

        loop {
            let mut chunk = vec![0u8; READ_CHUNK_SIZE.min((entry.size - emitted) as usize)];
            if chunk.is_empty() {
                break;
            }

            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(bytes_read) => {
                    chunk.truncate(bytes_read);
                    emitted += bytes_read as u64;

                    if sender.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                        debug!("byte stream receiver dropped; stopping tar generator");
                        return false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = sender.blocking_send(
                        Err(e).context(crate::error::InputFileReadSnafu {
                            path: entry.path.clone(),
                        }),
                    );
                    return false;
                }
            }
        }

        if emitted != entry.size {
            let _ = sender.blocking_send(
                crate::error::InputFileChangedSnafu {
                    path: entry.path.clone(),
                    expected: entry.size,
                    actual: emitted,
                }
                .fail(),
            );
            return false;
        }

        let padding = round_up_to_block(entry.size) - entry.size;
        if padding > 0
            && sender
                .blocking_send(Ok(Bytes::from(vec![0u8; padding as usize])))
                .is_err()
        {
            debug!("byte stream receiver dropped; stopping tar generator");
            return false;
        }

        true
    }

    /// Encode the single fixed-size header block for one file.
    fn encode_header(path: &PathBuf, metadata: &std::fs::Metadata) -> Result<tar::Header> {
        let mut header = tar::Header::new_gnu();

        header.set_entry_type(tar::EntryType::Regular);
        header
            .set_path(entry_name(path))
            .context(crate::error::TarEntryNameSnafu { path: path.clone() })?;
        header.set_size(metadata.len());
        header.set_mode(Self::entry_mode(metadata));

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        header.set_mtime(mtime);

        header.set_cksum();

        Ok(header)
    }

    #[cfg(unix)]
    fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
        use std::os::unix::fs::PermissionsExt;

        metadata.permissions().mode()
    }

    #[cfg(not(unix))]
    fn entry_mode(_metadata: &std::fs::Metadata) -> u32 {
        0o644
    }
}

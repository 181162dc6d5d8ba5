use crate::credentials::SigningVersion;
use aws_sdk_s3::error::SdkError;
use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = S3SlingError> = std::result::Result<T, E>;

/// Broad classification of an error, for callers that decide retry or reporting policy based on
/// the category rather than the specific failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A local file or remote object (or byte range thereof) doesn't exist
    NotFound,

    /// A local read or write failed
    Io,

    /// A network transfer or multipart protocol operation failed
    Transfer,

    /// The configuration or job parameters are invalid
    Config,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3SlingError {
    #[snafu(display(
        "Signing version '{version}' is not supported by the AWS SDK; use 'v4' or target a store that accepts SigV4"
    ))]
    UnsupportedSigningVersion { version: SigningVersion },

    #[snafu(display(
        "No credentials found; pass --access-key/--secret-key or set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY"
    ))]
    MissingCredentials {},

    #[snafu(display("The part size must be a positive number of bytes, got {part_size}"))]
    InvalidPartSize { part_size: u64 },

    #[snafu(display("The concurrency must be at least 1, got {concurrency}"))]
    InvalidConcurrency { concurrency: usize },

    #[snafu(display(
        "Disabling SSL requires a custom --endpoint; connections to AWS itself are always TLS"
    ))]
    PlaintextRequiresEndpoint {},

    #[snafu(display("The file list for a tar bundle upload must not be empty"))]
    EmptyFileList {},

    #[snafu(display("The input file '{}' does not exist", path.display()))]
    InputFileNotFound { path: PathBuf },

    #[snafu(display("The input path '{}' is not a regular file", path.display()))]
    InputNotAFile { path: PathBuf },

    #[snafu(display("Error reading metadata for input file '{}'", path.display()))]
    InputFileMetadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading input file '{}'", path.display()))]
    InputFileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Input file '{}' changed size mid-stream (expected {expected} bytes, read {actual}); the archive is invalid",
        path.display()
    ))]
    InputFileChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("The path '{}' cannot be encoded as a tar entry name", path.display()))]
    TarEntryName {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Manifest entry '{name}' (offset {offset}, size {size}) does not describe a retrievable byte range"
    ))]
    InvalidManifestEntry {
        name: String,
        offset: u64,
        size: u64,
    },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("The object '{key}' in S3 bucket '{bucket}' doesn't exist or is not accessible"))]
    ObjectNotFound {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error getting object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading response body for object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error putting object '{key}' in S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Error initiating multi-part upload of object '{key}' in S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' in S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: i32,
        source: SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("Error completing multi-part upload of object '{key}' in S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source:
            SdkError<aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError>,
    },

    #[snafu(display("Error aborting multi-part upload of object '{key}' in S3 bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError>,
    },

    #[snafu(display("Chunk {chunk_index} of object '{key}' in S3 bucket '{bucket}' failed to download"))]
    DownloadChunk {
        bucket: String,
        key: String,
        chunk_index: usize,
        #[snafu(source(from(S3SlingError, Box::new)))]
        source: Box<S3SlingError>,
    },

    #[snafu(display(
        "Object '{key}' in S3 bucket '{bucket}' returned {actual} bytes where {expected} were expected"
    ))]
    ShortRead {
        bucket: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("Error creating local file '{}'", path.display()))]
    CreateDestinationFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing local file '{}'", path.display()))]
    WriteDestinationFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Background worker task panicked or was cancelled"))]
    SpawnBlocking { source: tokio::task::JoinError },
}

impl S3SlingError {
    /// Classify this error per the four-way taxonomy in [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        use S3SlingError::*;

        match self {
            UnsupportedSigningVersion { .. }
            | MissingCredentials { .. }
            | InvalidPartSize { .. }
            | InvalidConcurrency { .. }
            | PlaintextRequiresEndpoint { .. }
            | EmptyFileList { .. }
            | InvalidManifestEntry { .. } => ErrorKind::Config,

            InputFileNotFound { .. }
            | InputNotAFile { .. }
            | BucketInvalidOrNotAccessible { .. }
            | ObjectNotFound { .. }
            | GetObject { .. } => ErrorKind::NotFound,

            InputFileMetadata { .. }
            | InputFileRead { .. }
            | InputFileChanged { .. }
            | TarEntryName { .. }
            | CreateDestinationFile { .. }
            | WriteDestinationFile { .. }
            | SpawnBlocking { .. } => ErrorKind::Io,

            ReadByteStream { .. }
            | PutObject { .. }
            | CreateMultipartUpload { .. }
            | UploadPart { .. }
            | CompleteMultipartUpload { .. }
            | AbortMultipartUpload { .. }
            | DownloadChunk { .. }
            | ShortRead { .. } => ErrorKind::Transfer,
        }
    }
}

#![doc = include_str!("../README.md")]

mod config;
mod credentials;
mod download;
mod error;
mod objstore;
mod retrieve;
mod tar_stream;
mod transfer;
mod upload;

pub use config::Config;
pub use credentials::{resolve_credentials, Credentials, SigningVersion};
pub use download::{DownloadJob, DownloadJobBuilder, DownloadProgressCallback, DownloadResult};
pub use error::{ErrorKind, Result, S3SlingError};
pub use retrieve::{RetrieveEntryJob, RetrieveEntryJobBuilder, RetrieveResult};
pub use tar_stream::{
    compute_range, ManifestEntry, RangeSpec, TarStream, HEADER_BLOCK_SIZE,
};
pub use upload::{
    UploadJob, UploadJobBuilder, UploadProgressCallback, UploadResult, UploadSource,
};

use crate::credentials::SigningVersion;
use crate::Result;
use url::Url;

/// The configuration settings that control how transfers are performed.
///
/// The config is constructed once, validated, and never mutated after a transfer begins.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is used only for request signing.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub(crate) endpoint: Option<Url>,

    /// The AWS region to operate in.
    ///
    /// If not set, the region is taken from the usual AWS environment config, falling back to
    /// us-east-1.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) region: Option<String>,

    /// The access key to authenticate with.
    ///
    /// If not set, the AWS_ACCESS_KEY_ID environment variable is used.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "KEY"))]
    pub(crate) access_key: Option<String>,

    /// The secret key to authenticate with.
    ///
    /// If not set, the AWS_SECRET_ACCESS_KEY environment variable is used.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "KEY"))]
    pub(crate) secret_key: Option<String>,

    /// Talk to the custom endpoint over plain HTTP instead of HTTPS.
    ///
    /// Only valid together with --endpoint; AWS itself is always TLS.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) disable_ssl: bool,

    /// Don't compute request payload checksums on uploads.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) disable_checksum: bool,

    /// Force path-style bucket addressing (`endpoint/bucket/key` rather than virtual-hosted).
    ///
    /// Most non-AWS S3-compatible services need this.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) path_style: bool,

    /// The request signing scheme to use.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, value_enum, default_value_t = SigningVersion::V4)
    )]
    pub(crate) signing_version: SigningVersion,

    /// The largest contiguous block of bytes moved by a single transfer worker.
    ///
    /// Streams larger than this are moved with concurrent multipart transfers in parts of this
    /// size; anything this size or smaller is moved in a single request.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "64MiB".
    ///
    /// Note that the maximum number of parts in an S3 multipart upload is 10,000, so for very
    /// large streams this part size is overridden if it's smaller than 1/10,000th of the stream.
    #[cfg_attr(feature = "clap", clap(long, default_value = "64MiB", global = true))]
    pub(crate) part_size: byte_unit::Byte,

    /// The maximum number of parts or chunks transferred concurrently.
    #[cfg_attr(feature = "clap", clap(long, default_value = "24", global = true))]
    pub(crate) concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: these values are duplicated here and in the `clap` attributes; there's no better
        // way without unconditionally taking a clap dependency in the lib crate
        Self {
            endpoint: None,
            region: None,
            access_key: None,
            secret_key: None,
            disable_ssl: false,
            disable_checksum: false,
            path_style: false,
            signing_version: SigningVersion::V4,
            part_size: byte_unit::Byte::from_bytes(64 * 1024 * 1024),
            concurrency: 24,
        }
    }
}

impl Config {
    /// Check the tuning parameters for validity.
    ///
    /// Called by the job builders before any transfer begins, so an invalid config is reported
    /// before any network or file I/O happens.
    pub fn validate(&self) -> Result<()> {
        let part_size = self.part_size.get_bytes() as u64;
        if part_size == 0 {
            return crate::error::InvalidPartSizeSnafu { part_size }.fail();
        }

        if self.concurrency == 0 {
            return crate::error::InvalidConcurrencySnafu {
                concurrency: self.concurrency,
            }
            .fail();
        }

        if self.disable_ssl && self.endpoint.is_none() {
            return crate::error::PlaintextRequiresEndpointSnafu {}.fail();
        }

        Ok(())
    }

    /// The configured part size in bytes.
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size.get_bytes() as u64
    }

    /// The configured maximum number of concurrent part/chunk transfers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

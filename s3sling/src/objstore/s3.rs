use super::{Bucket, CompletedPartTag};
use crate::tar_stream::RangeSpec;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use snafu::{prelude::*, IntoError};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use url::Url;

/// How many response-body chunks a streamed GET buffers before the producer blocks.
const STREAM_CHANNEL_DEPTH: usize = 16;

/// Implementation of [`Bucket`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,

    /// The region this bucket is located in, if it's different from the region specified in the
    /// config or environment.
    ///
    /// If a bucket is in a different region, then we need a different [`aws_sdk_s3::Client`]
    /// instance to talk to the S3 APIs when dealing with that bucket.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    pub(super) async fn new(config: &Config, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = make_s3_client(config, None).await?;

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.  Look for that and handle it properly.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            // This bucket is in a different region.  Oops.
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(config, Some(region.clone())).await?;

            // Repeat the validation again.
            // This can fail if we don't have access, but if it reports again that the region is
            // wrong then something has gone really wrong, or (more likely) there's a bug in our
            // code.
            assert_eq!(
                Self::validate_access_and_region(&client, name).await?,
                None,
                "S3 has already redirected us to another region once before"
            );

            Some(region)
        } else {
            // Bucket is in the default region so no override needed
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                region,
                client,
            }),
        })
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        if let Err(e) = client.head_bucket().bucket(name).send().await {
            if let SdkError::ServiceError(context) = &e {
                let response = context.raw();
                if response.status().as_u16() == 301 {
                    if let Some(region) = response.headers().get("x-amz-bucket-region") {
                        // This is AWS's way of telling us we have the right bucket, but it is in
                        // another region so we should use the appropriate region endpoint
                        return Ok(Some(region.to_string()));
                    }
                }
            }

            Err(crate::error::BucketInvalidOrNotAccessibleSnafu {
                bucket: name.to_string(),
            }
            .into_error(e))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn get_object_size(&self, key: &str) -> Result<u64> {
        let metadata = self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::ObjectNotFoundSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(metadata.content_length().unwrap_or_default() as u64)
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, bytes = data.len()))]
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        debug!("Putting whole object in a single request");

        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        debug!("Reading partial object");

        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        let bytes = response.body.collect().await.with_context(|_| {
            crate::error::ReadByteStreamSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            }
        })?;

        Ok(bytes.into_bytes())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object_stream(
        &self,
        key: &str,
        range: RangeSpec,
    ) -> Result<mpsc::Receiver<Result<Bytes>>> {
        debug!("Reading object range as a stream");

        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .range(range.to_http_range())
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let bucket = self.inner.name.clone();
        let key = key.to_string();
        let mut body = response.body;

        tokio::spawn(async move {
            loop {
                match body.try_next().await {
                    Ok(Some(bytes)) => {
                        if sender.send(Ok(bytes)).await.is_err() {
                            debug!("body stream receiver dropped; abandoning the read");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = sender
                            .send(Err(crate::error::ReadByteStreamSnafu { bucket, key }
                                .into_error(e)))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(receiver)
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string())
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, bytes = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPartTag> {
        debug!("Uploading multi-part part");

        let response = self
            .inner
            .client
            .upload_part()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
                part_number,
            })?;

        let e_tag = response
            .e_tag()
            .expect("BUG: uploaded part missing etag")
            .to_string();

        debug!(%e_tag, "Uploaded multi-part part");

        Ok(CompletedPartTag { part_number, e_tag })
    }

    #[instrument(skip(self, parts), fields(bucket = %self.inner.name, parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartTag>,
    ) -> Result<()> {
        let completed_parts = parts
            .into_iter()
            .map(|tag| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(tag.e_tag)
                    .part_number(tag.part_number)
                    .build()
            })
            .collect::<Vec<_>>();

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner
            .client
            .abort_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client from the transfer config.
///
/// The credentials and the signing strategy are fixed here, once, before the client exists;
/// nothing about the client's configuration changes afterwards.
async fn make_s3_client(
    config: &Config,
    region_override: Option<String>,
) -> Result<aws_sdk_s3::Client> {
    // The SDK implements exactly one signing scheme.  Settle the strategy now rather than
    // failing on the first request.
    match config.signing_version {
        crate::credentials::SigningVersion::V4 => {}
        version @ crate::credentials::SigningVersion::V2 => {
            return crate::error::UnsupportedSigningVersionSnafu { version }.fail();
        }
    }

    let credentials = crate::credentials::resolve_credentials(
        config.access_key.as_deref(),
        config.secret_key.as_deref(),
        |name| std::env::var(name).ok(),
    )?;

    let region_provider = if let Some(region) = region_override.or_else(|| config.region.clone()) {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let aws_config = aws_config::from_env()
        .region(region_provider)
        .credentials_provider(aws_credential_types::Credentials::from_keys(
            credentials.access_key,
            credentials.secret_key,
            None,
        ))
        .load()
        .await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.path_style);

    if let Some(endpoint) = &config.endpoint {
        s3_config_builder = s3_config_builder.endpoint_url(endpoint_url(endpoint, config.disable_ssl));
    }

    if config.disable_checksum {
        s3_config_builder = s3_config_builder.request_checksum_calculation(
            aws_sdk_s3::config::RequestChecksumCalculation::WhenRequired,
        );
    }

    Ok(aws_sdk_s3::Client::from_conf(s3_config_builder.build()))
}

/// Render the custom endpoint for the SDK, downgrading to plain HTTP when SSL is disabled.
fn endpoint_url(endpoint: &Url, disable_ssl: bool) -> String {
    if disable_ssl && endpoint.scheme() == "https" {
        let mut endpoint = endpoint.clone();
        warn!(%endpoint, "SSL is disabled; connecting to the endpoint over plain HTTP");

        // `set_scheme` only fails for scheme combinations that can't occur here
        let _ = endpoint.set_scheme("http");
        endpoint.to_string()
    } else {
        endpoint.to_string()
    }
}

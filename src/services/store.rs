use crate::error::TransportError;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;

/// Remote object metadata from the endpoint's `HeadObject`.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub size: i64,
    /// Content digest, when the ETag is a plain MD5 hex digest. Multipart
    /// ETags (containing `-`) carry no usable digest.
    pub digest: Option<String>,
}

/// The remote-call seam of the pipeline. One implementation per profile;
/// tests drive the executor with stubs instead of a live endpoint.
///
/// Every error crossing this boundary is already classified transient vs.
/// permanent (see [`TransportError`]); callers never re-classify.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All bucket names visible to this profile's credentials.
    async fn list_buckets(&self) -> Result<Vec<String>, TransportError>;

    /// Metadata of the remote object, or `None` when it does not exist.
    ///
    /// Endpoints without metadata support fail with
    /// [`TransportError::Unsupported`], which callers degrade on rather
    /// than treat as an error.
    async fn head_object(&self, bucket: &str, key: &str)
        -> Result<Option<RemoteObject>, TransportError>;

    /// Uploads the local file at `path` to `bucket/key`, overwriting any
    /// existing object.
    async fn put_object(&self, bucket: &str, key: &str, path: &Path)
        -> Result<(), TransportError>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_buckets(&self) -> Result<Vec<String>, TransportError> {
        let res = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| classify("ListBuckets", "", e))?;

        Ok(res
            .buckets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| b.name)
            .collect())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<RemoteObject>, TransportError> {
        let res = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(output) => {
                let digest = output.e_tag().and_then(etag_digest);
                Ok(Some(RemoteObject {
                    size: output.content_length().unwrap_or(0),
                    digest,
                }))
            }
            Err(e) => {
                // NotFound is not an error, the object simply doesn't exist.
                if e.as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(classify("HeadObject", bucket, e))
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), TransportError> {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            TransportError::Other(format!("cannot read {} for upload: {e}", path.display()))
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify("PutObject", bucket, e))?;
        Ok(())
    }
}

/// Extracts an MD5 hex digest from an ETag, when it is one. Multipart ETags
/// look like `"abc123-5"` and carry no whole-object digest.
fn etag_digest(etag: &str) -> Option<String> {
    let clean = etag.trim_matches('"');
    if clean.len() == 32 && !clean.contains('-') {
        Some(clean.to_ascii_lowercase())
    } else {
        None
    }
}

/// Maps an SDK error into the pipeline's failure classification. This is the
/// single point where transient vs. permanent is decided.
fn classify<E>(op: &str, bucket: &str, err: SdkError<E>) -> TransportError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => return TransportError::Timeout(op.to_string()),
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() {
                return TransportError::Timeout(op.to_string());
            }
            if failure.is_user() {
                return TransportError::MalformedRequest(format!("{op} on '{bucket}'"));
            }
            // Connection resets, refused connections and DNS resolution
            // failures all surface as connector dispatch failures.
            return TransportError::ConnectionReset(format!("{op} on '{bucket}'"));
        }
        SdkError::ResponseError(_) => {
            return TransportError::ConnectionReset(format!("{op} on '{bucket}'"));
        }
        _ => {}
    }

    let status = match &err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{op} on '{bucket}' failed"));

    match (err.code(), status) {
        (Some("NoSuchBucket"), _) => TransportError::BucketNotFound(bucket.to_string()),
        (
            Some(
                "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken",
            ),
            _,
        )
        | (None, Some(401 | 403)) => TransportError::Auth(message),
        (Some("RequestTimeout"), _) => TransportError::Timeout(op.to_string()),
        (Some("NotImplemented" | "MethodNotAllowed"), _) | (None, Some(405 | 501)) => {
            TransportError::Unsupported(format!("{op} on '{bucket}'"))
        }
        (Some("MalformedXML" | "InvalidRequest" | "InvalidArgument"), _) => {
            TransportError::MalformedRequest(message)
        }
        // Fail closed: unclassified errors are permanent.
        _ => TransportError::Other(message),
    }
}

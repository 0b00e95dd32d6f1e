//! S3-compatible backend
//!
//! Speaks to the upstream bucket through `aws-sdk-s3` with the vault's
//! unwrapped API-key credentials. Custom endpoints (MinIO, Ceph RGW, ...)
//! use path-style addressing.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};

use vaulthalla_core::{Error, Result};

use crate::backend::{ObjectMeta, VaultBackend};

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "vaulthalla");
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .credentials_provider(credentials);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Classify an SDK failure into the retry taxonomy: credential errors
    /// are fatal, missing keys are `NotFound`, the rest retries as
    /// `Transient`.
    fn map_err<E>(err: &E, context: &str) -> Error
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
    {
        match err.code() {
            Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch")
            | Some("ExpiredToken") | Some("TokenRefreshRequired") => {
                Error::Unauthorized(format!("{context}: {}", err.message().unwrap_or("access denied")))
            }
            Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
                Error::NotFound(context.to_string())
            }
            _ => Error::Transient(format!("{context}: {err:?}")),
        }
    }
}

#[async_trait]
impl VaultBackend for S3Backend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_err(&e, &format!("get s3://{}/{key}", self.bucket)))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Transient(format!("read s3://{}/{key} body: {e}", self.bucket)))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(&e, &format!("put s3://{}/{key}", self.bucket)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(&e, &format!("delete s3://{}/{key}", self.bucket)))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{from}", self.bucket))
            .key(to)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(&e, &format!("copy s3://{}/{from}", self.bucket)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::map_err(&e, "head object") {
                Error::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| Self::map_err(&e, &format!("list s3://{}/{prefix}", self.bucket)))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0)),
                });
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn free_space(&self) -> Result<Option<u64>> {
        // Buckets do not advertise capacity.
        Ok(None)
    }
}

//! Uploads restored snapshot archives into an S3 bucket.
//!
//! The destination endpoint carries the bucket as its first path segment
//! (`https://minio.local:9000/restores`); further segments become a key prefix.

use std::path::Path;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use reqwest::Url;
use tracing::info;

use crate::error::RepositoryError;
use crate::request::S3Destination;

const DEFAULT_REGION: &str = "us-east-1";

/// Bucket location split out of a destination endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketLocation {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
}

impl BucketLocation {
    pub(crate) fn parse(endpoint: &str) -> Result<Self, RepositoryError> {
        let url = Url::parse(endpoint.trim())
            .map_err(|e| RepositoryError::Unsupported(format!("invalid s3 endpoint {endpoint}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| RepositoryError::Unsupported(format!("s3 endpoint {endpoint} has no host")))?;

        let mut segments = url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty());
        let bucket = segments
            .next()
            .ok_or_else(|| RepositoryError::Unsupported(format!("s3 endpoint {endpoint} names no bucket")))?
            .to_string();
        let prefix = segments.collect::<Vec<_>>().join("/");

        let endpoint = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };
        Ok(Self {
            endpoint,
            bucket,
            prefix,
        })
    }

    pub(crate) fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }
}

pub(crate) struct S3Upload {
    client: Client,
    location: BucketLocation,
}

impl S3Upload {
    pub(crate) fn new(destination: &S3Destination) -> Result<Self, RepositoryError> {
        let location = BucketLocation::parse(&destination.endpoint)?;
        let credentials = Credentials::new(
            destination.access_key_id.clone(),
            destination.secret_access_key.clone(),
            None,
            None,
            "restore-destination",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .endpoint_url(location.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();
        Ok(Self {
            client: Client::from_conf(config),
            location,
        })
    }

    /// Upload `file` as object `name`; returns the full object key
    pub(crate) async fn upload(&self, name: &str, file: &Path) -> Result<String, RepositoryError> {
        let key = self.location.key(name);
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| RepositoryError::Upload {
                key: key.clone(),
                message: e.to_string(),
            })?;
        self.client
            .put_object()
            .bucket(&self.location.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| RepositoryError::Upload {
                key: key.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        info!(bucket = %self.location.bucket, key = %key, "uploaded restore archive");
        Ok(key)
    }
}

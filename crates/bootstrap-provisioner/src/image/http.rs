//! Remote image served over HTTP(S)

use super::{is_qcow2_magic, Copier, Image, ImportOutcome, QCOW2_MAGIC};
use crate::backoff::{FixedBackoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_WAIT};
use crate::error::ImageError;
use chrono::{DateTime, Utc};
use libvirt_client::VolumeDescription;
use reqwest::header::{CONTENT_LENGTH, IF_MODIFIED_SINCE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Image downloaded from a URL
#[derive(Debug, Clone)]
pub struct HttpImage {
    url: String,
    client: Client,
    max_attempts: u32,
    retry_wait: Duration,
}

impl HttpImage {
    /// Create a new remote image
    ///
    /// # Arguments
    /// * `url` - http or https URL of the image
    pub fn new(url: impl Into<String>) -> Result<Self, ImageError> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(url, client))
    }

    /// Create a remote image using an existing HTTP client
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }

    /// Change the wait between download attempts on server errors
    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn unexpected(&self, response: &Response, expected: &'static str) -> ImageError {
        ImageError::UnexpectedStatus {
            url: self.url.clone(),
            status: response.status().as_u16(),
            expected,
        }
    }
}

impl fmt::Display for HttpImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Format a time as an HTTP date (RFC 7231 IMF-fixdate)
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[async_trait::async_trait]
impl Image for HttpImage {
    async fn size(&self) -> Result<u64, ImageError> {
        let mut response = self.client.head(&self.url).send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            // Some object stores reject HEAD on signed URLs; a GET carries the same headers
            debug!("HEAD {} rejected with 403, retrying with GET", self.url);
            response = self.client.get(&self.url).send().await?;
        }
        if response.status() != StatusCode::OK {
            return Err(self.unexpected(&response, "200"));
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| ImageError::ContentLength(self.url.clone()))
    }

    async fn is_qcow2(&self) -> Result<bool, ImageError> {
        let range = format!("bytes=0-{}", QCOW2_MAGIC.len() - 1);
        let response = self.client.get(&self.url).header(RANGE, range).send().await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(self.unexpected(&response, "206"));
        }
        let header = response.bytes().await?;
        Ok(is_qcow2_magic(&header))
    }

    async fn import(&self, copier: &dyn Copier, target: &VolumeDescription) -> Result<ImportOutcome, ImageError> {
        let mut backoff = FixedBackoff::new(self.max_attempts, self.retry_wait);

        loop {
            let mut request = self.client.get(&self.url);
            if let Some(mtime) = target.mtime {
                request = request.header(IF_MODIFIED_SINCE, http_date(mtime));
            }
            let mut response = request.send().await?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                info!("Volume {} is up to date with {}, skipping download", target.name, self.url);
                return Ok(ImportOutcome::Skipped);
            }

            if status == StatusCode::OK {
                let mut writer = copier.open().await?;
                while let Some(chunk) = response.chunk().await? {
                    writer.write(&chunk).await?;
                }
                let bytes = writer.finish().await?;
                return Ok(ImportOutcome::Copied { bytes });
            }

            if status.is_server_error() {
                match backoff.next_backoff() {
                    Some(wait) => {
                        debug!(
                            "GET {} returned {} (attempt {}/{}), retrying in {:?}",
                            self.url,
                            status.as_u16(),
                            backoff.failures(),
                            self.max_attempts,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => {
                        warn!("GET {} kept failing with {}", self.url, status.as_u16());
                        return Err(ImageError::RetriesExhausted {
                            url: self.url.clone(),
                            attempts: backoff.failures(),
                            status: status.as_u16(),
                        });
                    }
                }
            }

            return Err(self.unexpected(&response, "200 or 304"));
        }
    }
}

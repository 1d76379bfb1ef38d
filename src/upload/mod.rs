use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::markup::{self, MarkupError};

pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
pub const FILE_NAME_HEADER: &str = "X-File-Name";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("minification failed: {0}")]
    Minify(#[from] MarkupError),
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
    #[error("minified payload is empty")]
    EmptyPayload,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Http status: {0}")]
    Status(u16),
}

/// Posts gzip-compressed reports to the collector
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl Uploader {
    /// The client only bounds connection setup; a slow collector may take as
    /// long as it needs to answer.
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }

    /// Minify, compress and send one payload; only `200 OK` counts as delivered
    pub async fn upload(&self, filename: &str, payload: &[u8]) -> Result<(), UploadError> {
        let body = encode_payload(payload)?;
        debug!(
            "[FILE: {}] Posting {} compressed bytes ({} raw)",
            filename,
            body.len(),
            payload.len()
        );

        let response = self
            .client
            .post(&self.url)
            .header(ACCESS_TOKEN_HEADER, &self.token)
            .header(FILE_NAME_HEADER, filename)
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(UploadError::Status(status.as_u16())),
        }
    }
}

/// Body of an upload request: gzip over the minified document
pub fn encode_payload(payload: &[u8]) -> Result<Vec<u8>, UploadError> {
    let minified = markup::minify(payload)?;
    if minified.is_empty() {
        return Err(UploadError::EmptyPayload);
    }
    compress(&minified)
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, UploadError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

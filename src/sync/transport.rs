//! # Upload Transport
//!
//! Moves a batch of records to the remote endpoint. The batch travels as a
//! JSON Lines file in a multipart `file` field; a success response may
//! carry `{"uploaded": n}`, which is reported but never trusted for
//! progress tracking.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use super::record::Record;
use crate::error::{AgentError, Result};

/// Records packaged for one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub source: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub record_count: usize,
    /// JSON Lines, one record per line.
    pub body: Bytes,
}

impl UploadBatch {
    /// Packages `records`; `None` if there are none.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Json`] if a payload cannot be serialized.
    pub fn from_records(source: &str, records: &[Record]) -> Result<Option<Self>> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(None);
        };

        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }

        Ok(Some(Self {
            source: source.to_string(),
            first_seq: first.seq,
            last_seq: last.seq,
            record_count: records.len(),
            body: Bytes::from(body),
        }))
    }

    /// File name sent with the multipart field.
    pub fn file_name(&self) -> String {
        let stem = self.source.strip_suffix(".jsonl").unwrap_or(&self.source);
        format!("{}-{}-{}.jsonl", stem, self.first_seq, self.last_seq)
    }
}

/// Server acknowledgement of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    /// Count the server says it stored, when it says.
    pub uploaded: Option<u64>,
}

impl UploadReceipt {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Delivers upload batches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Sends one batch to `endpoint`.
    async fn upload(&self, endpoint: &str, batch: &UploadBatch) -> Result<UploadReceipt>;
}

/// HTTP multipart uploader.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpUploader {
    /// Creates an uploader; an empty `token` sends no `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Http`] if the client cannot be built.
    pub fn new(token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("recon-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            token: (!token.is_empty()).then(|| token.to_string()),
        })
    }
}

#[async_trait]
impl UploadTransport for HttpUploader {
    async fn upload(&self, endpoint: &str, batch: &UploadBatch) -> Result<UploadReceipt> {
        let file = Part::bytes(batch.body.to_vec())
            .file_name(batch.file_name())
            .mime_str("application/x-ndjson")?;
        let form = Form::new()
            .text("source", batch.source.clone())
            .text("first_seq", batch.first_seq.to_string())
            .text("last_seq", batch.last_seq.to_string())
            .part("file", file);

        let mut request = self.client.post(endpoint).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::UploadRejected(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        let receipt = UploadReceipt {
            status: status.as_u16(),
            uploaded: parse_uploaded(&body),
        };
        debug!(endpoint, status = receipt.status, uploaded = ?receipt.uploaded, "Upload accepted");
        Ok(receipt)
    }
}

#[derive(Deserialize)]
struct UploadSummary {
    uploaded: Option<u64>,
}

/// Reads `{"uploaded": n}` from a response body, if present.
fn parse_uploaded(body: &str) -> Option<u64> {
    serde_json::from_str::<UploadSummary>(body)
        .ok()
        .and_then(|s| s.uploaded)
}

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::UploaderConfig;
use crate::models::{ContentDigest, TransferId};

/// Transport-level failures. All of them are retryable at the chunk
/// level; the dedup check additionally degrades to "nothing exists".
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInstantRequest {
    pub transfer_id: TransferId,
    pub file_digest: ContentDigest,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    pub chunk_digests: Vec<ContentDigest>,
}

/// Server verdict for one chunk. A chunk is already uploaded only when it
/// both exists and matches; existing-but-mismatched chunks are re-sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkCheck {
    pub index: u32,
    pub exist: bool,
    #[serde(rename = "match")]
    pub matches: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInstantResponse {
    pub uploaded: bool,
    #[serde(default)]
    pub chunk_check_result: Vec<ChunkCheck>,
}

#[derive(Debug, Clone)]
pub struct UploadChunkRequest {
    pub transfer_id: TransferId,
    pub chunk_digest: ContentDigest,
    pub index: u32,
    pub bytes: Bytes,
    pub name: String,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRequest {
    pub transfer_id: TransferId,
    pub file_digest: ContentDigest,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
}

/// The four server operations the engine consumes. Request/response
/// shaped; HTTP is the production transport but tests drive the engine
/// through in-memory implementations.
#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn check_instant(
        &self,
        request: &CheckInstantRequest,
    ) -> Result<CheckInstantResponse, ApiError>;

    /// Chunk indices the server already holds for this transfer.
    async fn get_status(
        &self,
        transfer_id: &TransferId,
        file_digest: &ContentDigest,
    ) -> Result<Vec<u32>, ApiError>;

    async fn upload_chunk(&self, request: UploadChunkRequest) -> Result<(), ApiError>;

    /// Combines all confirmed chunks server-side; returns the final
    /// stored location.
    async fn merge(&self, request: &MergeRequest) -> Result<String, ApiError>;
}

/// Structured success/failure envelope every endpoint responds with.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    transfer_id: &'a TransferId,
    file_digest: &'a ContentDigest,
}

/// Ack payload of the upload endpoint; the server echoes the digest it
/// computed for the stored chunk.
#[derive(Debug, Deserialize)]
struct UploadAck {
    #[serde(rename = "chunkDigestConfirmed")]
    chunk_digest_confirmed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MergeData {
    final_location: String,
}

/// HTTP implementation of [`TransferApi`].
pub struct HttpTransferApi {
    client: reqwest::Client,
    config: UploaderConfig,
}

impl HttpTransferApi {
    pub fn new(config: UploaderConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }
        if let Some(transform) = &self.config.transform {
            builder = transform(builder);
        }
        builder
    }

    /// Sends and unwraps the envelope: HTTP failures and
    /// `success: false` become [`ApiError::Rejected`]; the (possibly
    /// absent) data payload is left to the caller.
    async fn send_envelope<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Envelope<T>, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Rejected(format!("http status {status}")));
        }
        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope.message.unwrap_or_else(|| "unspecified".into()),
            ));
        }
        Ok(envelope)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        self.send_envelope(builder)
            .await?
            .data
            .ok_or_else(|| ApiError::Decode("envelope missing data".into()))
    }
}

/// Cross-checks the digest the server claims to have stored against the
/// digest of the bytes that were sent. A mismatch means corruption in
/// flight or at rest; the attempt is treated as failed so the retry
/// policy re-sends the chunk. An ack without an echoed digest passes.
fn verify_chunk_ack(
    expected: &ContentDigest,
    index: u32,
    ack: Option<UploadAck>,
) -> Result<(), ApiError> {
    match ack.and_then(|a| a.chunk_digest_confirmed) {
        Some(confirmed) if confirmed != expected.as_str() => Err(ApiError::Rejected(format!(
            "server stored digest {confirmed} for chunk {index}, sent {expected}"
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl TransferApi for HttpTransferApi {
    async fn check_instant(
        &self,
        request: &CheckInstantRequest,
    ) -> Result<CheckInstantResponse, ApiError> {
        self.send(self.post(&self.config.check_endpoint).json(request))
            .await
    }

    async fn get_status(
        &self,
        transfer_id: &TransferId,
        file_digest: &ContentDigest,
    ) -> Result<Vec<u32>, ApiError> {
        let body = StatusRequest {
            transfer_id,
            file_digest,
        };
        self.send(self.post(&self.config.status_endpoint).json(&body))
            .await
    }

    async fn upload_chunk(&self, request: UploadChunkRequest) -> Result<(), ApiError> {
        // Chunk bytes travel as the raw body; metadata rides in the query
        // string so the payload is never re-encoded.
        let builder = self
            .post(&self.config.upload_endpoint)
            .query(&[
                ("transfer_id", request.transfer_id.as_str()),
                ("chunk_digest", request.chunk_digest.as_str()),
                ("index", &request.index.to_string()),
                ("name", &request.name),
                ("total_chunks", &request.total_chunks.to_string()),
            ])
            .body(request.bytes.clone());
        let envelope: Envelope<UploadAck> = self.send_envelope(builder).await?;
        verify_chunk_ack(&request.chunk_digest, request.index, envelope.data)
    }

    async fn merge(&self, request: &MergeRequest) -> Result<String, ApiError> {
        let data: MergeData = self
            .send(self.post(&self.config.merge_endpoint).json(request))
            .await?;
        Ok(data.final_location)
    }
}

//! Audio transcription built on the job engine.
//!
//! `transcribeChunks` fans a list of audio chunks out into one
//! `transcribeChunk` job per chunk. Each chunk job calls the ASR service
//! through its own [`ConcurrencyGate`], independent of the job pool's gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use std::{num::NonZeroUsize, sync::Arc};

use super::{
    CurrentJob, JobHandler, JobId, JobSpawner,
    aggregate::{FanOut, ResultAggregator},
    entity::{Job, JobType},
    gate::ConcurrencyGate,
    runner::HandlerError,
    store::JobStore,
};

pub const TRANSCRIBE_CHUNKS: JobType = JobType::new("transcribeChunks");
pub const TRANSCRIBE_CHUNK: JobType = JobType::new("transcribeChunk");

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_asr_base_url")]
    pub asr_base_url: String,
    #[serde(default = "default_asr_concurrency")]
    /// Maximum concurrent requests to the ASR service from this process.
    pub asr_concurrency: NonZeroUsize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            asr_base_url: default_asr_base_url(),
            asr_concurrency: default_asr_concurrency(),
        }
    }
}

fn default_asr_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_asr_concurrency() -> NonZeroUsize {
    const DEFAULT: NonZeroUsize = NonZeroUsize::new(5).unwrap();
    DEFAULT
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeChunksArgs {
    pub audio_chunk_paths: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeChunkArgs {
    pub audio_chunk_path: String,
    pub idx: usize,
    pub parent_job: JobId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanOutAck {
    pub okay: bool,
}

/// Spawns one `transcribeChunk` job per audio chunk and returns without
/// waiting for them.
///
/// Children are not deduplicated: if this job is retried after spawning some
/// of them, the retry spawns another full set.
pub struct TranscribeChunksHandler {
    chunk_spawner: JobSpawner<TranscribeChunkArgs>,
}

impl TranscribeChunksHandler {
    pub fn new(chunk_spawner: JobSpawner<TranscribeChunkArgs>) -> Self {
        Self { chunk_spawner }
    }
}

#[async_trait]
impl JobHandler for TranscribeChunksHandler {
    type Args = TranscribeChunksArgs;
    type Output = FanOutAck;

    fn job_type(&self) -> JobType {
        TRANSCRIBE_CHUNKS
    }

    async fn run(
        &self,
        args: TranscribeChunksArgs,
        current_job: CurrentJob,
    ) -> Result<FanOutAck, HandlerError> {
        for (idx, audio_chunk_path) in args.audio_chunk_paths.into_iter().enumerate() {
            self.chunk_spawner
                .spawn(
                    current_job.owner_id(),
                    TranscribeChunkArgs {
                        audio_chunk_path,
                        idx,
                        parent_job: current_job.id(),
                    },
                )
                .await?;
        }
        Ok(FanOutAck { okay: true })
    }
}

#[derive(Error, Debug)]
pub enum AsrError {
    #[error("{0}")]
    Remote(String),
    #[error("Error {status} {reason}")]
    Status { status: u16, reason: String },
    #[error("AsrError - Reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
}

#[async_trait]
/// Remote speech recognition service.
pub trait AsrClient: Send + Sync + 'static {
    /// Transcribe one audio chunk. The returned body carries a `transcript` field.
    async fn transcribe(&self, audio_chunk_path: &str) -> Result<JsonValue, AsrError>;
}

/// [`AsrClient`] speaking HTTP to `GET {base_url}/get-asr-output?path=..`.
pub struct HttpAsrClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAsrClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AsrClient for HttpAsrClient {
    #[instrument(name = "asr.transcribe", skip(self), err)]
    async fn transcribe(&self, audio_chunk_path: &str) -> Result<JsonValue, AsrError> {
        let response = self
            .client
            .get(format!("{}/get-asr-output", self.base_url.trim_end_matches('/')))
            .query(&[("path", audio_chunk_path)])
            .send()
            .await?;
        let status = response.status();
        let body: Option<JsonValue> = response.json().await.ok();
        check_asr_response(status, body)
    }
}

/// Any non-200 status, or an `error` field in the body, is a failure.
fn check_asr_response(
    status: reqwest::StatusCode,
    body: Option<JsonValue>,
) -> Result<JsonValue, AsrError> {
    let remote_error = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .filter(|e| !e.is_null())
        .map(|e| match e.as_str() {
            Some(s) => s.to_string(),
            None => e.to_string(),
        });
    if let Some(error) = remote_error {
        return Err(AsrError::Remote(error));
    }
    match body {
        Some(body) if status == reqwest::StatusCode::OK => Ok(body),
        _ => Err(AsrError::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }),
    }
}

/// Sends one audio chunk to the ASR service.
pub struct TranscribeChunkHandler {
    client: Arc<dyn AsrClient>,
    gate: ConcurrencyGate,
}

impl TranscribeChunkHandler {
    pub fn new(client: Arc<dyn AsrClient>, asr_concurrency: NonZeroUsize) -> Self {
        Self {
            client,
            gate: ConcurrencyGate::new(asr_concurrency),
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self::new(
            Arc::new(HttpAsrClient::new(config.asr_base_url.clone())),
            config.asr_concurrency,
        )
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }
}

#[async_trait]
impl JobHandler for TranscribeChunkHandler {
    type Args = TranscribeChunkArgs;
    type Output = JsonValue;

    fn job_type(&self) -> JobType {
        TRANSCRIBE_CHUNK
    }

    async fn run(&self, args: TranscribeChunkArgs, _: CurrentJob) -> Result<JsonValue, HandlerError> {
        let output = self
            .gate
            .run(self.client.transcribe(&args.audio_chunk_path))
            .await?;
        Ok(output)
    }
}

fn transcript_text(result: &JsonValue) -> Option<String> {
    result
        .get("transcript")
        .and_then(|t| t.as_str())
        .map(str::to_owned)
}

fn audio_chunk_path(child: &Job) -> String {
    child
        .args
        .get("audioChunkPath")
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string()
}

pub const TRANSCRIPTS: FanOut = FanOut {
    parent_type: TRANSCRIBE_CHUNKS,
    child_type: TRANSCRIBE_CHUNK,
    result_text: transcript_text,
    chunk_label: audio_chunk_path,
};

/// Aggregator answering transcript status and search queries.
pub fn transcripts(store: Arc<dyn JobStore>) -> ResultAggregator {
    ResultAggregator::new(store, TRANSCRIPTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn ok_response_is_returned_as_result() {
        let body = json!({ "transcript": "hello" });
        assert_eq!(
            check_asr_response(StatusCode::OK, Some(body.clone())).unwrap(),
            body
        );
    }

    #[test]
    fn error_status_prefers_remote_message() {
        let err = check_asr_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(json!({ "error": "model overloaded" })),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "model overloaded");

        let err = check_asr_response(StatusCode::BAD_GATEWAY, None).unwrap_err();
        assert_eq!(err.to_string(), "Error 502 Bad Gateway");
    }

    #[test]
    fn error_field_in_ok_body_is_a_failure() {
        let err = check_asr_response(StatusCode::OK, Some(json!({ "error": "bad audio" })))
            .unwrap_err();
        assert!(matches!(err, AsrError::Remote(msg) if msg == "bad audio"));
    }

    #[test]
    fn chunk_args_use_camel_case_parent_reference() {
        let parent = JobId::new();
        let args = TranscribeChunkArgs {
            audio_chunk_path: "a.wav".to_string(),
            idx: 2,
            parent_job: parent,
        };
        let value = serde_json::to_value(args).unwrap();
        assert_eq!(value["parentJob"], json!(parent.to_string()));
        assert_eq!(value["audioChunkPath"], json!("a.wav"));
        assert_eq!(value["idx"], json!(2));
    }

    #[test]
    fn asr_concurrency_must_be_positive() {
        let config: TranscriptionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.asr_concurrency.get(), 5);
        assert!(serde_json::from_str::<TranscriptionConfig>(r#"{ "asr_concurrency": 0 }"#).is_err());
    }
}

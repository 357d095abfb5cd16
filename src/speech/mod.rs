//! External speech services: transcription and synthesis.
//!
//! Both calls are I/O-bound single requests against the speech API and run
//! on the caller's task, never on the event bus or aggregator.

pub mod stt;
pub mod tts;

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RuntimeConfig, SpeechSettings};

/// Speech service failures.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("speech service returned {status}")]
    Upstream { status: u16, body: String },
    #[error("audio payload exceeds {max} bytes")]
    TooLarge { max: usize },
}

/// Transcription result.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Synthesized audio bytes with their media type.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Seam for the external speech vendor, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechApi: Send + Sync {
    /// Transcribe an audio body. Retries once on transport errors; 4xx/5xx
    /// responses are surfaced without retry.
    async fn transcribe(
        &self,
        audio: &[u8],
        mime: &str,
        config: &RuntimeConfig,
    ) -> Result<Transcript, SpeechError>;

    /// Synthesize speech, truncating the text to `max_chars` codepoints
    /// before sending.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        max_chars: usize,
    ) -> Result<SynthesizedAudio, SpeechError>;
}

/// HTTP client for the speech API.
#[derive(Clone)]
pub struct SpeechClient {
    http: Arc<Client>,
    base_url: String,
    api_key: String,
    max_body: usize,
}

impl SpeechClient {
    pub fn new(settings: &SpeechSettings, api_key: String, max_body: usize) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http: Arc::new(http),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_body,
        }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }

    pub(crate) fn max_body(&self) -> usize {
        self.max_body
    }
}

#[async_trait]
impl SpeechApi for SpeechClient {
    async fn transcribe(
        &self,
        audio: &[u8],
        mime: &str,
        config: &RuntimeConfig,
    ) -> Result<Transcript, SpeechError> {
        stt::transcribe(self, audio, mime, config).await
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        max_chars: usize,
    ) -> Result<SynthesizedAudio, SpeechError> {
        tts::synthesize(self, text, voice, max_chars).await
    }
}

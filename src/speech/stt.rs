//! Speech-to-text over the vendor's `/v1/listen` endpoint.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SpeechClient, SpeechError, Transcript};
use crate::config::RuntimeConfig;

/// Transcribe a raw audio body. The response carries one alternative list
/// per channel; the best alternative of each channel is concatenated.
pub(super) async fn transcribe(
    client: &SpeechClient,
    audio: &[u8],
    mime: &str,
    config: &RuntimeConfig,
) -> Result<Transcript, SpeechError> {
    if audio.len() > client.max_body() {
        return Err(SpeechError::TooLarge {
            max: client.max_body(),
        });
    }

    let url = format!("{}/v1/listen", client.base_url());
    let mut params: Vec<(String, String)> = vec![
        ("model".to_string(), config.stt_model.clone()),
        ("language".to_string(), config.stt_language.clone()),
    ];
    for (key, value) in &config.stt_options {
        params.push((key.clone(), value.clone()));
    }

    // One retry on transport errors only; HTTP error statuses are final.
    let mut attempt = 0;
    let response = loop {
        let result = client
            .http()
            .post(&url)
            .query(&params)
            .header(AUTHORIZATION, client.auth_header())
            .header(CONTENT_TYPE, mime)
            .body(audio.to_vec())
            .send()
            .await;
        match result {
            Ok(response) => break response,
            Err(err) if attempt == 0 => {
                attempt += 1;
                warn!("transcription request failed, retrying once: {}", err);
            }
            Err(err) => return Err(err.into()),
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SpeechError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let body: ListenResponse = response.json().await?;
    let transcript = body.into_transcript();
    debug!(
        "transcribed {} bytes of {} into {} chars",
        audio.len(),
        mime,
        transcript.text.chars().count()
    );
    Ok(transcript)
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    #[serde(default)]
    results: ListenResults,
}

#[derive(Debug, Default, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}

impl ListenResponse {
    fn into_transcript(self) -> Transcript {
        let mut parts = Vec::new();
        let mut confidence: Option<f64> = None;
        for channel in self.results.channels {
            if let Some(best) = channel.alternatives.into_iter().next() {
                if !best.transcript.trim().is_empty() {
                    parts.push(best.transcript.trim().to_string());
                }
                if let Some(c) = best.confidence {
                    confidence = Some(confidence.map_or(c, |prev: f64| prev.max(c)));
                }
            }
        }
        Transcript {
            text: parts.join(" "),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_channel_concatenation() {
        let body = r#"{
            "results": {
                "channels": [
                    {"alternatives": [
                        {"transcript": "hello there", "confidence": 0.98},
                        {"transcript": "hollow there", "confidence": 0.4}
                    ]},
                    {"alternatives": [{"transcript": "general", "confidence": 0.91}]}
                ]
            }
        }"#;
        let response: ListenResponse = serde_json::from_str(body).unwrap();
        let transcript = response.into_transcript();
        assert_eq!(transcript.text, "hello there general");
        assert_eq!(transcript.confidence, Some(0.98));
    }

    #[test]
    fn test_empty_response_yields_empty_transcript() {
        let response: ListenResponse = serde_json::from_str("{}").unwrap();
        let transcript = response.into_transcript();
        assert!(transcript.text.is_empty());
        assert!(transcript.confidence.is_none());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let body = r#"{
            "metadata": {"request_id": "r1"},
            "results": {
                "channels": [{"alternatives": [{"transcript": "ok", "words": []}]}]
            }
        }"#;
        let response: ListenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_transcript().text, "ok");
    }
}

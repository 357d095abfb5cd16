//! Text-to-speech over the vendor's `/v1/speak` endpoint.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use tracing::debug;

use super::{SpeechClient, SpeechError, SynthesizedAudio};

const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Synthesize speech for the given text with the given voice.
pub(super) async fn synthesize(
    client: &SpeechClient,
    text: &str,
    voice: &str,
    max_chars: usize,
) -> Result<SynthesizedAudio, SpeechError> {
    let text = truncate_chars(text, max_chars);

    let url = format!("{}/v1/speak", client.base_url());
    let response = client
        .http()
        .post(&url)
        .query(&[("model", voice)])
        .header(AUTHORIZATION, client.auth_header())
        .json(&json!({ "text": text }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SpeechError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let mime = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_AUDIO_MIME)
        .to_string();
    let bytes = response.bytes().await?.to_vec();
    debug!("synthesized {} bytes for {} chars of text", bytes.len(), text.chars().count());

    Ok(SynthesizedAudio { bytes, mime })
}

/// Bound the text by codepoints, not bytes.
pub(super) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_counts_codepoints() {
        // Four codepoints, more bytes than that.
        assert_eq!(truncate_chars("héllö", 4), "héll");
    }

    #[test]
    fn test_truncate_at_boundary() {
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("abcd", 3), "abc");
    }
}

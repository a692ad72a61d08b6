//! Speech-to-text provider adapters.
//!
//! Providers are thin JSON/HTTPS adapters registered lazily: a provider
//! without its credential never loads. Each registered provider gets a
//! sliding-window rate limiter and a single-in-flight queue so concurrent
//! jobs cannot stampede one vendor.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::json;

use crate::error::{AutomationError, AutomationResult};

use super::AudioFormat;

/// A recognized transcription with the provider's confidence.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: f64,
    pub provider: String,
}

/// One speech-to-text backend.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> AutomationResult<Transcription>;
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Sliding-window counter: at most `limit` calls per `window`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to take a slot; false means the caller should skip this provider.
    pub fn try_acquire(&self) -> bool {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as u32 >= self.limit {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    #[must_use]
    pub fn in_window(&self) -> usize {
        self.timestamps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A registered provider with its limiter and in-flight queue.
pub struct ProviderSlot {
    pub provider: std::sync::Arc<dyn TranscriptionProvider>,
    pub limiter: SlidingWindowLimiter,
    /// Serializes requests so each provider sees one in flight at a time
    pub inflight: tokio::sync::Mutex<()>,
}

impl ProviderSlot {
    #[must_use]
    pub fn new(
        provider: std::sync::Arc<dyn TranscriptionProvider>,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self {
            provider,
            limiter: SlidingWindowLimiter::new(rate_limit_per_minute, Duration::from_secs(60)),
            inflight: tokio::sync::Mutex::new(()),
        }
    }
}

// =============================================================================
// Google Cloud Speech
// =============================================================================

pub struct GoogleSpeechProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleSpeechProvider {
    #[must_use]
    pub fn new(client: Client, api_key: String) -> Self {
        Self::with_base_url(client, api_key, "https://speech.googleapis.com".to_string())
    }

    #[must_use]
    pub fn with_base_url(client: Client, api_key: String, base_url: String) -> Self {
        Self { client, api_key, base_url }
    }

    fn encoding_for(format: AudioFormat) -> &'static str {
        match format {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::Wav => "LINEAR16",
            AudioFormat::Ogg => "OGG_OPUS",
            AudioFormat::Unknown => "ENCODING_UNSPECIFIED",
        }
    }
}

#[async_trait]
impl TranscriptionProvider for GoogleSpeechProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> AutomationResult<Transcription> {
        let body = json!({
            "config": {
                "encoding": Self::encoding_for(format),
                "sampleRateHertz": 16_000,
                "languageCode": "en-US",
            },
            "audio": {
                "content": base64::engine::general_purpose::STANDARD.encode(audio),
            },
        });

        let response = self
            .client
            .post(format!("{}/v1/speech:recognize?key={}", self.base_url, self.api_key))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AutomationError::rate_limited(
                "google_speech_429",
                "Google Speech per-minute quota exceeded",
            ));
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AutomationError::auth("google_speech_key", "Google Speech rejected the API key"));
        }
        if !response.status().is_success() {
            return Err(AutomationError::network(
                "google_speech_http",
                format!("Google Speech returned {}", response.status()),
            ));
        }

        let payload: serde_json::Value = response.json().await?;
        let alternative = payload["results"][0]["alternatives"][0].clone();
        let text = alternative["transcript"]
            .as_str()
            .ok_or_else(|| {
                AutomationError::network("google_speech_empty", "no transcript in response")
            })?
            .trim()
            .to_string();
        let confidence = alternative["confidence"].as_f64().unwrap_or(0.0);

        Ok(Transcription {
            text,
            confidence,
            provider: self.name().to_string(),
        })
    }
}

// =============================================================================
// OpenAI Whisper
// =============================================================================

pub struct WhisperProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl WhisperProvider {
    #[must_use]
    pub fn new(client: Client, api_key: String) -> Self {
        Self::with_base_url(client, api_key, "https://api.openai.com".to_string())
    }

    #[must_use]
    pub fn with_base_url(client: Client, api_key: String, base_url: String) -> Self {
        Self { client, api_key, base_url }
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperProvider {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> AutomationResult<Transcription> {
        let (filename, mime) = match format {
            AudioFormat::Mp3 => ("audio.mp3", "audio/mpeg"),
            AudioFormat::Wav => ("audio.wav", "audio/wav"),
            AudioFormat::Ogg => ("audio.ogg", "audio/ogg"),
            AudioFormat::Unknown => ("audio.bin", "application/octet-stream"),
        };
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(filename)
            .mime_str(mime)
            .map_err(|e| AutomationError::internal("whisper_part", e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .text("response_format", "verbose_json")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AutomationError::rate_limited(
                "whisper_429",
                "Whisper per-minute quota exceeded",
            ));
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AutomationError::auth("whisper_key", "OpenAI rejected the API key"));
        }
        if !response.status().is_success() {
            return Err(AutomationError::network(
                "whisper_http",
                format!("Whisper returned {}", response.status()),
            ));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload["text"]
            .as_str()
            .ok_or_else(|| AutomationError::network("whisper_empty", "no text in response"))?
            .trim()
            .to_string();

        // Whisper has no top-level confidence; derive one from the mean
        // segment log-probability when present.
        let confidence = payload["segments"]
            .as_array()
            .filter(|segments| !segments.is_empty())
            .map(|segments| {
                let sum: f64 = segments
                    .iter()
                    .filter_map(|s| s["avg_logprob"].as_f64())
                    .sum();
                (sum / segments.len() as f64).exp().clamp(0.0, 1.0)
            })
            .unwrap_or(0.9);

        Ok(Transcription {
            text,
            confidence,
            provider: self.name().to_string(),
        })
    }
}

// =============================================================================
// Azure Speech
// =============================================================================

pub struct AzureSpeechProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AzureSpeechProvider {
    #[must_use]
    pub fn new(client: Client, api_key: String) -> Self {
        Self::with_base_url(
            client,
            api_key,
            "https://eastus.stt.speech.microsoft.com".to_string(),
        )
    }

    #[must_use]
    pub fn with_base_url(client: Client, api_key: String, base_url: String) -> Self {
        Self { client, api_key, base_url }
    }
}

#[async_trait]
impl TranscriptionProvider for AzureSpeechProvider {
    fn name(&self) -> &str {
        "azure"
    }

    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> AutomationResult<Transcription> {
        let content_type = match format {
            AudioFormat::Wav => "audio/wav; codecs=audio/pcm; samplerate=16000",
            AudioFormat::Ogg => "audio/ogg; codecs=opus",
            AudioFormat::Mp3 | AudioFormat::Unknown => "audio/mpeg",
        };

        let response = self
            .client
            .post(format!(
                "{}/speech/recognition/conversation/cognitiveservices/v1?language=en-US&format=detailed",
                self.base_url
            ))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", content_type)
            .body(audio.to_vec())
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AutomationError::rate_limited(
                "azure_speech_429",
                "Azure Speech per-minute quota exceeded",
            ));
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AutomationError::auth("azure_speech_key", "Azure rejected the API key"));
        }
        if !response.status().is_success() {
            return Err(AutomationError::network(
                "azure_speech_http",
                format!("Azure Speech returned {}", response.status()),
            ));
        }

        let payload: serde_json::Value = response.json().await?;
        if payload["RecognitionStatus"].as_str() != Some("Success") {
            return Err(AutomationError::network(
                "azure_speech_norecog",
                format!("recognition status: {}", payload["RecognitionStatus"]),
            ));
        }
        let text = payload["DisplayText"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        let confidence = payload["NBest"][0]["Confidence"].as_f64().unwrap_or(0.0);

        Ok(Transcription {
            text,
            confidence,
            provider: self.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_enforces_limit() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_window(), 3);
    }

    #[test]
    fn sliding_window_frees_slots_after_window() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn google_provider_parses_recognition_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Regex(r"^/v1/speech:recognize.*".to_string()))
            .with_status(200)
            .with_body(
                r#"{"results":[{"alternatives":[{"transcript":"seven three one","confidence":0.94}]}]}"#,
            )
            .create_async()
            .await;

        let provider = GoogleSpeechProvider::with_base_url(
            Client::new(),
            "test-key".to_string(),
            server.url(),
        );
        let result = provider
            .transcribe(b"fake-audio", AudioFormat::Mp3)
            .await
            .expect("transcription should parse");
        assert_eq!(result.text, "seven three one");
        assert!((result.confidence - 0.94).abs() < f64::EPSILON);
        assert_eq!(result.provider, "google");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn google_provider_maps_quota_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Regex(r"^/v1/speech:recognize.*".to_string()))
            .with_status(429)
            .create_async()
            .await;

        let provider = GoogleSpeechProvider::with_base_url(
            Client::new(),
            "test-key".to_string(),
            server.url(),
        );
        let err = provider
            .transcribe(b"fake-audio", AudioFormat::Mp3)
            .await
            .expect_err("429 should be an error");
        assert_eq!(err.category, crate::error::ErrorCategory::RateLimited);
    }

    #[tokio::test]
    async fn azure_provider_requires_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Regex(r"^/speech/recognition.*".to_string()))
            .with_status(200)
            .with_body(r#"{"RecognitionStatus":"InitialSilenceTimeout"}"#)
            .create_async()
            .await;

        let provider = AzureSpeechProvider::with_base_url(
            Client::new(),
            "test-key".to_string(),
            server.url(),
        );
        let err = provider
            .transcribe(b"fake-audio", AudioFormat::Wav)
            .await
            .expect_err("non-success recognition should fail");
        assert_eq!(err.category, crate::error::ErrorCategory::Network);
    }
}

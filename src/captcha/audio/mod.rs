//! Audio-captcha pipeline (C7): challenge audio → recognized text.
//!
//! Stages: locate the audio control, download the challenge audio (in-page
//! fetch for `blob:` URLs, HTTPS otherwise), sniff the format from the URL
//! and magic bytes, stage non-WAV payloads to a contained temp file,
//! short-circuit through the content-hash cache, preprocess, then walk the
//! ranked provider list under per-provider rate limits and single-in-flight
//! queues. Low-confidence results retry with enhanced preprocessing before
//! falling through to the next provider.

pub mod cache;
pub mod providers;

pub use cache::TranscriptionCache;
pub use providers::{
    AzureSpeechProvider, GoogleSpeechProvider, ProviderSlot, SlidingWindowLimiter, Transcription,
    TranscriptionProvider, WhisperProvider,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{AutomationError, AutomationResult, ErrorCategory};

/// Selector candidates for the audio-challenge control on a widget.
pub const AUDIO_CONTROL_SELECTORS: &[&str] = &[
    "[aria-label*=audio]",
    "[aria-label*=Audio]",
    ".audio-button",
    "#recaptcha-audio-button",
    "button[title*=audio]",
    ".rc-button-audio",
];

/// Audio container format, sniffed from URL extension then magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Ogg,
    Unknown,
}

impl AudioFormat {
    /// Detect the format, preferring magic bytes over the URL extension.
    #[must_use]
    pub fn detect(url: &str, bytes: &[u8]) -> Self {
        if bytes.starts_with(b"RIFF") {
            return Self::Wav;
        }
        if bytes.starts_with(b"OggS") {
            return Self::Ogg;
        }
        if bytes.starts_with(b"ID3") || (bytes.len() > 1 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
        {
            return Self::Mp3;
        }
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".mp3") {
            Self::Mp3
        } else if path.ends_with(".wav") {
            Self::Wav
        } else if path.ends_with(".ogg") || path.ends_with(".oga") {
            Self::Ogg
        } else {
            Self::Unknown
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    pub text: String,
    pub confidence: f64,
    pub provider: String,
    pub cached: bool,
}

// =============================================================================
// Temp file staging
// =============================================================================

/// Temp file removed on drop; creation validates containment in the
/// configured temp directory and restricts permissions to the owner.
pub struct TempAudioFile {
    path: PathBuf,
}

impl TempAudioFile {
    pub fn write(temp_dir: &Path, bytes: &[u8]) -> AutomationResult<Self> {
        std::fs::create_dir_all(temp_dir)
            .map_err(|e| AutomationError::internal("audio_tmp_mkdir", e.to_string()))?;
        let canonical_dir = temp_dir
            .canonicalize()
            .map_err(|e| AutomationError::internal("audio_tmp_canon", e.to_string()))?;

        let path = canonical_dir.join(format!("challenge-{}.audio", uuid::Uuid::new_v4()));
        // Containment check after canonicalization; a traversal here is an
        // Internal (non-recoverable) error by policy
        if !path.starts_with(&canonical_dir) {
            return Err(AutomationError::internal(
                "audio_tmp_traversal",
                format!("temp path escapes {}", canonical_dir.display()),
            ));
        }

        write_restricted(&path, bytes)
            .map_err(|e| AutomationError::internal("audio_tmp_write", e.to_string()))?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempAudioFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if self.path.exists() {
                warn!("Failed to remove temp audio file {}: {e}", self.path.display());
            }
        }
    }
}

#[cfg(unix)]
fn write_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

// =============================================================================
// Preprocessing
// =============================================================================

/// Peak-normalize and trim silence on 16-bit PCM WAV; other formats pass
/// through unchanged (conversion backends plug in here).
#[must_use]
pub fn preprocess(bytes: &[u8], format: AudioFormat, enhanced: bool) -> Vec<u8> {
    if format != AudioFormat::Wav || bytes.len() <= 44 {
        return bytes.to_vec();
    }
    let (header, data) = bytes.split_at(44);
    let mut samples: Vec<i16> = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    // Volume normalization to ~90% full scale
    let peak = samples.iter().map(|s| i32::from(s.abs())).max().unwrap_or(0);
    if peak > 0 {
        let gain = (i32::from(i16::MAX) * 9 / 10) as f64 / peak as f64;
        if gain > 1.0 {
            for sample in &mut samples {
                *sample = ((f64::from(*sample) * gain) as i32)
                    .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            }
        }
    }

    if enhanced {
        // Silence trim: drop leading/trailing samples under 1% full scale
        let threshold = i16::MAX / 100;
        let start = samples.iter().position(|s| s.abs() > threshold).unwrap_or(0);
        let end = samples
            .iter()
            .rposition(|s| s.abs() > threshold)
            .map_or(samples.len(), |i| i + 1);
        if start < end {
            samples = samples[start..end].to_vec();
        }
    }

    let mut out = header.to_vec();
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

// =============================================================================
// Pipeline
// =============================================================================

/// The ranked-provider transcription pipeline.
pub struct AudioPipeline {
    config: AudioConfig,
    cache: TranscriptionCache,
    slots: Vec<ProviderSlot>,
    http: reqwest::Client,
}

impl AudioPipeline {
    /// Build from configuration, registering only providers whose credential
    /// is present, in the configured priority order.
    #[must_use]
    pub fn from_config(config: AudioConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        let mut providers: Vec<Arc<dyn TranscriptionProvider>> = Vec::new();
        for name in &config.provider_priority {
            match name.as_str() {
                "google" => {
                    if let Some(key) = &config.google_api_key {
                        providers.push(Arc::new(GoogleSpeechProvider::new(http.clone(), key.clone())));
                    }
                }
                "whisper" | "openai" => {
                    if let Some(key) = &config.openai_api_key {
                        providers.push(Arc::new(WhisperProvider::new(http.clone(), key.clone())));
                    }
                }
                "azure" => {
                    if let Some(key) = &config.azure_api_key {
                        providers.push(Arc::new(AzureSpeechProvider::new(http.clone(), key.clone())));
                    }
                }
                other => warn!("Unknown transcription provider in priority list: {other}"),
            }
        }
        info!("Audio pipeline registered {} providers", providers.len());
        Self::with_providers(config, providers, http)
    }

    /// Build with explicit providers (test seam; preserves list order).
    #[must_use]
    pub fn with_providers(
        config: AudioConfig,
        providers: Vec<Arc<dyn TranscriptionProvider>>,
        http: reqwest::Client,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|p| ProviderSlot::new(p, config.rate_limit_per_minute))
            .collect();
        let cache = TranscriptionCache::new(config.cache_ttl, config.enable_cache);
        Self { config, cache, slots, http }
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.provider.name().to_string()).collect()
    }

    /// Find the audio-challenge control on the current page.
    pub async fn find_audio_url(&self, page: &Page) -> AutomationResult<Option<String>> {
        let script = r#"(() => {
            const audio = document.querySelector('audio');
            if (audio && audio.src) return audio.src;
            const source = document.querySelector('source[type*=audio]');
            if (source && source.src) return source.src;
            const tagged = document.querySelector('[data-audio-url]');
            if (tagged) return tagged.getAttribute('data-audio-url');
            return null;
        })()"#;
        let result = page.evaluate(script).await.map_err(AutomationError::from)?;
        Ok(result
            .value()
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string))
    }

    /// Download challenge audio. `blob:` URLs are fetched inside the page
    /// context; anything else goes through the server-side client.
    pub async fn download(&self, page: &Page, url: &str) -> AutomationResult<Vec<u8>> {
        if url.starts_with("blob:") {
            let script = format!(
                r"(async () => {{
                    const response = await fetch({});
                    const buffer = await response.arrayBuffer();
                    const bytes = new Uint8Array(buffer);
                    let binary = '';
                    for (let i = 0; i < bytes.length; i++) binary += String.fromCharCode(bytes[i]);
                    return btoa(binary);
                }})()",
                serde_json::to_string(url)
                    .map_err(|e| AutomationError::internal("audio_url_encode", e.to_string()))?
            );
            let params = EvaluateParams::builder()
                .expression(script)
                .await_promise(true)
                .return_by_value(true)
                .build()
                .map_err(|e| AutomationError::internal("audio_eval_params", e))?;
            let result = page.evaluate(params).await.map_err(AutomationError::from)?;
            let encoded = result
                .value()
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    AutomationError::network("audio_blob_fetch", "in-page fetch returned no data")
                })?;
            return base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| AutomationError::internal("audio_blob_decode", e.to_string()));
        }

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AutomationError::network(
                "audio_download",
                format!("audio download returned {}", response.status()),
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Transcribe downloaded audio bytes through the ranked provider list.
    pub async fn process(&self, url_hint: &str, audio: &[u8]) -> AutomationResult<TranscriptionOutcome> {
        if audio.is_empty() {
            return Err(AutomationError::invalid_input("audio_empty", "empty audio payload"));
        }

        if let Some(cached) = self.cache.get(audio) {
            debug!("Audio transcription cache hit");
            return Ok(TranscriptionOutcome {
                text: cached.text,
                confidence: cached.confidence,
                provider: cached.provider,
                cached: true,
            });
        }

        let format = AudioFormat::detect(url_hint, audio);
        // Non-WAV payloads are staged to disk for file-based processing;
        // the guard removes the file when this scope unwinds.
        let _staged = if format != AudioFormat::Wav {
            Some(TempAudioFile::write(&self.config.temp_dir, audio)?)
        } else {
            None
        };

        if self.slots.is_empty() {
            return Err(AutomationError::solver_unavailable(
                "no transcription providers registered (missing credentials)",
            ));
        }

        let mut attempt_errors: Vec<String> = Vec::new();
        for slot in &self.slots {
            let name = slot.provider.name().to_string();
            for attempt in 1..=self.config.max_retries.max(1) {
                if !slot.limiter.try_acquire() {
                    attempt_errors.push(format!("{name}: rate limit window exhausted"));
                    break;
                }

                let _inflight = slot.inflight.lock().await;
                let payload = preprocess(audio, format, attempt > 1);
                let result = tokio::time::timeout(
                    self.config.request_timeout,
                    slot.provider.transcribe(&payload, format),
                )
                .await;

                match result {
                    Ok(Ok(transcription)) => {
                        if transcription.confidence >= self.config.min_confidence {
                            self.cache.put(audio, transcription.clone());
                            return Ok(TranscriptionOutcome {
                                text: transcription.text,
                                confidence: transcription.confidence,
                                provider: transcription.provider,
                                cached: false,
                            });
                        }
                        debug!(
                            provider = %name,
                            confidence = transcription.confidence,
                            "Transcription below confidence threshold, retrying"
                        );
                        attempt_errors.push(format!(
                            "{name}: confidence {:.2} below threshold",
                            transcription.confidence
                        ));
                    }
                    Ok(Err(e)) => {
                        attempt_errors.push(format!("{name}: {e}"));
                        // Credential and quota failures will not heal on retry
                        if matches!(e.category, ErrorCategory::Auth | ErrorCategory::RateLimited) {
                            break;
                        }
                    }
                    Err(_) => {
                        attempt_errors.push(format!(
                            "{name}: timed out after {:?}",
                            self.config.request_timeout
                        ));
                    }
                }
            }
        }

        Err(AutomationError::solver_unavailable(format!(
            "all transcription providers exhausted: [{}]",
            attempt_errors.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProvider {
        name: &'static str,
        confidence: f64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TranscriptionProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> AutomationResult<Transcription> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Transcription {
                text: "four two".to_string(),
                confidence: self.confidence,
                provider: self.name.to_string(),
            })
        }
    }

    fn pipeline_with(providers: Vec<Arc<dyn TranscriptionProvider>>) -> AudioPipeline {
        let mut config = AudioConfig::default();
        config.temp_dir = std::env::temp_dir().join("browsermill-audio-test");
        AudioPipeline::with_providers(config, providers, reqwest::Client::new())
    }

    #[test]
    fn format_detection_prefers_magic_bytes() {
        assert_eq!(AudioFormat::detect("x.mp3", b"RIFFxxxx"), AudioFormat::Wav);
        assert_eq!(AudioFormat::detect("x.wav", b"OggSxxxx"), AudioFormat::Ogg);
        assert_eq!(AudioFormat::detect("x", b"ID3\x04rest"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::detect("x", &[0xFF, 0xFB, 0x00]), AudioFormat::Mp3);
        assert_eq!(AudioFormat::detect("challenge.ogg?sig=1", b""), AudioFormat::Ogg);
        assert_eq!(AudioFormat::detect("nothing", b"data"), AudioFormat::Unknown);
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache_with_no_provider_call() {
        let provider = Arc::new(FakeProvider {
            name: "fake",
            confidence: 0.95,
            calls: AtomicU32::new(0),
        });
        let pipeline = pipeline_with(vec![provider.clone()]);

        let first = pipeline.process("a.mp3", b"identical-bytes").await.expect("first run succeeds");
        assert!(!first.cached);
        let second = pipeline.process("a.mp3", b"identical-bytes").await.expect("second run succeeds");
        assert!(second.cached);
        assert_eq!(second.text, first.text);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn low_confidence_falls_through_to_next_provider() {
        let weak = Arc::new(FakeProvider {
            name: "weak",
            confidence: 0.3,
            calls: AtomicU32::new(0),
        });
        let strong = Arc::new(FakeProvider {
            name: "strong",
            confidence: 0.9,
            calls: AtomicU32::new(0),
        });
        let pipeline = pipeline_with(vec![weak.clone(), strong.clone()]);

        let result = pipeline.process("a.mp3", b"bytes-1").await.expect("strong provider succeeds");
        assert_eq!(result.provider, "strong");
        // Weak provider was retried with enhanced preprocessing before falling through
        assert_eq!(weak.calls.load(Ordering::SeqCst), 3);
        assert_eq!(strong.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_raises_solver_unavailable() {
        let weak = Arc::new(FakeProvider {
            name: "weak",
            confidence: 0.1,
            calls: AtomicU32::new(0),
        });
        let pipeline = pipeline_with(vec![weak]);
        let err = pipeline.process("a.mp3", b"bytes-2").await.expect_err("must exhaust");
        assert_eq!(err.category, ErrorCategory::SolverUnavailable);
        assert!(err.message.contains("weak"));
    }

    #[tokio::test]
    async fn no_providers_is_solver_unavailable() {
        let pipeline = pipeline_with(vec![]);
        let err = pipeline.process("a.mp3", b"bytes-3").await.expect_err("no providers");
        assert_eq!(err.category, ErrorCategory::SolverUnavailable);
    }

    #[test]
    fn temp_file_is_contained_and_cleaned() {
        let dir = std::env::temp_dir().join("browsermill-audio-contain");
        let staged = TempAudioFile::write(&dir, b"payload").expect("staging succeeds");
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert!(path.starts_with(dir.canonicalize().expect("dir canonicalizes")));
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn wav_preprocess_normalizes_and_trims() {
        let mut wav = vec![0u8; 44];
        wav[..4].copy_from_slice(b"RIFF");
        // silence, quiet tone, silence
        let samples: Vec<i16> = [0i16; 8]
            .into_iter()
            .chain([4000i16, -4000, 4000, -4000])
            .chain([0i16; 8])
            .collect();
        for s in &samples {
            wav.extend_from_slice(&s.to_le_bytes());
        }

        let processed = preprocess(&wav, AudioFormat::Wav, true);
        let out: Vec<i16> = processed[44..]
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        // Trimmed silence and boosted amplitude
        assert!(out.len() < samples.len());
        assert!(out.iter().map(|s| s.abs()).max().unwrap_or(0) > 20_000);
    }
}

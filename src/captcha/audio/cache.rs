//! Transcription cache keyed by audio content hash.
//!
//! Identical audio bytes within the TTL return the stored transcription
//! without touching any provider. The key is the hex sha256 of the raw
//! bytes, so re-downloads of the same challenge audio hit the cache even
//! when served under different URLs.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::providers::Transcription;

#[derive(Debug, Clone)]
struct CacheEntry {
    transcription: Transcription,
    expires_at: Instant,
}

/// TTL cache of successful transcriptions.
pub struct TranscriptionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    enabled: bool,
}

impl TranscriptionCache {
    #[must_use]
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            enabled,
        }
    }

    /// Content hash used as the cache key.
    #[must_use]
    pub fn key_for(audio: &[u8]) -> String {
        hex::encode(Sha256::digest(audio))
    }

    /// Stored transcription for these bytes, if fresh.
    #[must_use]
    pub fn get(&self, audio: &[u8]) -> Option<Transcription> {
        if !self.enabled {
            return None;
        }
        let key = Self::key_for(audio);
        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.transcription.clone());
            }
        }
        // Expired entries are dropped on the read path
        self.entries.remove_if(&key, |_, entry| entry.expires_at <= Instant::now());
        None
    }

    /// Store a transcription for these bytes.
    pub fn put(&self, audio: &[u8], transcription: Transcription) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            Self::key_for(audio),
            CacheEntry {
                transcription,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcription(text: &str) -> Transcription {
        Transcription {
            text: text.to_string(),
            confidence: 0.92,
            provider: "test".to_string(),
        }
    }

    #[test]
    fn identical_bytes_hit_within_ttl() {
        let cache = TranscriptionCache::new(Duration::from_secs(60), true);
        cache.put(b"audio-bytes", transcription("seven three one"));

        let hit = cache.get(b"audio-bytes").expect("fresh entry should hit");
        assert_eq!(hit.text, "seven three one");
        assert!((hit.confidence - 0.92).abs() < f64::EPSILON);
        assert!(cache.get(b"other-bytes").is_none());
    }

    #[test]
    fn expired_entries_miss_and_are_evicted() {
        let cache = TranscriptionCache::new(Duration::from_millis(10), true);
        cache.put(b"audio-bytes", transcription("x"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(b"audio-bytes").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = TranscriptionCache::new(Duration::from_secs(60), false);
        cache.put(b"audio-bytes", transcription("x"));
        assert!(cache.get(b"audio-bytes").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn key_is_content_addressed() {
        assert_eq!(TranscriptionCache::key_for(b"abc"), TranscriptionCache::key_for(b"abc"));
        assert_ne!(TranscriptionCache::key_for(b"abc"), TranscriptionCache::key_for(b"abd"));
        assert_eq!(TranscriptionCache::key_for(b"abc").len(), 64);
    }
}

//! Content-addressed cache of rendered avatar videos.
//!
//! Keyed by a fingerprint of (avatar, reply text). Entries are write-once;
//! hits only refresh access metadata. Eviction is least-recently-accessed
//! once the entry cap is exceeded, plus an optional idle-age cap. Evicted
//! entries queue up in [`ArtifactCache::take_evicted`] so their blobs can be
//! deleted outside the lock.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub avatar_id: String,
    pub fingerprint: String,
    pub video_url: String,
    pub storage_key: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// A freshly rendered artifact to be recorded.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub video_url: String,
    pub storage_key: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Inserted(CacheEntry),
    /// Another turn recorded the same fingerprint first; the existing entry
    /// wins and the caller's artifact is redundant.
    Existing(CacheEntry),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    evicted: Vec<CacheEntry>,
}

impl Inner {
    fn retire(&mut self, entry: CacheEntry) {
        self.evictions += 1;
        self.evicted.push(entry);
    }
}

pub struct ArtifactCache {
    inner: Mutex<Inner>,
    max_age: Option<Duration>,
}

/// Deterministic key for an (avatar, text) pair.
pub fn fingerprint(avatar_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(avatar_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ArtifactCache {
    pub fn new(max_entries: usize, max_age: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                evicted: Vec::new(),
            }),
            max_age,
        }
    }

    pub fn from_config(config: &facetalk_core::config::Config) -> Self {
        Self::new(config.cache_max_entries(), config.cache_max_age())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        let idle = now
            .signed_duration_since(entry.last_accessed)
            .to_std()
            .unwrap_or_default();
        idle >= max_age
    }

    /// Find the entry for (avatar, text) without changing its recency.
    /// Expired entries are evicted and miss.
    pub fn lookup(&self, avatar_id: &str, text: &str) -> Option<CacheEntry> {
        let key = fingerprint(avatar_id, text);
        let now = Utc::now();
        let mut inner = self.lock();

        let state = inner.entries.peek(&key).map(|e| self.expired(e, now));
        match state {
            Some(false) => {
                inner.hits += 1;
                inner.entries.peek(&key).cloned()
            }
            Some(true) => {
                if let Some(entry) = inner.entries.pop(&key) {
                    inner.retire(entry);
                }
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Record access to an entry and mark it most recently used. Returns the
    /// updated entry, or `None` if it has since been evicted.
    pub fn touch(&self, entry: &CacheEntry) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let slot = inner.entries.get_mut(&entry.fingerprint)?;
        slot.access_count += 1;
        slot.last_accessed = Utc::now();
        Some(slot.clone())
    }

    /// Insert a new entry unless one already exists for the fingerprint.
    pub fn record(&self, avatar_id: &str, text: &str, artifact: NewArtifact) -> RecordOutcome {
        let key = fingerprint(avatar_id, text);
        let now = Utc::now();
        let mut inner = self.lock();

        let state = inner.entries.peek(&key).map(|e| self.expired(e, now));
        match state {
            Some(false) => {
                if let Some(existing) = inner.entries.peek(&key) {
                    return RecordOutcome::Existing(existing.clone());
                }
            }
            Some(true) => {
                if let Some(stale) = inner.entries.pop(&key) {
                    inner.retire(stale);
                }
            }
            None => {}
        }

        // Least recently used first; recency order matches `last_accessed`.
        while let Some((_, oldest)) = inner.entries.peek_lru() {
            if !self.expired(oldest, now) {
                break;
            }
            match inner.entries.pop_lru() {
                Some((_, stale)) => inner.retire(stale),
                None => break,
            }
        }

        let entry = CacheEntry {
            avatar_id: avatar_id.to_string(),
            fingerprint: key.clone(),
            video_url: artifact.video_url,
            storage_key: artifact.storage_key,
            duration_secs: artifact.duration_secs,
            size_bytes: artifact.size_bytes,
            created_at: now,
            last_accessed: now,
            access_count: 1,
        };
        if let Some((_, displaced)) = inner.entries.push(key, entry.clone()) {
            inner.retire(displaced);
        }

        RecordOutcome::Inserted(entry)
    }

    /// Drain entries evicted since the last call.
    pub fn take_evicted(&self) -> Vec<CacheEntry> {
        std::mem::take(&mut self.lock().evicted)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DrmError;
use crate::metadata::{DrmMetadata, MetadataHash};
use crate::session::{DrmSession, KeyMaterial};

/// License-acquisition back-end.
#[async_trait]
pub trait Licenser: Send + Sync {
    /// Exchange a metadata blob for key material. Called off the fetch path;
    /// the session stays pending until this resolves.
    async fn acquire(&self, metadata: Bytes) -> Result<KeyMaterial, DrmError>;
}

/// The single pending deferred acquisition.
#[derive(Clone, Debug)]
pub struct DeferredLicense {
    pub metadata: DrmMetadata,
    pub fire_at: Instant,
    pub request_pending: bool,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<MetadataHash, Arc<DrmSession>>,
    deferred: Option<DeferredLicense>,
    /// A defer tag has been seen and handled for the current rotation; reset
    /// when the tag disappears from a refresh.
    tag_under_processing: bool,
}

/// Process-wide DRM coordinator.
///
/// All bookkeeping (session table, deferred record, tag flag) lives behind
/// one async mutex; decrypts themselves are per-session and run outside it.
pub struct DrmManager {
    licenser: Arc<dyn Licenser>,
    state: Mutex<ManagerState>,
}

impl DrmManager {
    #[must_use]
    pub fn new(licenser: Arc<dyn Licenser>) -> Self {
        Self {
            licenser,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Submit a metadata blob for license acquisition. Idempotent by hash:
    /// re-submitting an installed or in-flight metadata is a no-op.
    pub async fn set_metadata(self: &Arc<Self>, metadata: &DrmMetadata, track: &'static str) {
        let session = {
            let mut state = self.state.lock().await;
            if state.sessions.contains_key(&metadata.hash) {
                return;
            }
            let session = Arc::new(DrmSession::new(metadata.hash));
            state.sessions.insert(metadata.hash, session.clone());
            session
        };

        info!(hash = %metadata.hash, track, "starting license acquisition");
        let licenser = self.licenser.clone();
        let data = metadata.data.clone();
        tokio::spawn(async move {
            match licenser.acquire(data).await {
                Ok(key) => session.install_key(key),
                Err(e) => session.fail_key(e.to_string()),
            }
        });
    }

    /// Install an already-resolved key (vanilla AES-128 key fetched from the
    /// playlist's `URI=`), keyed by the digest of the key URL.
    pub async fn install_resolved_key(&self, hash: MetadataHash, key: KeyMaterial) {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .entry(hash)
            .or_insert_with(|| Arc::new(DrmSession::new(hash)));
        session.install_key(key);
    }

    pub async fn session(&self, hash: &MetadataHash) -> Option<Arc<DrmSession>> {
        self.state.lock().await.sessions.get(hash).cloned()
    }

    pub async fn has_session(&self, hash: &MetadataHash) -> bool {
        self.state.lock().await.sessions.contains_key(hash)
    }

    /// Newest metadata (scanning from the tail) that has no session yet.
    /// Used to pick the deferred-acquisition candidate.
    pub async fn newest_uninstalled(&self, metadata: &[DrmMetadata]) -> Option<DrmMetadata> {
        let state = self.state.lock().await;
        metadata
            .iter()
            .rev()
            .find(|m| !state.sessions.contains_key(&m.hash))
            .cloned()
    }

    /// True while a deferred acquisition is recorded for `hash`.
    pub async fn is_deferred(&self, hash: &MetadataHash) -> bool {
        let state = self.state.lock().await;
        state
            .deferred
            .as_ref()
            .is_some_and(|d| d.request_pending && d.metadata.hash == *hash)
    }

    /// Record a deferred acquisition. Fails (returns false) if one is already
    /// pending or the defer tag is already being processed.
    pub async fn schedule_deferred(&self, metadata: DrmMetadata, fire_at: Instant) -> bool {
        let mut state = self.state.lock().await;
        if state.tag_under_processing {
            return false;
        }
        state.tag_under_processing = true;
        if state.deferred.as_ref().is_some_and(|d| d.request_pending) {
            return false;
        }
        info!(
            hash = %metadata.hash,
            in_ms = fire_at.saturating_duration_since(Instant::now()).as_millis() as u64,
            "license acquisition deferred"
        );
        state.deferred = Some(DeferredLicense {
            metadata,
            fire_at,
            request_pending: true,
        });
        true
    }

    /// Mark the defer tag as observed without scheduling (first index build).
    pub async fn mark_defer_tag_seen(&self) {
        let mut state = self.state.lock().await;
        state.tag_under_processing = true;
        if let Some(d) = state.deferred.as_mut() {
            d.request_pending = false;
        }
    }

    /// The defer tag disappeared from a refresh; allow future tags to be
    /// processed again.
    pub async fn clear_defer_tag(&self) {
        let mut state = self.state.lock().await;
        if state.tag_under_processing {
            debug!("defer tag no longer present, clearing");
            state.tag_under_processing = false;
        }
    }

    pub async fn defer_tag_under_processing(&self) -> bool {
        self.state.lock().await.tag_under_processing
    }

    pub async fn deferred(&self) -> Option<DeferredLicense> {
        self.state.lock().await.deferred.clone()
    }

    /// Promote a past-due deferred acquisition to an immediate one. Returns
    /// the promoted metadata if the fire time has passed.
    pub async fn promote_due_deferred(self: &Arc<Self>, track: &'static str) -> Option<DrmMetadata> {
        let due = {
            let mut state = self.state.lock().await;
            match state.deferred.as_mut() {
                Some(d) if d.request_pending && Instant::now() >= d.fire_at => {
                    d.request_pending = false;
                    Some(d.metadata.clone())
                }
                _ => None,
            }
        };
        if let Some(metadata) = due {
            info!(hash = %metadata.hash, track, "promoting deferred license acquisition");
            self.set_metadata(&metadata, track).await;
            return Some(metadata);
        }
        None
    }

    /// Claim the pending deferred acquisition early when its key is needed
    /// right now. Clears the pending flag and returns the metadata so the
    /// caller can submit it immediately.
    pub async fn take_deferred_if(&self, hash: &MetadataHash) -> Option<DrmMetadata> {
        let mut state = self.state.lock().await;
        match state.deferred.as_mut() {
            Some(d) if d.request_pending && d.metadata.hash == *hash => {
                d.request_pending = false;
                Some(d.metadata.clone())
            }
            _ => None,
        }
    }

    /// Abort key waits on every session (shutdown / re-tune).
    pub async fn cancel_all_key_waits(&self) {
        let state = self.state.lock().await;
        for session in state.sessions.values() {
            session.cancel_key_wait();
        }
    }

    /// Revive sessions whose key waits were aborted (re-tune into the same
    /// presentation without clearing DRM state).
    pub async fn restore_all_key_states(&self) {
        let state = self.state.lock().await;
        for session in state.sessions.values() {
            session.restore_key_state();
        }
    }

    /// Drop all sessions and deferred state (new tune).
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        for session in state.sessions.values() {
            session.cancel_key_wait();
        }
        state.sessions.clear();
        state.deferred = None;
        state.tag_under_processing = false;
    }

    /// Diagnostic dump of cached sessions.
    pub async fn dump_sessions(&self) {
        let state = self.state.lock().await;
        for (hash, session) in &state.sessions {
            debug!(hash = %hash, key_ready = session.key_ready(), "drm session");
        }
        if let Some(d) = &state.deferred {
            debug!(hash = %d.metadata.hash, pending = d.request_pending, "deferred license");
        }
    }
}

impl std::fmt::Debug for DrmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmManager").finish_non_exhaustive()
    }
}

/// Pick a jittered delay in `[0, window)` for a deferred acquisition, so a
/// population of clients does not hit the license server at the same instant.
#[must_use]
pub fn defer_jitter(window: Duration) -> Duration {
    // xorshift64 seeded from wall clock; cryptographic quality is irrelevant.
    let mut x = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 | 1)
        .unwrap_or(0x9E37_79B9);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let fraction = (x >> 11) as f64 / (1u64 << 53) as f64;
    window.mul_f64(fraction)
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Notify, RwLock};

use tokengate_common::config::ShadowConfig;

/// Literal prefix of the shadow marker served to the LLM.
pub const SHADOW_MARKER_PREFIX: &str = "<<<SHADOW:";

/// Build the marker payload served in place of an original tool output.
/// The marker is added at send time only, never stored.
pub fn shadow_marker(id: &str, compressed: &str) -> String {
    format!("{}{}>>>\n{}", SHADOW_MARKER_PREFIX, id, compressed)
}

/// Whether a payload already carries a shadow marker.
pub fn has_shadow_marker(content: &str) -> bool {
    content.starts_with(SHADOW_MARKER_PREFIX)
}

/// Extract the shadow id from a marker payload.
pub fn marker_shadow_id(content: &str) -> Option<&str> {
    let rest = content.strip_prefix(SHADOW_MARKER_PREFIX)?;
    let end = rest.find(">>>")?;
    Some(&rest[..end])
}

/// Compute the content address for a payload:
/// `"shadow:" + hex(first 16 bytes of sha256(content))`.
pub fn shadow_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut id = String::with_capacity(7 + 32);
    id.push_str("shadow:");
    for byte in &digest[..16] {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

struct Entry {
    text: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Spaces {
    originals: HashMap<String, Entry>,
    compressed: HashMap<String, Entry>,
}

/// Dual-TTL content-addressed cache mapping shadow ids to
/// (original, compressed) texts.
///
/// Originals live under a short TTL refreshed on every read, so a streaming
/// replay can still recover the text after the first forward. Compressed
/// entries live under an independent long TTL for cross-request reuse.
pub struct ShadowStore {
    spaces: RwLock<Spaces>,
    original_ttl: Duration,
    compressed_ttl: Duration,
    cleanup_interval: Duration,
    stop: Notify,
}

impl ShadowStore {
    pub fn new(config: &ShadowConfig) -> Self {
        Self {
            spaces: RwLock::new(Spaces::default()),
            original_ttl: Duration::from_secs(config.original_ttl_seconds),
            compressed_ttl: Duration::from_secs(config.compressed_ttl_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
            stop: Notify::new(),
        }
    }

    /// Store an original text under its shadow id.
    pub async fn set(&self, id: &str, text: String) {
        let mut spaces = self.spaces.write().await;
        spaces.originals.insert(
            id.to_string(),
            Entry {
                text,
                expires_at: Instant::now() + self.original_ttl,
            },
        );
    }

    /// Read an original, refreshing its expiry on hit.
    pub async fn get(&self, id: &str) -> Option<String> {
        let mut spaces = self.spaces.write().await;
        let entry = spaces.originals.get_mut(id)?;
        if entry.expires_at <= Instant::now() {
            spaces.originals.remove(id);
            return None;
        }
        entry.expires_at = Instant::now() + self.original_ttl;
        Some(entry.text.clone())
    }

    pub async fn delete(&self, id: &str) {
        self.spaces.write().await.originals.remove(id);
    }

    /// Store a compressed text under the long TTL.
    pub async fn set_compressed(&self, id: &str, text: String) {
        let mut spaces = self.spaces.write().await;
        spaces.compressed.insert(
            id.to_string(),
            Entry {
                text,
                expires_at: Instant::now() + self.compressed_ttl,
            },
        );
    }

    /// Read a compressed entry. Does not refresh expiry.
    pub async fn get_compressed(&self, id: &str) -> Option<String> {
        let spaces = self.spaces.read().await;
        let entry = spaces.compressed.get(id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.text.clone())
    }

    /// Drop a compressed entry (after an expansion, so the next turn does not
    /// re-serve a stale compression).
    pub async fn delete_compressed(&self, id: &str) {
        self.spaces.write().await.compressed.remove(id);
    }

    /// Spawn the background sweep of expired entries. Returns the worker
    /// handle; `stop()` terminates it deterministically.
    pub fn start_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = store.stop.notified() => break,
                    _ = tokio::time::sleep(store.cleanup_interval) => store.sweep().await,
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut spaces = self.spaces.write().await;
        let before = spaces.originals.len() + spaces.compressed.len();
        spaces.originals.retain(|_, e| e.expires_at > now);
        spaces.compressed.retain(|_, e| e.expires_at > now);
        let removed = before - (spaces.originals.len() + spaces.compressed.len());
        if removed > 0 {
            tracing::debug!(removed, "Shadow store sweep");
            metrics::counter!("shadow.swept").increment(removed as u64);
        }
        metrics::gauge!("shadow.originals").set(spaces.originals.len() as f64);
        metrics::gauge!("shadow.compressed").set(spaces.compressed.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(original_ttl: u64, compressed_ttl: u64) -> ShadowStore {
        ShadowStore::new(&ShadowConfig {
            original_ttl_seconds: original_ttl,
            compressed_ttl_seconds: compressed_ttl,
            cleanup_interval_seconds: 300,
        })
    }

    #[test]
    fn test_marker_roundtrip() {
        let id = shadow_id("payload");
        let marker = shadow_marker(&id, "summary text");
        assert!(has_shadow_marker(&marker));
        assert_eq!(marker_shadow_id(&marker), Some(id.as_str()));
        assert!(marker.ends_with("\nsummary text"));
    }

    #[test]
    fn test_marker_absent() {
        assert!(!has_shadow_marker("plain output"));
        assert!(marker_shadow_id("plain output").is_none());
    }

    #[test]
    fn test_shadow_id_shape() {
        let id = shadow_id("some tool output");
        assert!(id.starts_with("shadow:"));
        assert_eq!(id.len(), 39);
        assert!(id[7..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_shadow_id_deterministic() {
        assert_eq!(shadow_id("abc"), shadow_id("abc"));
        assert_ne!(shadow_id("abc"), shadow_id("abd"));
    }

    #[tokio::test]
    async fn test_original_roundtrip_and_delete() {
        let store = store_with(60, 60);
        let id = shadow_id("payload");
        store.set(&id, "payload".into()).await;
        assert_eq!(store.get(&id).await.as_deref(), Some("payload"));

        store.delete(&id).await;
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_spaces_are_independent() {
        let store = store_with(60, 60);
        let id = shadow_id("payload");
        store.set_compressed(&id, "short".into()).await;

        assert!(store.get(&id).await.is_none());
        assert_eq!(store.get_compressed(&id).await.as_deref(), Some("short"));

        store.delete_compressed(&id).await;
        assert!(store.get_compressed(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_original_is_gone() {
        let store = store_with(0, 60);
        let id = shadow_id("payload");
        store.set(&id, "payload".into()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let store = Arc::new(store_with(0, 60));
        store.set("shadow:aa", "x".into()).await;
        store.set_compressed("shadow:bb", "y".into()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        store.sweep().await;
        let spaces = store.spaces.read().await;
        assert!(spaces.originals.is_empty());
        assert_eq!(spaces.compressed.len(), 1);
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Notify, RwLock};

use tokengate_common::config::{AuthFallbackConfig, SessionConfig};

use crate::adapters::ExtractedContent;

/// Derive a deterministic session id from the leading user-message contents.
///
/// The same transcript prefix produces the same id across processes, so
/// session state survives gateway restarts on the client side.
pub fn derive_session_id(user_contents: &[String], hash_messages: usize) -> String {
    let taken: Vec<&str> = user_contents
        .iter()
        .take(hash_messages.max(1))
        .map(|s| s.trim())
        .collect();

    if taken.is_empty() {
        return "default".into();
    }

    let mut hasher = Sha256::new();
    for content in &taken {
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

struct ToolSession {
    deferred_tools: Vec<ExtractedContent>,
    expanded_tools: HashSet<String>,
    last_accessed: Instant,
}

/// Per-session deferred and expanded tools, swept on a TTL.
///
/// Reads hand out copies so callers can never race the cleanup worker.
pub struct ToolSessionStore {
    sessions: RwLock<HashMap<String, ToolSession>>,
    ttl: Duration,
    cleanup_interval: Duration,
    stop: Notify,
}

impl ToolSessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
            stop: Notify::new(),
        }
    }

    /// Replace the deferred-tool list for a session.
    pub async fn store_deferred(&self, session_id: &str, tools: Vec<ExtractedContent>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ToolSession {
                deferred_tools: Vec::new(),
                expanded_tools: HashSet::new(),
                last_accessed: Instant::now(),
            });
        session.deferred_tools = tools;
        session.last_accessed = Instant::now();
    }

    pub async fn get_deferred(&self, session_id: &str) -> Vec<ExtractedContent> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.deferred_tools.clone())
            .unwrap_or_default()
    }

    /// Record tool names the LLM discovered through search. These are
    /// force-kept on subsequent turns.
    pub async fn mark_expanded(&self, session_id: &str, names: &[String]) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ToolSession {
                deferred_tools: Vec::new(),
                expanded_tools: HashSet::new(),
                last_accessed: Instant::now(),
            });
        session.expanded_tools.extend(names.iter().cloned());
        session.last_accessed = Instant::now();
    }

    pub async fn get_expanded(&self, session_id: &str) -> HashSet<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.expanded_tools.clone())
            .unwrap_or_default()
    }

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
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_accessed.elapsed() < self.ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "Tool session sweep");
        }
        metrics::gauge!("sessions.tool_sessions").set(sessions.len() as f64);
    }
}

/// Session-id → last-fallback-time map. Presence means the session must use
/// API-key auth regardless of the inbound credential.
pub struct AuthFallbackStore {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    cleanup_interval: Duration,
    stop: Notify,
}

impl AuthFallbackStore {
    pub fn new(config: &AuthFallbackConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
            stop: Notify::new(),
        }
    }

    pub async fn mark_api_key_mode(&self, session_id: &str) {
        self.entries
            .write()
            .await
            .insert(session_id.to_string(), Instant::now());
        metrics::counter!("auth.fallback.marked").increment(1);
    }

    /// Lazily expires the entry on read.
    pub async fn should_use_api_key_mode(&self, session_id: &str) -> bool {
        {
            let entries = self.entries.read().await;
            match entries.get(session_id) {
                Some(marked) if marked.elapsed() < self.ttl => return true,
                Some(_) => {}
                None => return false,
            }
        }
        self.entries.write().await.remove(session_id);
        false
    }

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
        let mut entries = self.entries.write().await;
        entries.retain(|_, marked| marked.elapsed() < self.ttl);
        metrics::gauge!("sessions.auth_fallback").set(entries.len() as f64);
    }
}

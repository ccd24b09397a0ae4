//! Social-graph permission gate.
//!
//! Caches "can I message this peer" decisions from the backend with a
//! freshness window. Every failure path (transport error, timeout) yields a
//! denial; the gate never fails open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::constants::PERMISSION_UNAVAILABLE;
use parley_shared::types::{ChatId, ChatKind, UserId};
use parley_store::Chat;

use crate::source::DataSource;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDecision {
    pub peer_id: UserId,
    pub can_message: bool,
    pub reason: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl PermissionDecision {
    fn unavailable(peer_id: &UserId) -> Self {
        Self {
            peer_id: peer_id.clone(),
            can_message: false,
            reason: Some(PERMISSION_UNAVAILABLE.to_string()),
            evaluated_at: Utc::now(),
        }
    }

    /// A decision is stale once it is older than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        match (Utc::now() - self.evaluated_at).to_std() {
            Ok(age) => age < ttl,
            // evaluated_at in the future: clock moved backwards
            Err(_) => false,
        }
    }
}

/// Whether the local actor may post into a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatPermission {
    pub chat_id: ChatId,
    pub can_message: bool,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PermissionGate {
    source: Arc<dyn DataSource>,
    local_user: UserId,
    ttl: Duration,
    timeout: Duration,
    /// peer -> last successful remote decision
    cache: Arc<RwLock<HashMap<UserId, PermissionDecision>>>,
    /// chat -> in-flight background re-evaluation
    prefetches: Arc<Mutex<HashMap<ChatId, JoinHandle<()>>>>,
}

impl PermissionGate {
    pub fn new(
        source: Arc<dyn DataSource>,
        local_user: UserId,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            local_user,
            ttl,
            timeout,
            cache: Arc::new(RwLock::new(HashMap::new())),
            prefetches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decide whether the local actor may message `peer_id`.
    ///
    /// Fresh cached decisions are returned as-is; otherwise the backend is
    /// asked under the configured timeout. Only successful lookups are
    /// cached, so a failed check is retried on the next call.
    pub async fn evaluate(&self, peer_id: &UserId) -> PermissionDecision {
        // 1. Check the cache first.
        {
            let cache = self.cache.read().await;
            if let Some(decision) = cache.get(peer_id) {
                if decision.is_fresh(self.ttl) {
                    debug!(peer = %peer_id, allowed = decision.can_message, "Permission served from cache");
                    return decision.clone();
                }
            }
        }

        // 2. Ask the backend.
        let response = match tokio::time::timeout(self.timeout, self.source.can_message(peer_id)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(peer = %peer_id, error = %e, "Permission check failed, denying");
                return PermissionDecision::unavailable(peer_id);
            }
            Err(_) => {
                warn!(peer = %peer_id, timeout_ms = self.timeout.as_millis() as u64, "Permission check timed out, denying");
                return PermissionDecision::unavailable(peer_id);
            }
        };

        let decision = PermissionDecision {
            peer_id: peer_id.clone(),
            can_message: response.can_message,
            reason: response.reason,
            evaluated_at: Utc::now(),
        };

        // 3. Update the cache.
        self.cache
            .write()
            .await
            .insert(peer_id.clone(), decision.clone());

        info!(
            peer = %peer_id,
            allowed = decision.can_message,
            reason = decision.reason.as_deref().unwrap_or(""),
            "Permission evaluated"
        );
        decision
    }

    /// Decide for a whole chat. Group membership is its own permission
    /// basis; direct chats defer to the peer decision.
    pub async fn evaluate_chat(&self, chat: &Chat) -> ChatPermission {
        let (can_message, reason) = match chat.kind {
            ChatKind::Group if chat.participants.contains(&self.local_user) => (true, None),
            ChatKind::Group => (false, Some("not a member of this group".to_string())),
            ChatKind::Direct => match chat.peer_of(&self.local_user) {
                Some(peer) => {
                    let decision = self.evaluate(peer).await;
                    (decision.can_message, decision.reason)
                }
                None => (false, Some("chat has no other participant".to_string())),
            },
        };
        ChatPermission {
            chat_id: chat.id.clone(),
            can_message,
            reason,
        }
    }

    /// Forget the cached decision for `peer_id`; the next send re-asks.
    pub async fn invalidate(&self, peer_id: &UserId) -> bool {
        let removed = self.cache.write().await.remove(peer_id).is_some();
        debug!(peer = %peer_id, removed, "Permission invalidated");
        removed
    }

    /// Start a background re-evaluation for a chat the user is looking at.
    /// Replaces any prefetch already running for the same chat.
    pub fn prefetch(&self, chat: Chat) {
        let gate = self.clone();
        let chat_id = chat.id.clone();
        let handle = tokio::spawn(async move {
            gate.evaluate_chat(&chat).await;
        });

        let mut prefetches = self.prefetches.lock().unwrap_or_else(PoisonError::into_inner);
        prefetches.retain(|_, h| !h.is_finished());
        if let Some(previous) = prefetches.insert(chat_id, handle) {
            previous.abort();
        }
    }

    /// Abort an in-flight prefetch. A result that has not landed yet is
    /// discarded.
    pub fn cancel(&self, chat_id: &ChatId) -> bool {
        let handle = self
            .prefetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chat_id);
        match handle {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!(chat = %chat_id, "Permission prefetch cancelled");
                true
            }
            _ => false,
        }
    }

    /// Peek at the cache without contacting the backend.
    pub async fn cached(&self, peer_id: &UserId) -> Option<PermissionDecision> {
        self.cache.read().await.get(peer_id).cloned()
    }

    /// Evict decisions older than the freshness window.
    pub async fn purge_stale(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, decision| decision.is_fresh(self.ttl));
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged stale permission decisions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FixtureDataSource;

    fn gate_with(fixture: Arc<FixtureDataSource>, ttl: Duration, timeout: Duration) -> PermissionGate {
        PermissionGate::new(fixture, UserId::new("alice"), ttl, timeout)
    }

    fn fixture() -> Arc<FixtureDataSource> {
        Arc::new(FixtureDataSource::new(UserId::new("alice")))
    }

    #[tokio::test]
    async fn test_allowed_and_cached() {
        let source = fixture();
        source.set_connected("bob", true);
        let gate = gate_with(source.clone(), Duration::from_secs(60), Duration::from_secs(1));

        assert!(gate.evaluate(&UserId::new("bob")).await.can_message);
        assert!(gate.evaluate(&UserId::new("bob")).await.can_message);
        assert_eq!(source.permission_checks(), 1);
    }

    #[tokio::test]
    async fn test_stale_decision_rechecked() {
        let source = fixture();
        source.set_connected("bob", true);
        let gate = gate_with(source.clone(), Duration::ZERO, Duration::from_secs(1));

        gate.evaluate(&UserId::new("bob")).await;
        source.set_connected("bob", false);
        let decision = gate.evaluate(&UserId::new("bob")).await;
        assert!(!decision.can_message);
        assert_eq!(decision.reason.as_deref(), Some("not connected"));
        assert_eq!(source.permission_checks(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_fails_closed() {
        let source = fixture();
        source.set_connected("bob", true);
        source.fail_permission_checks(true);
        let gate = gate_with(source.clone(), Duration::from_secs(60), Duration::from_secs(1));

        let decision = gate.evaluate(&UserId::new("bob")).await;
        assert!(!decision.can_message);
        assert_eq!(decision.reason.as_deref(), Some(PERMISSION_UNAVAILABLE));
        assert!(gate.cached(&UserId::new("bob")).await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_fails_closed() {
        let source = fixture();
        source.set_connected("bob", true);
        source.delay_permission_checks(Duration::from_millis(200));
        let gate = gate_with(source, Duration::from_secs(60), Duration::from_millis(20));

        let decision = gate.evaluate(&UserId::new("bob")).await;
        assert!(!decision.can_message);
        assert_eq!(decision.reason.as_deref(), Some(PERMISSION_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recheck() {
        let source = fixture();
        source.set_connected("bob", true);
        let gate = gate_with(source.clone(), Duration::from_secs(60), Duration::from_secs(1));

        gate.evaluate(&UserId::new("bob")).await;
        source.set_connected("bob", false);
        assert!(gate.evaluate(&UserId::new("bob")).await.can_message);

        assert!(gate.invalidate(&UserId::new("bob")).await);
        assert!(!gate.evaluate(&UserId::new("bob")).await.can_message);
    }

    #[tokio::test]
    async fn test_group_chat_bypasses_remote_check() {
        let source = fixture();
        let gate = gate_with(source.clone(), Duration::from_secs(60), Duration::from_secs(1));
        let dto = source
            .create_chat(&[UserId::new("bob"), UserId::new("carol")], ChatKind::Group, Some("team"))
            .await
            .unwrap();

        let permission = gate.evaluate_chat(&Chat::from_dto(&dto)).await;
        assert!(permission.can_message);
        assert_eq!(source.permission_checks(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_prefetch_is_discarded() {
        let source = fixture();
        source.set_connected("bob", true);
        source.delay_permission_checks(Duration::from_millis(100));
        let gate = gate_with(source.clone(), Duration::from_secs(60), Duration::from_secs(1));
        let chat = Chat::from_dto(&source.add_direct_chat("c1", "bob"));

        gate.prefetch(chat.clone());
        tokio::task::yield_now().await;
        assert!(gate.cancel(&chat.id));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(gate.cached(&UserId::new("bob")).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let source = fixture();
        source.set_connected("bob", true);
        let gate = gate_with(source, Duration::ZERO, Duration::from_secs(1));
        gate.evaluate(&UserId::new("bob")).await;
        gate.purge_stale().await;
        assert!(gate.cached(&UserId::new("bob")).await.is_none());
    }
}

//! Stage result cache.
//!
//! Keys are scoped by the requester's permission-relevant context, so a
//! result computed for one requester is never served to another requester
//! with a different access scope.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use ragpipe_shared::{PipelineRequest, StageId, UserContext};

use crate::stage::{StageOutcome, StageOutputs};

/// Injected cache abstraction.
pub trait StageCache: Send + Sync {
    /// Unexpired entry for `key`, if any.
    fn get(&self, key: &str) -> Option<StageOutcome>;
    fn put(&self, key: String, value: StageOutcome, ttl: Duration);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn clear(&self);
}

#[derive(Debug)]
struct Entry {
    value: StageOutcome,
    expires_at: Instant,
    seq: u64,
}

/// Bounded in-process cache on a sharded concurrent map.
///
/// Eviction is FIFO by first insertion, tracked in a side queue of
/// `(seq, key)` pairs. Overwriting a key keeps its place. Expired entries are
/// dropped lazily on lookup; their queue slots are skipped at eviction.
#[derive(Debug)]
pub struct InMemoryStageCache {
    entries: DashMap<String, Entry>,
    order: Mutex<VecDeque<(u64, String)>>,
    next_seq: AtomicU64,
    max_entries: usize,
}

impl InMemoryStageCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            max_entries: max_entries.max(1),
        }
    }

    fn order(&self) -> MutexGuard<'_, VecDeque<(u64, String)>> {
        self.order.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue slots whose entry is gone or was replaced under the same key.
    fn is_stale(&self, seq: u64, key: &str) -> bool {
        self.entries.get(key).is_none_or(|e| e.seq != seq)
    }
}

impl StageCache for InMemoryStageCache {
    fn get(&self, key: &str) -> Option<StageOutcome> {
        let hit = self.entries.get(key).map(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })?;
        if hit.is_none() {
            self.entries
                .remove_if(key, |_, e| e.expires_at <= Instant::now());
        }
        hit
    }

    fn put(&self, key: String, value: StageOutcome, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut order = self.order();
        while self.entries.len() >= self.max_entries {
            let Some((old_seq, old_key)) = order.pop_front() else {
                break;
            };
            self.entries.remove_if(&old_key, |_, e| e.seq == old_seq);
        }
        // Lazily expired keys leave slots behind; drop them before they pile up.
        if order.len() >= self.max_entries * 2 {
            order.retain(|(seq, key)| !self.is_stale(*seq, key));
        }
        order.push_back((seq, key.clone()));
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        let mut order = self.order();
        self.entries.clear();
        order.clear();
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Requester fields that influence what a stage may see or produce.
#[derive(Serialize)]
struct PermissionScope<'a> {
    id: &'a str,
    roles: Vec<&'a str>,
    department: Option<&'a str>,
    clearance_level: Option<&'a str>,
    project_access: Vec<&'a str>,
    attributes: &'a std::collections::BTreeMap<String, serde_json::Value>,
    preferences: &'a Option<ragpipe_shared::UserPreferences>,
}

impl<'a> PermissionScope<'a> {
    fn of(user: &'a UserContext) -> Self {
        let mut roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        roles.sort_unstable();
        roles.dedup();
        let mut project_access: Vec<&str> = user.project_access.iter().map(String::as_str).collect();
        project_access.sort_unstable();
        project_access.dedup();
        Self {
            id: &user.id,
            roles,
            department: user.department.as_deref(),
            clearance_level: user.clearance_level.as_deref(),
            project_access,
            attributes: &user.attributes,
            preferences: &user.preferences,
        }
    }
}

/// SHA-256 key for `stage` given the request and the upstream outputs the
/// stage can see.
pub fn cache_key(stage: &StageId, request: &PipelineRequest, upstream: &StageOutputs) -> String {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(stage.as_str().as_bytes());
    field(request.query.trim().as_bytes());
    field(request.mode.as_str().as_bytes());
    field(request.optimization.as_str().as_bytes());
    field(&(request.max_chunks as u64).to_le_bytes());
    field(&request.temperature.to_bits().to_le_bytes());

    let scope = serde_json::to_vec(&PermissionScope::of(&request.user_context)).unwrap_or_default();
    field(&scope);

    let upstream_digest = Sha256::digest(serde_json::to_vec(upstream).unwrap_or_default());
    field(&upstream_digest);

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use ragpipe_shared::Mode;

    use crate::stage::StageOutput;

    use super::*;

    fn outcome(text: &str) -> StageOutcome {
        StageOutcome::new(StageOutput::Answer(text.into()))
    }

    fn request() -> PipelineRequest {
        let mut user = UserContext::new("alice");
        user.roles = vec!["analyst".into(), "admin".into()];
        PipelineRequest::new("What is machine learning?", user)
    }

    #[test]
    fn hit_miss_and_expiry() {
        let cache = InMemoryStageCache::new(10);
        cache.put("k".into(), outcome("a"), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(outcome("a")));
        assert_eq!(cache.get("other"), None);

        cache.put("gone".into(), outcome("b"), Duration::ZERO);
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.len(), 1, "expired entry dropped on lookup");
    }

    #[test]
    fn fifo_eviction() {
        let cache = InMemoryStageCache::new(2);
        cache.put("first".into(), outcome("1"), Duration::from_secs(60));
        cache.put("second".into(), outcome("2"), Duration::from_secs(60));
        // Reading does not refresh position.
        assert!(cache.get("first").is_some());
        cache.put("third".into(), outcome("3"), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
        assert!(cache.get("third").is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = InMemoryStageCache::new(2);
        cache.put("a".into(), outcome("1"), Duration::from_secs(60));
        cache.put("b".into(), outcome("2"), Duration::from_secs(60));
        cache.put("a".into(), outcome("3"), Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(outcome("3")));

        // "a" keeps its original slot, so it is still the first to go.
        cache.put("c".into(), outcome("4"), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn expired_slots_do_not_evict_live_entries() {
        let cache = InMemoryStageCache::new(2);
        cache.put("old".into(), outcome("1"), Duration::ZERO);
        assert!(cache.get("old").is_none());
        cache.put("old".into(), outcome("2"), Duration::from_secs(60));
        cache.put("b".into(), outcome("3"), Duration::from_secs(60));
        cache.put("c".into(), outcome("4"), Duration::from_secs(60));

        // The first "old" slot is stale; the re-inserted one is the oldest live entry.
        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn queue_stays_bounded_under_churn() {
        let cache = InMemoryStageCache::new(4);
        for i in 0..100 {
            let key = format!("k{i}");
            cache.put(key.clone(), outcome("x"), Duration::ZERO);
            assert!(cache.get(&key).is_none());
        }
        assert!(cache.order().len() <= 8);
        cache.clear();
        assert!(cache.order().is_empty());
    }

    #[test]
    fn key_is_deterministic_and_role_order_insensitive() {
        let outputs = StageOutputs::default();
        let a = request();
        let mut b = request();
        b.user_context.roles.reverse();
        assert_eq!(
            cache_key(&StageId::RETRIEVAL, &a, &outputs),
            cache_key(&StageId::RETRIEVAL, &b, &outputs)
        );
    }

    #[test]
    fn key_is_scoped_by_requester_permissions() {
        let outputs = StageOutputs::default();
        let base = request();
        let key = cache_key(&StageId::RETRIEVAL, &base, &outputs);

        let mut other_user = request();
        other_user.user_context.id = "bob".into();
        assert_ne!(key, cache_key(&StageId::RETRIEVAL, &other_user, &outputs));

        let mut cleared = request();
        cleared.user_context.clearance_level = Some("secret".into());
        assert_ne!(key, cache_key(&StageId::RETRIEVAL, &cleared, &outputs));

        let mut other_mode = request();
        other_mode.mode = Mode::Curated;
        assert_ne!(key, cache_key(&StageId::RETRIEVAL, &other_mode, &outputs));

        assert_ne!(key, cache_key(&StageId::GENERATION, &base, &outputs));
    }

    #[test]
    fn key_depends_on_upstream_outputs() {
        let req = request();
        let mut upstream = StageOutputs::default();
        let before = cache_key(&StageId::GENERATION, &req, &upstream);
        upstream.insert(StageId::RETRIEVAL, StageOutput::Candidates(vec![]));
        assert_ne!(before, cache_key(&StageId::GENERATION, &req, &upstream));
    }
}

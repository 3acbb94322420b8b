//! The keyed step cache and resume-state merge (`spec.md` §4.2, §3).
//!
//! Grounded on `other_examples/.../forge-core/.../context.rs`'s
//! `WorkflowContext::{is_step_completed, get_step_result,
//! record_step_start, record_step_complete}` — the "hit short-circuits a
//! step, miss lets it run, completion writes back" contract implemented
//! there for a single in-process context is generalized here into a
//! standalone trait so it can be shared across separate invocations of
//! the same workflow (`spec.md` §3: "StepCache... Externally owned").
//!
//! The concurrent map itself follows
//! `everruns_durable::persistence::memory::InMemoryWorkflowEventStore`'s
//! choice of an in-memory store for testing/default use, using `dashmap`
//! (already a dependency of the teacher crate) instead of a
//! `RwLock<HashMap<_>>` since the cache, unlike that store, is read and
//! written from concurrently racing `step.parallel` branches.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::result::StepOrigin;

/// Whether a cached entry represents a successful step or a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Ok,
    Err,
}

/// `meta` captured alongside a cached result: which primitive produced it
/// and, for throwing steps, the original thrown value (`spec.md` §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMeta {
    pub origin: Option<StepOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thrown: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_cause: Option<serde_json::Value>,
}

/// A single cached step outcome: `{result, meta}` per `spec.md` §3,
/// tagged with [`CacheOutcome`] so a cache hit can re-signal a cached
/// failure "exactly as originally reported" (§4.2) rather than always
/// resolving to success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outcome: CacheOutcome,
    pub value: serde_json::Value,
    #[serde(default)]
    pub meta: CacheMeta,
}

impl CacheEntry {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            outcome: CacheOutcome::Ok,
            value,
            meta: CacheMeta::default(),
        }
    }

    pub fn err(value: serde_json::Value, meta: CacheMeta) -> Self {
        Self {
            outcome: CacheOutcome::Err,
            value,
            meta,
        }
    }
}

/// Mapping from `step_key` to cached outcome (`spec.md` §6.1).
///
/// Reads happen on step entry with a non-empty key; writes happen on step
/// completion (success or typed error). The engine never clears the
/// cache and makes no attempt to serialize concurrent lookups for the
/// same key — "at most one concurrent execution per `(cache, key)` is the
/// caller's responsibility" (`spec.md` §4.2).
pub trait StepCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn set(&self, key: &str, entry: CacheEntry);
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
    /// Merge a resolved [`ResumeSource`] snapshot into this cache before a
    /// run starts. A no-op for caches that don't support bulk seeding.
    fn seed_resume_state(&self, _entries: HashMap<String, CacheEntry>) {}
}

/// Default, in-process `StepCache` backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryStepCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryStepCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Seed the cache with a snapshot, used when merging resume state.
    pub fn seed(&self, entries: HashMap<String, CacheEntry>) {
        for (key, entry) in entries {
            self.entries.insert(key, entry);
        }
    }

    /// Export every cached entry, for handing to [`ResumeSource::value`]
    /// on a later, resumed invocation.
    pub fn snapshot(&self) -> HashMap<String, CacheEntry> {
        self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

impl StepCache for InMemoryStepCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn set(&self, key: &str, entry: CacheEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    fn seed_resume_state(&self, entries: HashMap<String, CacheEntry>) {
        self.seed(entries);
    }
}

type ResumeProducer = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = HashMap<String, CacheEntry>> + Send>> + Send + Sync>;

/// A snapshot of keyed step outcomes enabling re-execution to skip
/// completed steps (`spec.md` §3), supplied either as a value or as an
/// async producer evaluated once at workflow start.
#[derive(Clone)]
pub enum ResumeSource {
    Value(HashMap<String, CacheEntry>),
    Producer(ResumeProducer),
}

impl ResumeSource {
    pub fn value(entries: HashMap<String, CacheEntry>) -> Self {
        Self::Value(entries)
    }

    pub fn producer<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HashMap<String, CacheEntry>> + Send + 'static,
    {
        Self::Producer(Arc::new(move || Box::pin(f())))
    }

    pub async fn resolve(&self) -> HashMap<String, CacheEntry> {
        match self {
            Self::Value(v) => v.clone(),
            Self::Producer(p) => p().await,
        }
    }
}

impl std::fmt::Debug for ResumeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(&v.len()).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = InMemoryStepCache::new();
        assert!(cache.get("k").is_none());
        cache.set("k", CacheEntry::ok(serde_json::json!(42)));
        let entry = cache.get("k").expect("should hit");
        assert_eq!(entry.value, serde_json::json!(42));
        assert_eq!(entry.outcome, CacheOutcome::Ok);
    }

    #[test]
    fn concurrent_same_key_last_writer_wins() {
        let cache = Arc::new(InMemoryStepCache::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                cache.set("k", CacheEntry::ok(serde_json::json!(i)));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.get("k").is_some());
    }

    #[tokio::test]
    async fn resume_source_value_resolves_immediately() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), CacheEntry::ok(serde_json::json!("x")));
        let resume = ResumeSource::value(map);
        let resolved = resume.resolve().await;
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn resume_source_producer_is_evaluated() {
        let resume = ResumeSource::producer(|| async {
            let mut map = HashMap::new();
            map.insert("b".to_string(), CacheEntry::ok(serde_json::json!(1)));
            map
        });
        let resolved = resume.resolve().await;
        assert!(resolved.contains_key("b"));
    }
}

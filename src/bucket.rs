//! Per-bucket mutual exclusion for outbound REST calls.
//!
//! Every request acquires the lock of its bucket before touching the network
//! and the pipeline decides when to release it. Locks are created lazily, one
//! per distinct [`BucketKey`], and never removed: the key space is bounded by
//! the number of distinct remote resources touched, not by request volume,
//! and evicting a lock while a caller is queued on it would split the queue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Parameters that identify a rate-limited resource. A route's bucket is the
/// combination of these with the raw template.
const MAJOR_PARAMS: [&str; 5] = [
    "guild_id",
    "channel_id",
    "webhook_id",
    "interaction_id",
    "interaction_token",
];

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Opaque key naming the remote rate-limit bucket of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A REST route: a raw template such as
/// `/interactions/{interaction_id}/{interaction_token}/callback` plus the
/// values for its placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRoute {
    template: String,
    params: BTreeMap<String, String>,
}

impl ApiRoute {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The template with every `{name}` placeholder substituted. Unknown
    /// placeholders are left untouched.
    pub fn path(&self) -> String {
        let mut path = self.template.clone();
        for (name, value) in &self.params {
            path = path.replace(&format!("{{{}}}", name), value);
        }
        path
    }

    /// `{guild}-{channel}-{webhook}-{interaction}-{token}::{template}`, with
    /// `0` for each absent major parameter.
    pub fn bucket(&self) -> BucketKey {
        let majors: Vec<&str> = MAJOR_PARAMS
            .iter()
            .map(|name| self.params.get(*name).map(String::as_str).unwrap_or("0"))
            .collect();
        BucketKey(format!("{}::{}", majors.join("-"), self.template))
    }
}

impl fmt::Display for ApiRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Held lock on one bucket. Dropping it releases the bucket.
pub type BucketGuard = OwnedMutexGuard<()>;

/// Maps bucket keys to their locks.
///
/// `tokio::sync::Mutex` queues waiters in FIFO order, so calls within one
/// bucket run in acquisition order. Distinct keys never share a lock.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    locks: DashMap<BucketKey, Arc<Mutex<()>>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by every pipeline that does not
    /// bring its own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<BucketRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// The lock for `key`, created if this is the first time the key is seen.
    /// Concurrent first uses observe the same lock.
    pub fn lock_for(&self, key: &BucketKey) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        let entry = self.locks.entry(key.clone()).or_insert_with(|| {
            debug!(bucket = %key, "creating bucket lock");
            Arc::new(Mutex::new(()))
        });
        Arc::clone(entry.value())
    }

    /// Wait for exclusive access to `key`'s bucket.
    pub async fn acquire(&self, key: &BucketKey) -> BucketGuard {
        self.lock_for(key).lock_owned().await
    }

    /// Number of distinct buckets seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Revision usage tracking: which running instances pin which `(name,
//! hash)` revisions. Drives the in-use guards for strategy removal and the
//! orphan checks during refresh. Mutated only under the manager's main
//! lock; snapshots are copy-on-read for metrics exposure.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Unit separator, keeping revision keys unambiguous for any name/hash.
const KEY_SEPARATOR: char = '\u{1F}';

/// Display/storage key for a `(name, hash)` revision.
pub fn revision_key(name: &str, hash: &str) -> String {
    format!("{name}{KEY_SEPARATOR}{hash}")
}

/// Aggregate usage of one revision.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionUsage {
    pub name: String,
    pub hash: String,
    pub instances: HashSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// In-memory usage ledger, owned by the manager.
#[derive(Debug, Default)]
pub struct UsageTracker {
    revisions: HashMap<(String, String), RevisionUsage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instance pinning a revision.
    pub fn record(&mut self, name: &str, hash: &str, instance_id: &str) {
        let now = Utc::now();
        let usage = self
            .revisions
            .entry((name.to_string(), hash.to_string()))
            .or_insert_with(|| RevisionUsage {
                name: name.to_string(),
                hash: hash.to_string(),
                instances: HashSet::new(),
                first_seen: now,
                last_seen: now,
            });
        usage.instances.insert(instance_id.to_string());
        usage.last_seen = now;
    }

    /// Release an instance's pin; the aggregate disappears with its last
    /// instance.
    pub fn release(&mut self, name: &str, hash: &str, instance_id: &str) {
        let key = (name.to_string(), hash.to_string());
        if let Some(usage) = self.revisions.get_mut(&key) {
            usage.instances.remove(instance_id);
            usage.last_seen = Utc::now();
            if usage.instances.is_empty() {
                self.revisions.remove(&key);
            }
        }
    }

    /// Instances pinning one revision, sorted for stable output.
    pub fn instances_pinning(&self, name: &str, hash: &str) -> Vec<String> {
        let mut instances: Vec<String> = self
            .revisions
            .get(&(name.to_string(), hash.to_string()))
            .map(|usage| usage.instances.iter().cloned().collect())
            .unwrap_or_default();
        instances.sort();
        instances
    }

    /// Instances pinning any revision of a name, sorted.
    pub fn instances_using(&self, name: &str) -> Vec<String> {
        let mut instances: Vec<String> = self
            .revisions
            .values()
            .filter(|usage| usage.name == name)
            .flat_map(|usage| usage.instances.iter().cloned())
            .collect();
        instances.sort();
        instances.dedup();
        instances
    }

    /// Copy-on-read snapshot of every tracked revision.
    pub fn snapshot(&self) -> Vec<RevisionUsage> {
        let mut all: Vec<RevisionUsage> = self.revisions.values().cloned().collect();
        all.sort_by(|a, b| revision_key(&a.name, &a.hash).cmp(&revision_key(&b.name, &b.hash)));
        all
    }
}

//! Version comparison and the recency cache behind "most recent version".
//!
//! Every recording group keeps one [`RecencyEntry`] holding the highest
//! version seen for each class. [`RecencyCache::observe`] performs the
//! compare-and-raise for a single group atomically, so concurrent workers
//! resolving siblings of the same group cannot both win.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use vfmigrate_parser::VersionLabel;

use crate::tracker::{MigrationRecord, MigrationStatus};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("recency cache unavailable: {0}")]
    Unavailable(String),

    #[error("recency cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("recency cache dump is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

/// Compares dot-separated version strings segment by segment. Missing
/// trailing segments and non-numeric segments count as zero.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left: Vec<u64> = segments(left);
    let right: Vec<u64> = segments(right);
    let len = left.len().max(right.len());
    for idx in 0..len {
        let a = left.get(idx).copied().unwrap_or(0);
        let b = right.get(idx).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn segments(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|segment| segment.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyEntry {
    pub orig_version_number: Option<String>,
    pub copy_version_number: Option<String>,
}

impl RecencyEntry {
    pub fn version_for(&self, label: VersionLabel) -> Option<&str> {
        match label {
            VersionLabel::Orig => self.orig_version_number.as_deref(),
            VersionLabel::Copy => self.copy_version_number.as_deref(),
        }
    }

    fn slot_mut(&mut self, label: VersionLabel) -> &mut Option<String> {
        match label {
            VersionLabel::Orig => &mut self.orig_version_number,
            VersionLabel::Copy => &mut self.copy_version_number,
        }
    }

    /// Applies one sighting and reports whether it ties or beats the best
    /// version already known for its class.
    pub fn observe(&mut self, label: VersionLabel, version: &str) -> bool {
        let slot = self.slot_mut(label);
        match slot.as_deref() {
            Some(current) if compare_versions(version, current) == Ordering::Less => false,
            _ => {
                *slot = Some(version.to_string());
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub is_most_recent: bool,
    /// Entry as it was before this sighting.
    pub previous: RecencyEntry,
}

/// Key-value store backing version resolution. Keys are group keys; the
/// implementation applies its own namespace.
#[async_trait]
pub trait RecencyCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RecencyEntry>, CacheError>;

    async fn set(&self, key: &str, entry: RecencyEntry) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically compares `version` with the cached value for `label` and
    /// raises the cached value when `version` is greater or equal.
    async fn observe(
        &self,
        key: &str,
        label: VersionLabel,
        version: &str,
    ) -> Result<Observation, CacheError>;

    /// Drops every entry in this cache's namespace, returning how many went.
    async fn clear(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecencyCache {
    namespace: String,
    entries: DashMap<String, RecencyEntry>,
}

impl MemoryRecencyCache {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: DashMap::new(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(&self.namespace))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump_to_path(&self, path: &Path) -> Result<usize, CacheError> {
        let snapshot: HashMap<String, RecencyEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &snapshot)?;
        debug!(path = %path.display(), entries = snapshot.len(), "Dumped recency cache");
        Ok(snapshot.len())
    }

    /// Loads a dump written by [`MemoryRecencyCache::dump_to_path`]. Entries
    /// in the file overwrite entries with the same key.
    pub fn load_from_path(&self, path: &Path) -> Result<usize, CacheError> {
        let file = std::fs::File::open(path)?;
        let snapshot: HashMap<String, RecencyEntry> =
            serde_json::from_reader(std::io::BufReader::new(file))?;
        let count = snapshot.len();
        for (key, entry) in snapshot {
            self.entries.insert(key, entry);
        }
        debug!(path = %path.display(), entries = count, "Loaded recency cache");
        Ok(count)
    }
}

#[async_trait]
impl RecencyCache for MemoryRecencyCache {
    async fn get(&self, key: &str) -> Result<Option<RecencyEntry>, CacheError> {
        Ok(self
            .entries
            .get(&self.namespaced(key))
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, entry: RecencyEntry) -> Result<(), CacheError> {
        self.entries.insert(self.namespaced(key), entry);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.contains_key(&self.namespaced(key)))
    }

    async fn observe(
        &self,
        key: &str,
        label: VersionLabel,
        version: &str,
    ) -> Result<Observation, CacheError> {
        // The entry guard holds the shard lock until the update is done.
        let mut entry = self.entries.entry(self.namespaced(key)).or_default();
        let previous = entry.value().clone();
        let is_most_recent = entry.value_mut().observe(label, version);
        Ok(Observation {
            is_most_recent,
            previous,
        })
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !key.starts_with(&self.namespace));
        Ok(before - self.entries.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub standardized_version_number: i32,
    pub is_most_recent: bool,
    pub orig_version_component: String,
    pub copy_version_component: Option<String>,
}

#[derive(Clone)]
pub struct VersionResolver {
    cache: Arc<dyn RecencyCache>,
}

impl VersionResolver {
    pub fn new(cache: Arc<dyn RecencyCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn RecencyCache> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        label: VersionLabel,
        version_number: &str,
        group_key: &str,
    ) -> Result<Resolution, CacheError> {
        let version_number = normalized(version_number);
        let observation = self.cache.observe(group_key, label, version_number).await?;

        let (orig_version_component, copy_version_component) = match label {
            VersionLabel::Orig => (version_number.to_string(), None),
            VersionLabel::Copy => match version_number.split_once('.') {
                Some((orig, copy)) => (orig.to_string(), Some(copy.to_string())),
                None => (
                    observation
                        .previous
                        .orig_version_number
                        .clone()
                        .unwrap_or_else(|| "1".to_string()),
                    Some(version_number.to_string()),
                ),
            },
        };

        Ok(Resolution {
            standardized_version_number: label.standardized_number(),
            is_most_recent: observation.is_most_recent,
            orig_version_component,
            copy_version_component,
        })
    }

    /// Whether `version_number` still ties or beats the cached best for its
    /// class. Used after a whole chunk has been observed.
    pub async fn is_current(
        &self,
        label: VersionLabel,
        version_number: &str,
        group_key: &str,
    ) -> Result<bool, CacheError> {
        let version_number = normalized(version_number);
        Ok(match self.cache.get(group_key).await? {
            Some(entry) => entry
                .version_for(label)
                .map_or(true, |best| compare_versions(version_number, best) != Ordering::Less),
            None => true,
        })
    }

    /// Whether an ORIG sibling has been seen for the group.
    pub async fn has_parent(&self, group_key: &str) -> Result<bool, CacheError> {
        Ok(self
            .cache
            .get(group_key)
            .await?
            .is_some_and(|entry| entry.orig_version_number.is_some()))
    }
}

/// An archive without a version number is version 1.
fn normalized(version_number: &str) -> &str {
    match version_number.trim() {
        "" => "1",
        trimmed => trimmed,
    }
}

/// Re-observes the versions recorded on tracker rows so that a restarted run
/// sees the same recency state. Skipped rows never reached the resolver and
/// are ignored.
pub async fn replay_from_records(
    cache: &dyn RecencyCache,
    records: &[MigrationRecord],
) -> Result<usize, CacheError> {
    let mut replayed = 0;
    for record in records {
        if record.status == MigrationStatus::Skipped {
            continue;
        }
        let (Some(group_key), Some(label), Some(version)) = (
            record.recording_group_key.as_deref(),
            record.version_label,
            record.version_number.as_deref(),
        ) else {
            continue;
        };
        cache.observe(group_key, label, version).await?;
        replayed += 1;
    }
    info!(replayed, "Replayed recency cache from migration records");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_dot_segments_numerically() {
        assert_eq!(compare_versions("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1", "1"), Ordering::Equal);
        assert_eq!(compare_versions("1", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn malformed_segments_compare_as_zero() {
        assert_eq!(compare_versions("1.a", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("x", "0"), Ordering::Equal);
    }

    #[tokio::test]
    async fn ties_count_as_most_recent() {
        let cache = MemoryRecencyCache::new("t:");
        assert!(cache.observe("g", VersionLabel::Copy, "2").await.unwrap().is_most_recent);
        assert!(cache.observe("g", VersionLabel::Copy, "2").await.unwrap().is_most_recent);
        assert!(!cache.observe("g", VersionLabel::Copy, "1").await.unwrap().is_most_recent);
        let entry = cache.get("g").await.unwrap().unwrap();
        assert_eq!(entry.copy_version_number.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn missing_version_numbers_count_as_one() {
        let resolver = VersionResolver::new(Arc::new(MemoryRecencyCache::new("t:")));
        resolver.resolve(VersionLabel::Orig, "", "g").await.unwrap();
        assert!(resolver.is_current(VersionLabel::Orig, "", "g").await.unwrap());
        assert!(resolver.is_current(VersionLabel::Orig, "1", "g").await.unwrap());

        resolver.resolve(VersionLabel::Orig, "2", "g").await.unwrap();
        assert!(!resolver.is_current(VersionLabel::Orig, " ", "g").await.unwrap());
    }

    #[tokio::test]
    async fn classes_are_versioned_independently() {
        let resolver = VersionResolver::new(Arc::new(MemoryRecencyCache::new("t:")));
        let orig = resolver.resolve(VersionLabel::Orig, "3", "g").await.unwrap();
        let copy = resolver.resolve(VersionLabel::Copy, "1", "g").await.unwrap();
        assert!(orig.is_most_recent);
        assert!(copy.is_most_recent);
        assert_eq!(orig.standardized_version_number, 1);
        assert_eq!(copy.standardized_version_number, 2);
        assert_eq!(copy.orig_version_component, "3");
        assert_eq!(copy.copy_version_component.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn dotted_copy_versions_split_into_components() {
        let resolver = VersionResolver::new(Arc::new(MemoryRecencyCache::new("t:")));
        let copy = resolver.resolve(VersionLabel::Copy, "2.4", "g").await.unwrap();
        assert_eq!(copy.orig_version_component, "2");
        assert_eq!(copy.copy_version_component.as_deref(), Some("4"));
        assert!(!resolver.has_parent("g").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_observers_agree_on_the_maximum() {
        let cache = Arc::new(MemoryRecencyCache::new("t:"));
        let mut handles = Vec::new();
        for version in 1..=32u32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .observe("g", VersionLabel::Orig, &version.to_string())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let resolver = VersionResolver::new(cache);
        assert!(resolver.is_current(VersionLabel::Orig, "32", "g").await.unwrap());
        assert!(!resolver.is_current(VersionLabel::Orig, "31", "g").await.unwrap());
    }

    #[tokio::test]
    async fn clear_only_touches_own_namespace() {
        let cache = MemoryRecencyCache::new("a:");
        cache.set("g", RecencyEntry::default()).await.unwrap();
        cache.entries.insert("b:g".into(), RecencyEntry::default());
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.entries.contains_key("b:g"));
        assert!(!cache.exists("g").await.unwrap());
    }

    #[tokio::test]
    async fn dump_and_load_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = MemoryRecencyCache::new("vf:");
        cache.observe("g", VersionLabel::Orig, "2").await.unwrap();
        assert_eq!(cache.dump_to_path(&path).unwrap(), 1);

        let restored = MemoryRecencyCache::new("vf:");
        assert_eq!(restored.load_from_path(&path).unwrap(), 1);
        let entry = restored.get("g").await.unwrap().unwrap();
        assert_eq!(entry.orig_version_number.as_deref(), Some("2"));
    }
}

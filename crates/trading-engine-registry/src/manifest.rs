//! Registry manifest: the persisted `registry.json` at the storage root.
//!
//! The manifest maps strategy names to their tag aliases and stored
//! revisions. Writes are atomic (write to a temp file in the same
//! directory, then rename), so a crash mid-store leaves either the prior
//! or the new manifest on disk, never a torn one. Name, tag, and path
//! segments that could escape the storage root are rejected at write time.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use trading_engine_core::error::{EngineError, Result};

/// Manifest file name at the storage root.
pub const MANIFEST_FILE: &str = "registry.json";

/// One stored revision of a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Primary tag the revision was stored under
    pub tag: String,
    /// Module file path relative to the storage root
    pub path: String,
}

/// Per-name aggregation of tags and revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// tag → canonical hash
    pub tags: BTreeMap<String, String>,
    /// canonical hash → revision record
    pub hashes: BTreeMap<String, RevisionRecord>,
}

/// The whole manifest: name → entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: BTreeMap<String, RegistryEntry>,
}

impl Manifest {
    /// Load the manifest from a storage root. A missing file yields an
    /// empty manifest; a malformed one is an error.
    pub fn load(root: &Path) -> Result<Manifest> {
        let path = root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&raw).map_err(|err| EngineError::RegistryUnavailable {
            message: format!("malformed {MANIFEST_FILE}: {err}"),
        })?;
        Ok(manifest)
    }

    /// Atomically persist the manifest under the storage root.
    pub fn save(&self, root: &Path) -> Result<()> {
        self.validate_segments()?;
        std::fs::create_dir_all(root)?;
        let mut temp = tempfile::NamedTempFile::new_in(root)?;
        let body = serde_json::to_vec_pretty(self)?;
        temp.write_all(&body)?;
        temp.flush()?;
        temp.persist(root.join(MANIFEST_FILE))
            .map_err(|err| EngineError::IoError {
                message: format!("manifest rename failed: {err}"),
            })?;
        Ok(())
    }

    /// Reject names, tags, and path segments that could traverse out of
    /// the storage root.
    fn validate_segments(&self) -> Result<()> {
        for (name, entry) in &self.entries {
            validate_segment("strategy name", name)?;
            for tag in entry.tags.keys() {
                validate_segment("tag", tag)?;
            }
            for record in entry.hashes.values() {
                for segment in record.path.split('/') {
                    validate_segment("path segment", segment)?;
                }
            }
        }
        Ok(())
    }
}

/// Shared path-segment guard, also applied by the store before any file
/// lands on disk.
pub(crate) fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == ".."
        || segment.contains("..")
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(EngineError::InvalidSpec {
            message: format!("{kind} {segment:?} is not a valid path segment"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::default();
        let mut entry = RegistryEntry::default();
        let hash = format!("sha256:{}", "a".repeat(64));
        entry.tags.insert("latest".to_string(), hash.clone());
        entry.hashes.insert(
            hash,
            RevisionRecord {
                tag: "latest".to_string(),
                path: format!("delay/{}/delay.js", "a".repeat(64)),
            },
        );
        manifest.entries.insert("delay".to_string(), entry);
        manifest
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample();
        manifest.save(dir.path()).unwrap();
        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_missing_manifest_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Manifest::load(dir.path()).unwrap();
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn test_malformed_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{oops").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(EngineError::RegistryUnavailable { .. })
        ));
    }

    #[test]
    fn test_traversal_segments_rejected_at_write_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample();
        let entry = manifest.entries.remove("delay").unwrap();
        manifest.entries.insert("../escape".to_string(), entry);
        assert!(manifest.save(dir.path()).is_err());
        assert!(!dir.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_save_replaces_prior_manifest_atomically() {
        let dir = tempfile::tempdir().unwrap();
        sample().save(dir.path()).unwrap();
        let mut updated = sample();
        updated.entries.insert("noop".to_string(), RegistryEntry::default());
        updated.save(dir.path()).unwrap();
        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.entries.len(), 2);
    }
}

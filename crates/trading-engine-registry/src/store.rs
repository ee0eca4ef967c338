//! # Content-Addressed Module Store
//!
//! Persists strategy source keyed by the sha256 of its content, exposes
//! mutable tag aliases over immutable revisions, resolves selectors, and
//! coordinates hot-reload.
//!
//! Storage layout under `root/`:
//!
//! ```text
//! registry.json                      manifest (atomic temp-then-rename)
//! <name>/<hex-digest>/<name>.js      module source, content-addressed
//! ```
//!
//! Reads go through an immutable index snapshot behind an `ArcSwap`;
//! mutations serialize on a store-level lock, persist the manifest first,
//! and only then swap the snapshot, so a failed mutation leaves both disk
//! and memory in the prior state. A bounded LRU memoizes selector
//! resolution and is cleared on every mutation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use trading_engine_core::error::{EngineError, Result};

use crate::compiler::{CompiledModule, ModuleCompiler};
use crate::manifest::{Manifest, RegistryEntry, RevisionRecord};
use crate::selector::{normalize_hash, Resolution, Selector};

/// Capacity of the selector-resolution cache.
const SELECTOR_CACHE_CAPACITY: usize = 256;

/// The reserved tag every stored strategy keeps pointing at a revision.
pub const LATEST_TAG: &str = "latest";

/// Options controlling tag assignment during [`ModuleStore::store`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Primary tag for the revision; defaults to the module's metadata tag,
    /// then to `latest`
    pub tag: Option<String>,
    /// Additional aliases to point at the revision
    pub aliases: Vec<String>,
    /// Allow `aliases` to move tags that already point elsewhere
    pub reassign_tags: bool,
    /// Force `latest` onto this revision even if it already exists
    pub promote_latest: bool,
}

/// A stored, compiled revision.
#[derive(Debug, Clone)]
pub struct StoredModule {
    pub name: String,
    pub hash: String,
    pub source: String,
    pub module: CompiledModule,
}

/// Resolution outcome paired with the resolved module.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub resolution: Resolution,
    pub module: Arc<StoredModule>,
}

/// Listing summary for one stored strategy.
#[derive(Debug, Clone)]
pub struct ModuleListing {
    pub name: String,
    /// tag → hash
    pub tag_aliases: std::collections::BTreeMap<String, String>,
    pub revisions: Vec<RevisionSummary>,
}

/// Listing summary for one revision.
#[derive(Debug, Clone)]
pub struct RevisionSummary {
    pub hash: String,
    pub tags: Vec<String>,
    pub path: String,
}

/// What a [`ModuleStore::delete`] removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A single tag alias was dropped
    Tag { name: String, tag: String, hash: String },
    /// A revision and every tag pointing at it were dropped
    Revision {
        name: String,
        hash: String,
        removed_tags: Vec<String>,
    },
    /// A whole strategy entry was dropped
    Strategy { name: String, hashes: Vec<String> },
}

struct StoreIndex {
    manifest: Manifest,
    modules: HashMap<String, Arc<StoredModule>>,
}

/// Content-addressed strategy module store.
pub struct ModuleStore {
    root: PathBuf,
    compiler: Arc<dyn ModuleCompiler>,
    index: ArcSwap<StoreIndex>,
    write: Mutex<()>,
    cache: Mutex<LruCache<String, Resolution>>,
}

impl ModuleStore {
    /// Open a store at `root`, compiling every revision the manifest
    /// references. A missing manifest yields an empty store.
    pub fn open(root: impl Into<PathBuf>, compiler: Arc<dyn ModuleCompiler>) -> Result<Self> {
        let root = root.into();
        let manifest = Manifest::load(&root)?;
        let index = build_index(&root, compiler.as_ref(), manifest)?;
        Ok(Self {
            root,
            compiler,
            index: ArcSwap::from_pointee(index),
            write: Mutex::new(()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SELECTOR_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a selector to a revision and its compiled module.
    pub fn resolve(&self, selector: &str) -> Result<ResolvedModule> {
        let parsed = Selector::parse(selector)?;
        let canonical = parsed.canonical();
        let index = self.index.load();

        if let Some(resolution) = self.cache_get(&canonical) {
            if let Some(module) = index.modules.get(&resolution.hash) {
                return Ok(ResolvedModule {
                    resolution,
                    module: Arc::clone(module),
                });
            }
        }

        let resolution = resolve_in(&index.manifest, &parsed)?;
        let module = index
            .modules
            .get(&resolution.hash)
            .cloned()
            .ok_or_else(|| EngineError::RegistryUnavailable {
                message: format!("revision {} present in manifest but not loaded", resolution.hash),
            })?;
        self.cache_put(canonical, resolution.clone());
        Ok(ResolvedModule { resolution, module })
    }

    /// Whether the store currently holds a strategy of this name.
    pub fn contains_name(&self, name: &str) -> bool {
        self.index.load().manifest.entries.contains_key(name)
    }

    /// Compile, content-address, and persist a module revision, updating
    /// tag pointers per `options`. Storing identical content reuses the
    /// existing file; tag pointers still move.
    pub fn store(&self, source: &str, options: StoreOptions) -> Result<Resolution> {
        let module = self.compiler.compile(source)?;
        let name = module.metadata.name.clone();
        let digest = sha256_hex(source.as_bytes());
        let hash = format!("sha256:{digest}");
        let primary_tag = options
            .tag
            .clone()
            .or_else(|| module.metadata.tag.clone())
            .unwrap_or_else(|| LATEST_TAG.to_string());

        // Path safety before anything touches the filesystem.
        crate::manifest::validate_segment("strategy name", &name)?;
        crate::manifest::validate_segment("tag", &primary_tag)?;
        for alias in &options.aliases {
            crate::manifest::validate_segment("tag", alias)?;
        }

        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.index.load_full();
        let mut manifest = current.manifest.clone();

        if let Some(owner) = find_owner(&manifest, &hash) {
            if owner != name {
                return Err(EngineError::HashBelongsToDifferentName {
                    name: name.clone(),
                    hash,
                });
            }
        }

        let relative_path = format!("{name}/{digest}/{name}.js");
        let entry = manifest.entries.entry(name.clone()).or_default();

        for alias in &options.aliases {
            if let Some(existing) = entry.tags.get(alias) {
                if existing != &hash && !options.reassign_tags {
                    return Err(EngineError::InvalidSpec {
                        message: format!(
                            "tag {alias:?} already points to another revision of {name:?}; set reassign_tags to move it"
                        ),
                    });
                }
            }
        }

        entry.hashes.insert(
            hash.clone(),
            RevisionRecord {
                tag: primary_tag.clone(),
                path: relative_path.clone(),
            },
        );
        entry.tags.insert(primary_tag.clone(), hash.clone());
        for alias in &options.aliases {
            entry.tags.insert(alias.clone(), hash.clone());
        }
        if options.promote_latest || !entry.tags.contains_key(LATEST_TAG) {
            entry.tags.insert(LATEST_TAG.to_string(), hash.clone());
        }

        // Content-addressed write: skip when the revision file exists.
        let file_path = self.root.join(&relative_path);
        if !file_path.exists() {
            let dir = file_path.parent().expect("revision file has a parent");
            std::fs::create_dir_all(dir)?;
            let mut temp = tempfile::NamedTempFile::new_in(dir)?;
            std::io::Write::write_all(&mut temp, source.as_bytes())?;
            temp.persist(&file_path).map_err(|err| EngineError::IoError {
                message: format!("module write failed: {err}"),
            })?;
        }

        manifest.save(&self.root)?;

        let mut modules = current.modules.clone();
        modules.insert(
            hash.clone(),
            Arc::new(StoredModule {
                name: name.clone(),
                hash: hash.clone(),
                source: source.to_string(),
                module,
            }),
        );
        self.install(StoreIndex { manifest, modules });

        debug!(%name, %hash, tag = %primary_tag, "stored module revision");
        Ok(Resolution {
            selector: if primary_tag == LATEST_TAG {
                name.clone()
            } else {
                format!("{name}:{primary_tag}")
            },
            name,
            hash,
            tag: primary_tag,
        })
    }

    /// Point `tag` at an existing revision of `name`. Returns the hash the
    /// tag previously pointed to, for audit trails. `latest` is a valid
    /// target.
    pub fn assign_tag(&self, name: &str, tag: &str, hash: &str) -> Result<Option<String>> {
        let hash = normalize_hash(hash).ok_or_else(|| EngineError::InvalidSpec {
            message: format!("malformed revision hash {hash:?}"),
        })?;
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.index.load_full();
        let mut manifest = current.manifest.clone();

        let entry = manifest
            .entries
            .get_mut(name)
            .ok_or_else(|| EngineError::ModuleNotFound {
                selector: name.to_string(),
            })?;
        if !entry.hashes.contains_key(&hash) {
            return Err(match find_owner(&current.manifest, &hash) {
                Some(_) => EngineError::HashBelongsToDifferentName {
                    name: name.to_string(),
                    hash,
                },
                None => EngineError::ModuleNotFound {
                    selector: format!("{name}@{hash}"),
                },
            });
        }
        let previous = entry.tags.insert(tag.to_string(), hash);
        manifest.save(&self.root)?;
        self.install(StoreIndex {
            manifest,
            modules: current.modules.clone(),
        });
        Ok(previous)
    }

    /// Delete a tag alias. `latest` is rejected; orphaning a revision (no
    /// remaining tag references) requires `allow_orphan`. Returns the hash
    /// the tag pointed to.
    pub fn delete_tag(&self, name: &str, tag: &str, allow_orphan: bool) -> Result<String> {
        if tag == LATEST_TAG {
            return Err(EngineError::InvalidSpec {
                message: "the latest tag cannot be deleted, only reassigned".to_string(),
            });
        }
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.index.load_full();
        let mut manifest = current.manifest.clone();

        let entry = manifest
            .entries
            .get_mut(name)
            .ok_or_else(|| EngineError::ModuleNotFound {
                selector: name.to_string(),
            })?;
        let hash = entry
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTag {
                name: name.to_string(),
                tag: tag.to_string(),
            })?;

        let other_refs = entry
            .tags
            .iter()
            .any(|(other, target)| other != tag && target == &hash);
        if !other_refs && !allow_orphan {
            return Err(EngineError::InvalidSpec {
                message: format!(
                    "deleting tag {tag:?} would leave revision {hash} of {name:?} with no tag references"
                ),
            });
        }

        entry.tags.remove(tag);
        if let Some(record) = entry.hashes.get_mut(&hash) {
            if record.tag == tag {
                record.tag = entry
                    .tags
                    .iter()
                    .find(|(_, target)| *target == &hash)
                    .map(|(other, _)| other.clone())
                    .unwrap_or_default();
            }
        }

        manifest.save(&self.root)?;
        self.install(StoreIndex {
            manifest,
            modules: current.modules.clone(),
        });
        Ok(hash)
    }

    /// Delete whatever the selector names: a tag alias, a revision (with
    /// every tag pointing at it), or a whole strategy entry. In-use guards
    /// are the manager's responsibility and are enforced before this call.
    pub fn delete(&self, selector: &str) -> Result<DeleteOutcome> {
        let parsed = Selector::parse(selector)?;
        if let Selector::NameTag { name, tag } = &parsed {
            let hash = self.delete_tag(name, tag, true)?;
            return Ok(DeleteOutcome::Tag {
                name: name.clone(),
                tag: tag.clone(),
                hash,
            });
        }

        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.index.load_full();
        let mut manifest = current.manifest.clone();
        let mut modules = current.modules.clone();

        let outcome = match &parsed {
            Selector::Name(name) => {
                let entry =
                    manifest
                        .entries
                        .remove(name)
                        .ok_or_else(|| EngineError::ModuleNotFound {
                            selector: name.clone(),
                        })?;
                let hashes: Vec<String> = entry.hashes.keys().cloned().collect();
                for hash in &hashes {
                    modules.remove(hash);
                }
                remove_dir_quiet(&self.root.join(name));
                DeleteOutcome::Strategy {
                    name: name.clone(),
                    hashes,
                }
            }
            Selector::NameHash { .. } | Selector::Hash(_) => {
                let (name, hash) = match &parsed {
                    Selector::NameHash { name, hash } => (name.clone(), hash.clone()),
                    Selector::Hash(hash) => {
                        let owner = find_owner(&manifest, hash)
                            .map(str::to_string)
                            .ok_or_else(|| EngineError::ModuleNotFound {
                                selector: parsed.canonical(),
                            })?;
                        (owner, hash.clone())
                    }
                    _ => unreachable!(),
                };
                let entry =
                    manifest
                        .entries
                        .get_mut(&name)
                        .ok_or_else(|| EngineError::ModuleNotFound {
                            selector: parsed.canonical(),
                        })?;
                let record = entry.hashes.remove(&hash).ok_or_else(|| {
                    match find_owner(&current.manifest, &hash) {
                        Some(_) => EngineError::HashBelongsToDifferentName {
                            name: name.clone(),
                            hash: hash.clone(),
                        },
                        None => EngineError::ModuleNotFound {
                            selector: parsed.canonical(),
                        },
                    }
                })?;

                let removed_tags: Vec<String> = entry
                    .tags
                    .iter()
                    .filter(|(_, target)| *target == &hash)
                    .map(|(tag, _)| tag.clone())
                    .collect();
                for tag in &removed_tags {
                    entry.tags.remove(tag);
                }
                // Keep the latest pointer alive while revisions remain.
                if !entry.hashes.is_empty() && !entry.tags.contains_key(LATEST_TAG) {
                    let fallback = entry.hashes.keys().next().cloned();
                    if let Some(fallback) = fallback {
                        entry.tags.insert(LATEST_TAG.to_string(), fallback);
                    }
                }
                if entry.hashes.is_empty() {
                    manifest.entries.remove(&name);
                }
                modules.remove(&hash);
                if let Some(dir) = Path::new(&record.path).parent() {
                    remove_dir_quiet(&self.root.join(dir));
                }
                DeleteOutcome::Revision {
                    name,
                    hash,
                    removed_tags,
                }
            }
            Selector::NameTag { .. } => unreachable!("tag deletion handled above"),
        };

        manifest.save(&self.root)?;
        self.install(StoreIndex { manifest, modules });
        Ok(outcome)
    }

    /// Reload the manifest from disk, recompiling every referenced
    /// revision. The in-memory index swaps only on full success; any
    /// failure leaves the prior state intact.
    pub fn refresh(&self) -> Result<()> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let manifest = Manifest::load(&self.root)?;
        let index = build_index(&self.root, self.compiler.as_ref(), manifest)?;
        self.install(index);
        debug!(root = %self.root.display(), "registry refreshed");
        Ok(())
    }

    /// Per-name summaries driven from the in-memory index.
    pub fn list(&self) -> Vec<ModuleListing> {
        let index = self.index.load();
        index
            .manifest
            .entries
            .iter()
            .map(|(name, entry)| ModuleListing {
                name: name.clone(),
                tag_aliases: entry.tags.clone(),
                revisions: entry
                    .hashes
                    .iter()
                    .map(|(hash, record)| RevisionSummary {
                        hash: hash.clone(),
                        tags: entry
                            .tags
                            .iter()
                            .filter(|(_, target)| *target == hash)
                            .map(|(tag, _)| tag.clone())
                            .collect(),
                        path: record.path.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn install(&self, index: StoreIndex) {
        self.index.store(Arc::new(index));
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn cache_get(&self, key: &str) -> Option<Resolution> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_put(&self, key: String, resolution: Resolution) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, resolution);
    }
}

fn resolve_in(manifest: &Manifest, selector: &Selector) -> Result<Resolution> {
    match selector {
        Selector::Name(name) => {
            let entry = manifest
                .entries
                .get(name)
                .ok_or_else(|| EngineError::ModuleNotFound {
                    selector: name.clone(),
                })?;
            let hash = entry
                .tags
                .get(LATEST_TAG)
                .cloned()
                .ok_or_else(|| EngineError::UnknownTag {
                    name: name.clone(),
                    tag: LATEST_TAG.to_string(),
                })?;
            Ok(Resolution {
                name: name.clone(),
                hash,
                tag: LATEST_TAG.to_string(),
                selector: name.clone(),
            })
        }
        Selector::NameTag { name, tag } => {
            let entry = manifest
                .entries
                .get(name)
                .ok_or_else(|| EngineError::ModuleNotFound {
                    selector: selector.canonical(),
                })?;
            let hash = entry
                .tags
                .get(tag)
                .cloned()
                .ok_or_else(|| EngineError::UnknownTag {
                    name: name.clone(),
                    tag: tag.clone(),
                })?;
            Ok(Resolution {
                name: name.clone(),
                hash,
                tag: tag.clone(),
                selector: selector.canonical(),
            })
        }
        Selector::NameHash { name, hash } => {
            let entry = manifest
                .entries
                .get(name)
                .ok_or_else(|| EngineError::ModuleNotFound {
                    selector: selector.canonical(),
                })?;
            if !entry.hashes.contains_key(hash) {
                return Err(match find_owner(manifest, hash) {
                    Some(_) => EngineError::HashBelongsToDifferentName {
                        name: name.clone(),
                        hash: hash.clone(),
                    },
                    None => EngineError::ModuleNotFound {
                        selector: selector.canonical(),
                    },
                });
            }
            Ok(Resolution {
                name: name.clone(),
                hash: hash.clone(),
                tag: String::new(),
                selector: selector.canonical(),
            })
        }
        Selector::Hash(hash) => {
            let name = find_owner(manifest, hash)
                .map(str::to_string)
                .ok_or_else(|| EngineError::ModuleNotFound {
                    selector: hash.clone(),
                })?;
            Ok(Resolution {
                name,
                hash: hash.clone(),
                tag: String::new(),
                selector: hash.clone(),
            })
        }
    }
}

fn find_owner<'a>(manifest: &'a Manifest, hash: &str) -> Option<&'a str> {
    manifest
        .entries
        .iter()
        .find(|(_, entry)| entry.hashes.contains_key(hash))
        .map(|(name, _)| name.as_str())
}

fn build_index(
    root: &Path,
    compiler: &dyn ModuleCompiler,
    manifest: Manifest,
) -> Result<StoreIndex> {
    let mut modules = HashMap::new();
    for (name, entry) in &manifest.entries {
        for (hash, record) in &entry.hashes {
            let path = root.join(&record.path);
            let source =
                std::fs::read_to_string(&path).map_err(|err| EngineError::RegistryUnavailable {
                    message: format!("revision {hash} of {name:?} unreadable at {}: {err}", path.display()),
                })?;
            let digest = format!("sha256:{}", sha256_hex(source.as_bytes()));
            if &digest != hash {
                return Err(EngineError::RegistryUnavailable {
                    message: format!(
                        "revision {hash} of {name:?} failed content verification (found {digest})"
                    ),
                });
            }
            let module = compiler.compile(&source)?;
            modules.insert(
                hash.clone(),
                Arc::new(StoredModule {
                    name: name.clone(),
                    hash: hash.clone(),
                    source,
                    module,
                }),
            );
        }
    }
    Ok(StoreIndex { manifest, modules })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn remove_dir_quiet(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove revision directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::JsonModuleCompiler;

    fn module_source(name: &str, tag: &str, marker: &str) -> String {
        format!(
            r#"{{
  "metadata": {{
    "name": "{name}",
    "displayName": "{name} strategy",
    "events": ["trade"],
    "tag": "{tag}",
    "config": [{{"name": "marker", "type": "string", "default": "{marker}"}}]
  }}
}}"#
        )
    }

    fn open_store(dir: &Path) -> ModuleStore {
        ModuleStore::open(dir, Arc::new(JsonModuleCompiler)).unwrap()
    }

    #[test]
    fn test_store_and_resolve_by_every_selector_form() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let resolution = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        assert_eq!(resolution.name, "noop");
        assert_eq!(resolution.tag, "v1.0.0");

        // Bare name goes through latest (auto-promoted on first store).
        let by_name = store.resolve("noop").unwrap();
        assert_eq!(by_name.resolution.tag, LATEST_TAG);
        assert_eq!(by_name.resolution.selector, "noop");
        assert_eq!(by_name.resolution.hash, resolution.hash);

        let by_tag = store.resolve("noop:v1.0.0").unwrap();
        assert_eq!(by_tag.resolution.tag, "v1.0.0");
        assert_eq!(by_tag.resolution.selector, "noop:v1.0.0");

        let pinned = format!("noop@{}", resolution.hash);
        let by_hash = store.resolve(&pinned).unwrap();
        assert_eq!(by_hash.resolution.tag, "");
        assert_eq!(by_hash.resolution.selector, pinned);

        let bare = store.resolve(&resolution.hash).unwrap();
        assert_eq!(bare.resolution.name, "noop");
    }

    #[test]
    fn test_second_revision_moves_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let v1 = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let v2 = store
            .store(
                &module_source("noop", "v2.0.0", "b"),
                StoreOptions {
                    promote_latest: true,
                    ..StoreOptions::default()
                },
            )
            .unwrap();
        assert_ne!(v1.hash, v2.hash);

        let latest = store.resolve("noop").unwrap();
        assert_eq!(latest.resolution.hash, v2.hash);
        let old = store.resolve("noop:v1.0.0").unwrap();
        assert_eq!(old.resolution.hash, v1.hash);
    }

    #[test]
    fn test_same_content_reuses_revision() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let source = module_source("noop", "v1.0.0", "a");
        let first = store.store(&source, StoreOptions::default()).unwrap();
        let second = store
            .store(
                &source,
                StoreOptions {
                    tag: Some("prod".to_string()),
                    ..StoreOptions::default()
                },
            )
            .unwrap();
        assert_eq!(first.hash, second.hash);

        let listing = store.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].revisions.len(), 1);
        assert_eq!(listing[0].tag_aliases["prod"], first.hash);
    }

    #[test]
    fn test_assign_tag_reflects_in_listing_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let v1 = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let v2 = store
            .store(&module_source("noop", "v2.0.0", "b"), StoreOptions::default())
            .unwrap();

        let previous = store.assign_tag("noop", "prod", &v1.hash).unwrap();
        assert_eq!(previous, None);
        let previous = store.assign_tag("noop", "prod", &v2.hash).unwrap();
        assert_eq!(previous, Some(v1.hash.clone()));

        let listing = store.list();
        assert_eq!(listing[0].tag_aliases["prod"], v2.hash);
    }

    #[test]
    fn test_assign_tag_rejects_foreign_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let other = store
            .store(&module_source("delay", "v1.0.0", "b"), StoreOptions::default())
            .unwrap();

        assert!(matches!(
            store.assign_tag("noop", "prod", &other.hash),
            Err(EngineError::HashBelongsToDifferentName { .. })
        ));
    }

    #[test]
    fn test_delete_tag_guards() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let v1 = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();

        assert!(store.delete_tag("noop", LATEST_TAG, true).is_err());

        // v1.0.0 and latest both point at the revision, so dropping v1.0.0
        // leaves a reference and succeeds.
        let hash = store.delete_tag("noop", "v1.0.0", false).unwrap();
        assert_eq!(hash, v1.hash);

        // Re-assign and orphan-check: prod is now the only non-latest tag,
        // and latest also points at the hash, so no orphan occurs.
        store.assign_tag("noop", "prod", &v1.hash).unwrap();
        store.delete_tag("noop", "prod", false).unwrap();
    }

    #[test]
    fn test_delete_tag_orphan_guard_fires() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let v1 = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let _v2 = store
            .store(
                &module_source("noop", "v2.0.0", "b"),
                StoreOptions {
                    promote_latest: true,
                    ..StoreOptions::default()
                },
            )
            .unwrap();

        // latest moved to v2; v1.0.0 is now the sole reference to v1.
        let err = store.delete_tag("noop", "v1.0.0", false).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec { .. }));
        let hash = store.delete_tag("noop", "v1.0.0", true).unwrap();
        assert_eq!(hash, v1.hash);
    }

    #[test]
    fn test_delete_revision_drops_tags_and_keeps_latest_alive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let v1 = store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let v2 = store
            .store(&module_source("noop", "v2.0.0", "b"), StoreOptions::default())
            .unwrap();

        // latest still points at v1 (no promotion); delete v1's revision.
        let outcome = store.delete(&format!("noop@{}", v1.hash)).unwrap();
        match outcome {
            DeleteOutcome::Revision { hash, removed_tags, .. } => {
                assert_eq!(hash, v1.hash);
                assert!(removed_tags.contains(&"v1.0.0".to_string()));
                assert!(removed_tags.contains(&LATEST_TAG.to_string()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // latest re-pointed at the surviving revision.
        let latest = store.resolve("noop").unwrap();
        assert_eq!(latest.resolution.hash, v2.hash);
    }

    #[test]
    fn test_delete_whole_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();
        let outcome = store.delete("noop").unwrap();
        assert!(matches!(outcome, DeleteOutcome::Strategy { .. }));
        assert!(matches!(
            store.resolve("noop"),
            Err(EngineError::ModuleNotFound { .. })
        ));
        assert!(!dir.path().join("noop").exists());
    }

    #[test]
    fn test_refresh_picks_up_on_disk_changes_and_survives_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();

        // A second store process writes another strategy to the same root.
        let sibling = open_store(dir.path());
        sibling
            .store(&module_source("delay", "v1.0.0", "b"), StoreOptions::default())
            .unwrap();

        assert!(!store.contains_name("delay"));
        store.refresh().unwrap();
        assert!(store.contains_name("delay"));

        // Corrupt the manifest: refresh fails and the prior index stays.
        std::fs::write(dir.path().join(crate::manifest::MANIFEST_FILE), b"{oops").unwrap();
        assert!(store.refresh().is_err());
        assert!(store.contains_name("delay"));
        assert!(store.resolve("noop").is_ok());
    }

    #[test]
    fn test_crash_between_temp_write_and_rename_preserves_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();

        // Simulate a crash that left a temp file behind but never renamed.
        std::fs::write(dir.path().join(".registry.json.tmp-crash"), b"garbage").unwrap();

        let reopened = open_store(dir.path());
        assert!(reopened.resolve("noop").is_ok());
    }

    #[test]
    fn test_resolution_cache_serves_repeat_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .store(&module_source("noop", "v1.0.0", "a"), StoreOptions::default())
            .unwrap();

        let first = store.resolve("noop").unwrap();
        let second = store.resolve("noop").unwrap();
        assert_eq!(first.resolution, second.resolution);
        assert!(Arc::ptr_eq(&first.module, &second.module));
    }

    #[test]
    fn test_alias_reassignment_requires_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .store(
                &module_source("noop", "v1.0.0", "a"),
                StoreOptions {
                    aliases: vec!["prod".to_string()],
                    ..StoreOptions::default()
                },
            )
            .unwrap();
        let err = store
            .store(
                &module_source("noop", "v2.0.0", "b"),
                StoreOptions {
                    aliases: vec!["prod".to_string()],
                    ..StoreOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec { .. }));

        let v2 = store
            .store(
                &module_source("noop", "v2.0.0", "b"),
                StoreOptions {
                    aliases: vec!["prod".to_string()],
                    reassign_tags: true,
                    ..StoreOptions::default()
                },
            )
            .unwrap();
        let listing = store.list();
        assert_eq!(listing[0].tag_aliases["prod"], v2.hash);
    }
}

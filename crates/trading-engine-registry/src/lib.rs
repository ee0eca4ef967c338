//! # Trading Engine Registry
//!
//! Content-addressed storage for user strategy modules:
//! - Revisions keyed by the sha256 of their source, deduplicated on disk
//! - Mutable tag aliases (`latest`, `v1.0.0`, `prod`) over immutable
//!   revisions; `latest` is reserved and always present for a stored name
//! - A selector grammar (`name`, `name:tag`, `name@hash`, bare hash)
//!   resolving through a bounded LRU cache
//! - Staged compile/execute/validation diagnostics for rejected modules
//! - Atomic manifest persistence and hot-reload via [`ModuleStore::refresh`]
//!
//! Revision in-use guards live in the manager, which queries running
//! instances before delegating deletions here.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod compiler;
pub mod manifest;
pub mod metadata;
pub mod selector;
pub mod store;

pub use compiler::{CompiledModule, JsonModuleCompiler, ModuleCompiler};
pub use manifest::{Manifest, RegistryEntry, RevisionRecord, MANIFEST_FILE};
pub use metadata::{ConfigField, Metadata, DRY_RUN_FIELD};
pub use selector::{Resolution, Selector};
pub use store::{
    DeleteOutcome, ModuleListing, ModuleStore, ResolvedModule, RevisionSummary, StoreOptions,
    StoredModule, LATEST_TAG,
};

/// Current version of the registry crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

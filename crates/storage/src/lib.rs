//! Storage backends for bundle transport.
//!
//! Bundles live in a storage backend (a directory on disk, an in-memory map
//! for tests) and are addressed by relative paths derived from their bundle
//! keys. The loader reads bundles through a [`BackendHandle`] and may write
//! versioned copies into a second backend acting as a local cache.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::models::Progress;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;

//! Bundle loading with dependency resolution and reference counting.
//!
//! Bundles are fetched through a [`Transport`], cached with a reference count
//! per outstanding request, and their dependencies (from the installed
//! [`Manifest`]) fetched alongside them. Callers get a [`LoadRequest`] for
//! one typed asset and poll it, or [`wait`](LoadRequest::wait) on it while a
//! [`Driver`] ticks the [`Loader`].
//!
//! ```no_run
//! use haul_loader::{JsonExtractor, Loader, LoaderOptions, LoadStatus, Transport};
//! use haul_storage::backend::LocalBackend;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = Arc::new(LocalBackend::new("bundles", "/srv/bundles")?);
//! let mut loader = Loader::new(Transport::new(remote), Arc::new(JsonExtractor::new()), LoaderOptions::default())?;
//! let manifest = loader.download_manifest()?;
//! while !matches!(manifest.poll(), LoadStatus::Ready(_)) {
//!     loader.tick();
//!     tokio::task::yield_now().await;
//! }
//! let cube = loader.request_load::<Value>("cube0", "Cube")?;
//! # Ok(())
//! # }
//! ```

mod bundle;
mod driver;
pub mod error;
mod extract;
mod fetch;
mod loader;
mod manifest;
mod orchestrator;
mod request;
mod transport;
mod wait;

pub use crate::bundle::{Bundle, BundleKey, ContentVersion};
pub use crate::driver::{Driver, SharedLoader};
pub use crate::extract::{Asset, AssetObject, Extractor, ExtractorHandle, JsonExtractor};
pub use crate::fetch::CANCELLED;
pub use crate::loader::{Loader, LoaderOptions};
pub use crate::manifest::{Manifest, ManifestEntry};
pub use crate::orchestrator::{DownloadStatus, Orchestrator, Readiness};
pub use crate::request::{LoadRequest, LoadState, LoadStatus};
pub use crate::transport::Transport;
pub use crate::wait::{OnStall, Progressing, StallTimeout};

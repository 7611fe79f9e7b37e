use crate::extract::Asset;
use crate::{BundleKey, ContentVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dependency lists and content versions for every bundle of a build.
///
/// A manifest is shipped as an asset inside its own bundle and installed once
/// before anything else is fetched. It's read-only afterwards; installing
/// another one replaces it wholesale.
///
/// ```
/// use haul_loader::Manifest;
///
/// let manifest = Manifest::default()
///     .with_bundle("shared", "v1", [] as [&str; 0])
///     .with_bundle("cube1", "v3", ["shared"]);
/// assert_eq!(manifest.dependencies_of("cube1")[0], "shared");
/// assert_eq!(manifest.version_of("shared").map(|v| v.as_str()), Some("v1"));
/// assert!(manifest.dependencies_of("unknown").is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    bundles: BTreeMap<BundleKey, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub version: ContentVersion,
    /// Direct dependencies only; each dependency lists its own.
    #[serde(default)]
    pub dependencies: Vec<BundleKey>,
}

impl Manifest {
    pub fn with_bundle(
        mut self,
        key: impl Into<BundleKey>,
        version: impl Into<ContentVersion>,
        dependencies: impl IntoIterator<Item = impl Into<BundleKey>>,
    ) -> Self {
        let entry = ManifestEntry {
            version: version.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        };
        self.bundles.insert(key.into(), entry);
        self
    }

    /// Direct dependencies of `key`; empty for bundles without any and for
    /// bundles the manifest doesn't know about.
    pub fn dependencies_of(&self, key: &str) -> &[BundleKey] {
        self.bundles.get(key).map(|entry| entry.dependencies.as_slice()).unwrap_or_default()
    }

    pub fn version_of(&self, key: &str) -> Option<&ContentVersion> {
        self.bundles.get(key).map(|entry| &entry.version)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bundles.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl Asset for Manifest {
    const KIND: &'static str = "manifest";
}

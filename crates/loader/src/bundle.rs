//! Bundle identifiers and downloaded bundle contents.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Identifier of a bundle, unique within a build.
///
/// Keys double as storage paths; they are validated against path traversal
/// when a fetch is issued, not on construction.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleKey(String);

impl BundleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for BundleKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}
impl From<String> for BundleKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
impl Borrow<str> for BundleKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
impl PartialEq<str> for BundleKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}
impl PartialEq<&str> for BundleKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Opaque content hash/version token taken from the manifest.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentVersion(String);

impl ContentVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable file name for this version, used to key local copies.
    pub fn digest(&self) -> String {
        blake3::hash(self.0.as_bytes()).to_hex().to_string()
    }
}
impl From<&str> for ContentVersion {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

/// A downloaded bundle, shared between the cache and any extraction working
/// on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub key: BundleKey,
    pub version: Option<ContentVersion>,
    pub data: Vec<u8>,
}

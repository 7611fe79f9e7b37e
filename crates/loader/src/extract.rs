//! Typed asset extraction from downloaded bundles.
//!
//! Extraction is the in-process step that turns the raw bytes of a cached
//! [`Bundle`] into one named, typed object. It runs on a blocking worker so
//! that decoding a large bundle never holds up a tick.

use crate::Bundle;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// A type that can be extracted from a bundle.
///
/// `KIND` is the tag an asset carries inside its bundle; a request for `T`
/// only matches assets tagged `T::KIND`.
pub trait Asset: Any + Send + Sync {
    const KIND: &'static str;
}

/// Matches any kind, handing back the asset's raw data.
impl Asset for Value {
    const KIND: &'static str = "*";
}

/// Type-erased extraction result, downcast by the request that asked for it.
pub type AssetObject = Arc<dyn Any + Send + Sync>;

/// Pulls named assets out of bundles.
pub trait Extractor: Send + Sync {
    /// Extract `asset` of the given `kind` from `bundle`.
    ///
    /// Returns `None` when the bundle doesn't contain the asset or contains it
    /// as a different kind. That's an answer, not an error.
    fn extract(&self, bundle: &Bundle, asset: &str, kind: &'static str) -> Option<AssetObject>;
}

pub type ExtractorHandle = Arc<dyn Extractor>;

type Decoder = fn(Value) -> Option<AssetObject>;

/// Extractor for bundles laid out as JSON:
///
/// ```json
/// {"assets": {"Cube": {"kind": "mesh", "data": {"vertices": 8}}}}
/// ```
///
/// Each registered [`Asset`] type is decoded from `data` with serde. The
/// [`Manifest`](crate::Manifest) and [`serde_json::Value`] are registered out
/// of the box.
///
/// ```
/// use haul_loader::{Asset, Bundle, BundleKey, Extractor, JsonExtractor};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Mesh {
///     vertices: u32,
/// }
/// impl Asset for Mesh {
///     const KIND: &'static str = "mesh";
/// }
///
/// let mut extractor = JsonExtractor::new();
/// extractor.register::<Mesh>();
/// let bundle = Bundle {
///     key: BundleKey::new("cube0"),
///     version: None,
///     data: br#"{"assets": {"Cube": {"kind": "mesh", "data": {"vertices": 8}}}}"#.to_vec(),
/// };
/// let object = extractor.extract(&bundle, "Cube", Mesh::KIND).unwrap();
/// assert_eq!(object.downcast::<Mesh>().ok().unwrap().vertices, 8);
/// assert!(extractor.extract(&bundle, "Sphere", Mesh::KIND).is_none());
/// ```
pub struct JsonExtractor {
    decoders: HashMap<&'static str, Decoder>,
}

#[derive(Deserialize)]
struct Layout {
    #[serde(default)]
    assets: HashMap<String, Entry>,
}

#[derive(Deserialize)]
struct Entry {
    kind: String,
    #[serde(default)]
    data: Value,
}

impl JsonExtractor {
    pub fn new() -> Self {
        let mut extractor = Self { decoders: HashMap::new() };
        extractor.register::<crate::Manifest>();
        extractor.register::<Value>();
        extractor
    }

    /// Teach the extractor to decode `T`. Registering a kind twice replaces
    /// the earlier decoder.
    pub fn register<T: Asset + DeserializeOwned>(&mut self) -> &mut Self {
        self.decoders.insert(T::KIND, decode::<T>);
        self
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }
}
impl Default for JsonExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: Asset + DeserializeOwned>(data: Value) -> Option<AssetObject> {
    match serde_json::from_value::<T>(data) {
        Ok(asset) => Some(Arc::new(asset) as AssetObject),
        Err(e) => {
            tracing::debug!(kind = T::KIND, error = %e, "Asset data does not decode as the requested type");
            None
        },
    }
}

impl Extractor for JsonExtractor {
    #[instrument(level = "trace", skip(self, bundle), fields(bundle = %bundle.key))]
    fn extract(&self, bundle: &Bundle, asset: &str, kind: &'static str) -> Option<AssetObject> {
        let mut layout: Layout = match serde_json::from_slice(&bundle.data) {
            Ok(layout) => layout,
            Err(e) => {
                tracing::debug!(error = %e, "Bundle is not laid out as JSON assets");
                return None;
            },
        };
        let entry = layout.assets.remove(asset)?;
        if kind != Value::KIND && entry.kind != kind {
            tracing::debug!(found = %entry.kind, "Asset exists under a different kind");
            return None;
        }
        let Some(decoder) = self.decoders.get(kind) else {
            tracing::debug!("No decoder registered for kind");
            return None;
        };
        decoder(entry.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BundleKey, Manifest};
    use rstest::rstest;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Mesh {
        vertices: u32,
    }
    impl Asset for Mesh {
        const KIND: &'static str = "mesh";
    }

    const CUBE: &[u8] = br#"{"assets": {
        "Cube": {"kind": "mesh", "data": {"vertices": 8}},
        "Broken": {"kind": "mesh", "data": {"faces": 6}},
        "Label": {"kind": "text", "data": "hello"}
    }}"#;

    fn bundle(data: &[u8]) -> Bundle {
        Bundle { key: BundleKey::new("cube0"), version: None, data: data.to_vec() }
    }

    fn extractor() -> JsonExtractor {
        let mut extractor = JsonExtractor::new();
        extractor.register::<Mesh>();
        extractor
    }

    #[test]
    fn test_extract_typed() {
        let object = extractor().extract(&bundle(CUBE), "Cube", Mesh::KIND).unwrap();
        assert_eq!(*object.downcast::<Mesh>().ok().unwrap(), Mesh { vertices: 8 });
    }

    #[rstest]
    #[case::missing_asset("Sphere")]
    #[case::wrong_kind("Label")]
    #[case::undecodable("Broken")]
    fn test_extract_none(#[case] asset: &str) {
        assert!(extractor().extract(&bundle(CUBE), asset, Mesh::KIND).is_none());
    }

    #[test]
    fn test_not_json() {
        assert!(extractor().extract(&bundle(b"\x00\x01binary"), "Cube", Mesh::KIND).is_none());
    }

    #[test]
    fn test_unregistered_kind() {
        let extractor = JsonExtractor::new();
        assert!(!extractor.knows(Mesh::KIND));
        assert!(extractor.extract(&bundle(CUBE), "Cube", Mesh::KIND).is_none());
    }

    #[test]
    fn test_wildcard_returns_raw_data() {
        let object = extractor().extract(&bundle(CUBE), "Label", Value::KIND).unwrap();
        assert_eq!(*object.downcast::<Value>().ok().unwrap(), Value::from("hello"));
    }

    #[test]
    fn test_manifest_registered() {
        let data = br#"{"assets": {"manifest": {"kind": "manifest", "data": {"bundles": {"cube0": {"version": "a1"}}}}}}"#;
        let object = JsonExtractor::new().extract(&bundle(data), "manifest", Manifest::KIND).unwrap();
        let manifest = object.downcast::<Manifest>().ok().unwrap();
        assert!(manifest.contains("cube0"));
    }
}

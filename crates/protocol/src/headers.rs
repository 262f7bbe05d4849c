//! Header maps with a pluggable key-case policy.
//!
//! Callers build request headers in one of two modes: exact-case (keys are
//! compared byte-for-byte) or ASCII case-insensitive (the HTTP convention,
//! and the mode response headers always use). The mode is a type parameter
//! rather than a runtime flag so the two map kinds cannot be mixed up.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key canonicalization policy for a [`HeaderMap`].
pub trait CasePolicy: Send + Sync + 'static {
    /// Maps a key to its canonical stored form.
    fn canonical(key: &str) -> Cow<'_, str>;
}

/// Exact-case keys: stored and compared verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseSensitive;

impl CasePolicy for CaseSensitive {
    fn canonical(key: &str) -> Cow<'_, str> {
        Cow::Borrowed(key)
    }
}

/// ASCII case-insensitive keys: canonicalized to lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseInsensitive;

impl CasePolicy for CaseInsensitive {
    fn canonical(key: &str) -> Cow<'_, str> {
        if key.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(key.to_ascii_lowercase())
        } else {
            Cow::Borrowed(key)
        }
    }
}

/// String-to-string header mapping with unique keys.
///
/// Keys are canonicalized on insertion and lookup according to the case
/// policy `C`. Serializes as a plain JSON object.
pub struct HeaderMap<C: CasePolicy = CaseInsensitive> {
    entries: BTreeMap<String, String>,
    _case: PhantomData<C>,
}

// Manual impls: derives would demand the same traits of `C`, which is a
// marker type that never needs them.
impl<C: CasePolicy> Clone for HeaderMap<C> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            _case: PhantomData,
        }
    }
}

impl<C: CasePolicy> PartialEq for HeaderMap<C> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<C: CasePolicy> Eq for HeaderMap<C> {}

impl<C: CasePolicy> HeaderMap<C> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            _case: PhantomData,
        }
    }

    /// Inserts a header, returning the previous value for that key if any.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.entries
            .insert(C::canonical(key).into_owned(), value.into())
    }

    /// Looks up a header value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(C::canonical(key).as_ref())
            .map(String::as_str)
    }

    /// Returns true if a header with this key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(C::canonical(key).as_ref())
    }

    /// Iterates over `(key, value)` pairs in canonical key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C: CasePolicy> Default for HeaderMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CasePolicy> fmt::Debug for HeaderMap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<'a, C: CasePolicy> FromIterator<(&'a str, &'a str)> for HeaderMap<C> {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<C: CasePolicy> Serialize for HeaderMap<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, C: CasePolicy> Deserialize<'de> for HeaderMap<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor<C>(PhantomData<C>);

        impl<'de, C: CasePolicy> Visitor<'de> for MapVisitor<C> {
            type Value = HeaderMap<C>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = HeaderMap::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    map.insert(&key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

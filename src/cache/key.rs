//! Cache key derivation.

use std::fmt;

use crate::Request;

/// Default namespace prepended to every key.
pub const DEFAULT_NAMESPACE: &str = "__rttp__";

/// Lookup key for one logical request.
///
/// Built fresh for every request and never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Derives a [`CacheKey`] from a request's path and raw query string.
///
/// The method does not take part: the key is `<namespace><path>` when the
/// query is absent or empty and `<namespace><path>?<query>` otherwise. Nothing
/// is decoded or reordered, so `/p?a=%41` and `/p?a=A` are different keys, as
/// are `?a=1&b=2` and `?b=2&a=1`.
///
/// # Examples
///
/// ```
/// use cachegate::cache::KeyDeriver;
///
/// let keys = KeyDeriver::default();
/// assert_eq!(keys.derive_parts("/products", None).as_str(), "__rttp__/products");
/// assert_eq!(keys.derive_parts("/products", Some("")).as_str(), "__rttp__/products");
/// assert_eq!(
///     keys.derive_parts("/products", Some("page=2")).as_str(),
///     "__rttp__/products?page=2"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    namespace: String,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeyDeriver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn derive(&self, request: &Request) -> CacheKey {
        self.derive_parts(request.path(), request.raw_query())
    }

    pub fn derive_parts(&self, path: &str, query: Option<&str>) -> CacheKey {
        let query = query.filter(|q| !q.is_empty());
        let mut key = String::with_capacity(
            self.namespace.len() + path.len() + query.map_or(0, |q| q.len() + 1),
        );
        key.push_str(&self.namespace);
        key.push_str(path);
        if let Some(query) = query {
            key.push('?');
            key.push_str(query);
        }
        CacheKey(key)
    }
}

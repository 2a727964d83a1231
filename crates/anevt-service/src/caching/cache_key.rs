use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fixed tag mixed into every derived key, so that anevt keys can never
/// collide with other users of a shared store.
const UNIQUIFIER: &str = "anevt.memoize";

/// Type descriptor of a live data-store connection handle.
pub const DATASTORE_HANDLE: &str = "handle.datastore";

/// Type descriptor of a filesystem handle.
pub const FILESYSTEM_HANDLE: &str = "handle.filesystem";

/// The identity of a logical computation: its declaring module and its
/// local name.
///
/// Used only to namespace cache keys; two same-named queries in different
/// modules must not collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIdentity {
    /// The analytics module declaring the query.
    pub module: String,
    /// The query's local name within its module.
    pub name: String,
}

impl QueryIdentity {
    /// Creates an identity from a module and a local name.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// A tagged invocation argument.
///
/// The `type_name` is the runtime type descriptor the ignore predicate
/// matches against; the `value` is the canonical JSON representation that
/// contributes to the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryArg {
    type_name: Cow<'static, str>,
    value: Value,
}

impl QueryArg {
    /// Creates an argument, deriving the type descriptor from the value.
    pub fn new(value: Value) -> Self {
        Self {
            type_name: Cow::Borrowed(json_type_name(&value)),
            value,
        }
    }

    /// Creates a per-call infrastructure handle argument.
    ///
    /// Handles carry no value of their own; they exist so that the ignore
    /// predicate can filter them out of key derivation.
    pub fn handle(type_name: &'static str) -> Self {
        Self {
            type_name: Cow::Borrowed(type_name),
            value: Value::Null,
        }
    }

    /// The runtime type descriptor of this argument.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The argument value.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl From<Value> for QueryArg {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for QueryArg {
    fn from(value: &str) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<String> for QueryArg {
    fn from(value: String) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<i64> for QueryArg {
    fn from(value: i64) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<bool> for QueryArg {
    fn from(value: bool) -> Self {
        Self::new(Value::from(value))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// The positional and keyword arguments of a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryArgs {
    /// Positional arguments, in call order.
    pub positional: Vec<QueryArg>,
    /// Keyword arguments. A `BTreeMap` keeps serialization order stable.
    pub keyword: BTreeMap<String, QueryArg>,
}

impl QueryArgs {
    /// Creates an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn with_arg(mut self, arg: impl Into<QueryArg>) -> Self {
        self.positional.push(arg.into());
        self
    }

    /// Inserts a keyword argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, arg: impl Into<QueryArg>) -> Self {
        self.keyword.insert(name.into(), arg.into());
        self
    }
}

/// The set of type descriptors excluded from key derivation.
///
/// Arguments of these types are per-call infrastructure handles whose
/// identity varies but whose presence does not change the query's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreSet(BTreeSet<String>);

impl Default for IgnoreSet {
    fn default() -> Self {
        [DATASTORE_HANDLE, FILESYSTEM_HANDLE]
            .into_iter()
            .collect()
    }
}

impl IgnoreSet {
    /// An ignore set that filters nothing.
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Whether the given type descriptor is ignored.
    pub fn contains(&self, type_name: &str) -> bool {
        self.0.contains(type_name)
    }

    /// Adds a type descriptor to the set.
    pub fn insert(&mut self, type_name: impl Into<String>) {
        self.0.insert(type_name.into());
    }
}

impl<S: Into<String>> FromIterator<S> for IgnoreSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A deterministic identifier for a query invocation.
///
/// Derived from the query identity and the invocation's ignore-filtered
/// arguments, or replaced wholesale by an override key. The human-readable
/// metadata the key was derived from is retained for diagnostics.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    key: Arc<str>,
    metadata: Arc<str>,
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl CacheKey {
    /// Derives the key for one invocation.
    ///
    /// Positional and keyword arguments whose type descriptor is in
    /// `ignores` are excluded. (The keyword side differs from older
    /// deployments, which only filtered positional arguments; filtering
    /// both keeps per-call handles out of the key uniformly.)
    ///
    /// Identical inputs always produce the identical key: the metadata text
    /// is built in a fixed order and keyword arguments are sorted by name.
    /// When `key_override` is given it becomes the key verbatim, which lets
    /// callers share one cache line across argument variations known to be
    /// semantically equivalent.
    pub fn for_invocation(
        identity: &QueryIdentity,
        args: &QueryArgs,
        ignores: &IgnoreSet,
        key_override: Option<&str>,
    ) -> Self {
        let mut builder = CacheKeyBuilder::new(identity);
        for arg in &args.positional {
            if !ignores.contains(arg.type_name()) {
                builder.write_arg(arg).unwrap();
            }
        }
        for (name, arg) in &args.keyword {
            if !ignores.contains(arg.type_name()) {
                builder.write_kwarg(name, arg).unwrap();
            }
        }
        match key_override {
            Some(key) => builder.build_with_override(key),
            None => builder.build(),
        }
    }

    /// The key string: a sha-256 hex digest, or the override verbatim.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the human-readable metadata that forms the basis of the key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the key as a single safe path segment, for file-backed stores.
    pub fn path_segment(&self) -> String {
        safe_path_segment(&self.key)
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        let key: Arc<str> = key.into().into();
        CacheKey {
            metadata: key.clone(),
            key,
        }
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the
/// intention of it is to accept human readable, but most importantly
/// **stable**, input. This input is then being hashed to form the
/// [`CacheKey`], and is kept alongside the key to help debugging.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Starts a builder for the given query identity.
    pub fn new(identity: &QueryIdentity) -> Self {
        let metadata = format!(
            "uniquifier: {UNIQUIFIER}\nmodule: {}\nname: {}\n",
            identity.module, identity.name
        );
        Self { metadata }
    }

    /// Writes a positional argument into the key metadata.
    pub fn write_arg(&mut self, arg: &QueryArg) -> fmt::Result {
        self.metadata
            .write_fmt(format_args!("arg: {} {}\n", arg.type_name(), arg.value()))
    }

    /// Writes a keyword argument into the key metadata.
    pub fn write_kwarg(&mut self, name: &str, arg: &QueryArg) -> fmt::Result {
        self.metadata.write_fmt(format_args!(
            "kwarg: {name} = {} {}\n",
            arg.type_name(),
            arg.value()
        ))
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);
        let mut key = String::with_capacity(64);
        for b in hash {
            key.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        CacheKey {
            key: key.into(),
            metadata: self.metadata.into(),
        }
    }

    /// Finalize with an explicit override key, keeping the metadata for
    /// diagnostics.
    pub fn build_with_override(self, key: &str) -> CacheKey {
        CacheKey {
            key: key.into(),
            metadata: self.metadata.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn identity() -> QueryIdentity {
        QueryIdentity::new("video", "daily_uploads")
    }

    #[test]
    fn test_derived_key_is_stable() {
        let args = QueryArgs::new()
            .with_arg(2)
            .with_arg(3)
            .with_kwarg("resolution", "day");

        let key = CacheKey::for_invocation(&identity(), &args, &IgnoreSet::empty(), None);
        assert_eq!(
            key.metadata(),
            "uniquifier: anevt.memoize\n\
             module: video\n\
             name: daily_uploads\n\
             arg: int 2\n\
             arg: int 3\n\
             kwarg: resolution = str \"day\"\n"
        );
        assert_eq!(
            key.as_str(),
            "72011d0e99c79ec8cc15c769938f62c8c1eb533e17e887c96e65e6d3e9aa9577"
        );

        // Re-deriving from equal inputs yields the identical key.
        let again = CacheKey::for_invocation(&identity(), &args, &IgnoreSet::empty(), None);
        assert_eq!(key, again);
    }

    #[test]
    fn test_ignored_handles_do_not_change_the_key() {
        let ignores = IgnoreSet::default();

        let plain = QueryArgs::new().with_arg(7);
        let with_handle = QueryArgs::new()
            .with_arg(QueryArg::handle(DATASTORE_HANDLE))
            .with_arg(7)
            .with_kwarg("fs", QueryArg::handle(FILESYSTEM_HANDLE));

        let a = CacheKey::for_invocation(&identity(), &plain, &ignores, None);
        let b = CacheKey::for_invocation(&identity(), &with_handle, &ignores, None);
        assert_eq!(a, b);

        // A non-ignored argument of a different type is capable of changing
        // the key.
        let differs = QueryArgs::new().with_arg("7");
        let c = CacheKey::for_invocation(&identity(), &differs, &ignores, None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_namespaces_keys() {
        let args = QueryArgs::new().with_arg(1);
        let a = CacheKey::for_invocation(&identity(), &args, &IgnoreSet::empty(), None);
        let b = CacheKey::for_invocation(
            &QueryIdentity::new("audio", "daily_uploads"),
            &args,
            &IgnoreSet::empty(),
            None,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_override_key_is_used_verbatim() {
        let args = QueryArgs::new().with_arg(json!([1, 2, 3]));
        let key =
            CacheKey::for_invocation(&identity(), &args, &IgnoreSet::empty(), Some("shared-line"));
        assert_eq!(key.as_str(), "shared-line");
        // Metadata is still recorded for diagnostics.
        assert!(key.metadata().contains("daily_uploads"));
    }

    #[test]
    fn test_path_segment_is_safe() {
        let key = CacheKey::for_testing("weekly:stats/v2");
        assert_eq!(key.path_segment(), "weekly_stats_v2");
    }
}

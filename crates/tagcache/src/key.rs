// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stable cache keys derived from an endpoint and its arguments.

use std::{fmt, sync::Arc};

use serde_core::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Normalized query arguments: a JSON object without `null` members.
pub type Args = serde_json::Map<String, Value>;

/// Identifies one (endpoint, arguments) pair in the cache.
///
/// Rendered as `endpoint(canonical-json)`, for example `jobs({"limit":10,"search":"front"})`.
/// Object members are sorted recursively, so two argument objects holding the same members in a
/// different order produce the same key. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Builds the key for already normalized arguments.
    #[must_use]
    pub fn from_args(endpoint: &str, args: &Args) -> Self {
        let mut rendered = String::with_capacity(endpoint.len() + 2);
        rendered.push_str(endpoint);
        rendered.push('(');
        write_object(args, &mut rendered);
        rendered.push(')');
        Self(Arc::from(rendered))
    }

    /// Returns the rendered key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the endpoint portion of the key.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.0.split_once('(').map_or(&self.0, |(endpoint, _)| endpoint)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Computes the cache key for `endpoint` called with `args`.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if `args` does not serialize to a JSON object (or to
/// nothing at all), or if its `Serialize` implementation fails.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let a = tagcache::serialize("jobs", &json!({"search": "front", "limit": 10}))?;
/// let b = tagcache::serialize("jobs", &json!({"limit": 10, "search": "front"}))?;
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), r#"jobs({"limit":10,"search":"front"})"#);
/// # Ok::<(), tagcache::Error>(())
/// ```
pub fn serialize<A>(endpoint: &str, args: &A) -> Result<CacheKey>
where
    A: Serialize + ?Sized,
{
    normalize_args(endpoint, args).map(|args| CacheKey::from_args(endpoint, &args))
}

/// Converts serializable arguments into a normalized argument object.
///
/// `None`/unit become the empty object and object members whose value is `null` are dropped
/// at every depth. `null` elements of arrays are kept.
pub(crate) fn normalize_args<A>(endpoint: &str, args: &A) -> Result<Args>
where
    A: Serialize + ?Sized,
{
    match serde_json::to_value(args).map_err(|e| Error::serialization(endpoint, e))? {
        Value::Null => Ok(Args::new()),
        Value::Object(map) => Ok(prune_object(map)),
        other => Err(Error::serialization(
            endpoint,
            format_args!("arguments must be an object, got {}", kind_of(&other)),
        )),
    }
}

fn prune_object(map: Args) -> Args {
    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name, prune(value)))
        .collect()
}

fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(prune_object(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(prune).collect()),
        leaf => leaf,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn write_object(map: &Args, out: &mut String) {
    let mut members: Vec<_> = map.iter().collect();
    members.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

    out.push('{');
    for (i, (name, value)) in members.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_leaf(&Value::String(name.clone()), out);
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        leaf => write_leaf(leaf, out),
    }
}

fn write_leaf(leaf: &Value, out: &mut String) {
    // Display for a leaf value is its compact JSON form, escapes included.
    out.push_str(&leaf.to_string());
}

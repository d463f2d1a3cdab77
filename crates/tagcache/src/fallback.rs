// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deterministic placeholder data for endpoints whose primary fetch failed.
//!
//! A [`FallbackRegistry`] maps endpoint names to [`Generator`]s. Generators are pure: the same
//! arguments always yield the same value, with no randomness and no clock reads, so a screen
//! rendered from fallback data is stable across refetches.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;

use crate::Args;

/// Produces placeholder data for one endpoint.
///
/// Implementations must honor the filtering and pagination implied by `args`.
pub trait Generator: Send + Sync + 'static {
    /// Returns the synthesized response for `args`.
    fn generate(&self, args: &Args) -> Value;
}

impl<F> Generator for F
where
    F: Fn(&Args) -> Value + Send + Sync + 'static,
{
    fn generate(&self, args: &Args) -> Value {
        self(args)
    }
}

/// Outcome of [`FallbackRegistry::synthesize`].
#[derive(Clone, Debug, PartialEq)]
pub enum Fallback {
    /// Synthesized data, shaped like a successful response.
    Data(Value),
    /// No generator is registered for the endpoint.
    UnknownEndpoint,
}

impl Fallback {
    /// Returns the synthesized value; an unknown endpoint yields an empty collection.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Data(value) => value,
            Self::UnknownEndpoint => Value::Array(Vec::new()),
        }
    }

    /// Returns `true` if no generator was registered for the endpoint.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::UnknownEndpoint)
    }
}

/// Per-endpoint fallback generators, supplied when the client is built.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{Fallback, FallbackRegistry, ListFallback};
///
/// let registry = FallbackRegistry::new()
///     .register("jobs", ListFallback::new([json!({"title": "Frontend Engineer"})]).search_fields(["title"]))
///     .register("health", |_args: &tagcache::Args| json!({"ok": false}));
///
/// let args = serde_json::from_value(json!({"search": "front"}))?;
/// assert_eq!(registry.synthesize("jobs", &args), Fallback::Data(json!([{"title": "Frontend Engineer"}])));
/// assert!(registry.synthesize("reports", &args).is_unknown());
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct FallbackRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl FallbackRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the generator for `endpoint`, replacing any previous one.
    #[must_use]
    pub fn register(mut self, endpoint: impl Into<String>, generator: impl Generator) -> Self {
        self.insert(endpoint, generator);
        self
    }

    /// Adds the generator for `endpoint` in place, replacing any previous one.
    pub fn insert(&mut self, endpoint: impl Into<String>, generator: impl Generator) {
        self.generators.insert(endpoint.into(), Arc::new(generator));
    }

    /// Returns `true` if a generator is registered for `endpoint`.
    #[must_use]
    pub fn contains(&self, endpoint: &str) -> bool {
        self.generators.contains_key(endpoint)
    }

    /// Returns the number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.generators.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Synthesizes data for `endpoint` called with `args`.
    #[must_use]
    pub fn synthesize(&self, endpoint: &str, args: &Args) -> Fallback {
        self.generators
            .get(endpoint)
            .map_or(Fallback::UnknownEndpoint, |generator| Fallback::Data(generator.generate(args)))
    }
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut endpoints: Vec<_> = self.generators.keys().collect();
        endpoints.sort_unstable();
        f.debug_struct("FallbackRegistry").field("endpoints", &endpoints).finish()
    }
}

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_SEARCH_FIELDS: [&str; 2] = ["name", "title"];

/// A fixed record list that answers list queries.
///
/// Honors three argument conventions:
///
/// - `search`: case-insensitive substring match against the configured search fields
///   (`name` and `title` unless configured otherwise).
/// - filters: every configured filter argument that is present must equal the record field of
///   the same name.
/// - `page` and `limit`: `limit` alone takes the first `limit` records, `page` is 1-based and
///   falls back to the default page size when `limit` is absent.
#[derive(Clone, Debug)]
pub struct ListFallback {
    records: Vec<Value>,
    search_fields: Vec<String>,
    filters: Vec<String>,
    page_size: usize,
}

impl ListFallback {
    /// Creates a generator serving `records` in order.
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Value>) -> Self {
        Self {
            records: records.into_iter().collect(),
            search_fields: DEFAULT_SEARCH_FIELDS.iter().map(ToString::to_string).collect(),
            filters: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the record fields matched by the `search` argument.
    #[must_use]
    pub fn search_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an argument that must exactly equal the record field of the same name.
    #[must_use]
    pub fn filter_by(mut self, field: impl Into<String>) -> Self {
        self.filters.push(field.into());
        self
    }

    /// Sets the page size used when `page` is given without `limit`.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn matches_search(&self, record: &Value, needle: &str) -> bool {
        self.search_fields.iter().any(|field| {
            record
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|text| text.to_lowercase().contains(needle))
        })
    }

    fn matches_filters(&self, record: &Value, args: &Args) -> bool {
        self.filters.iter().all(|field| match args.get(field) {
            None | Some(Value::Null) => true,
            Some(expected) => record.get(field).is_some_and(|actual| loosely_equal(actual, expected)),
        })
    }
}

impl Generator for ListFallback {
    fn generate(&self, args: &Args) -> Value {
        let needle = args
            .get("search")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let matching = self
            .records
            .iter()
            .filter(|record| needle.as_deref().is_none_or(|needle| self.matches_search(record, needle)))
            .filter(|record| self.matches_filters(record, args));

        let limit = positive(args.get("limit"));
        let page = positive(args.get("page"));
        let selected: Vec<Value> = match (page, limit) {
            (None, None) => matching.cloned().collect(),
            (None, Some(limit)) => matching.take(limit).cloned().collect(),
            (Some(page), limit) => {
                let size = limit.unwrap_or(self.page_size);
                matching.skip((page - 1).saturating_mul(size)).take(size).cloned().collect()
            }
        };

        Value::Array(selected)
    }
}

/// A fixed record list that answers single-record lookups.
///
/// The record whose id field equals the id argument is returned; a missing record yields
/// `null`, a well-formed "not found".
#[derive(Clone, Debug)]
pub struct RecordFallback {
    records: Vec<Value>,
    id_field: String,
    id_arg: String,
}

impl RecordFallback {
    /// Creates a generator looking records up by their `id` field.
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Value>) -> Self {
        Self {
            records: records.into_iter().collect(),
            id_field: "id".to_string(),
            id_arg: "id".to_string(),
        }
    }

    /// Sets the record field holding the id.
    #[must_use]
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Sets the argument carrying the requested id.
    #[must_use]
    pub fn id_arg(mut self, arg: impl Into<String>) -> Self {
        self.id_arg = arg.into();
        self
    }
}

impl Generator for RecordFallback {
    fn generate(&self, args: &Args) -> Value {
        let Some(wanted) = args.get(&self.id_arg) else {
            return Value::Null;
        };

        self.records
            .iter()
            .find(|record| record.get(&self.id_field).is_some_and(|id| loosely_equal(id, wanted)))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Compares two JSON values, treating a number and its decimal string form as equal.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => n.to_string() == *s,
        _ => actual == expected,
    }
}

fn positive(value: Option<&Value>) -> Option<usize> {
    let n = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    usize::try_from(n).ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => map,
            _ => Args::new(),
        }
    }

    fn jobs() -> ListFallback {
        ListFallback::new([
            json!({"id": "1", "title": "Frontend Engineer", "company": "Acme", "status": "open"}),
            json!({"id": "2", "title": "Backend Engineer", "company": "Frontier Labs", "status": "closed"}),
            json!({"id": "3", "title": "Product Designer", "company": "Globex", "status": "open"}),
        ])
        .search_fields(["title", "company"])
        .filter_by("status")
    }

    fn ids(value: &Value) -> Vec<&str> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|item| item["id"].as_str()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let data = jobs().generate(&args(json!({"search": "FRONT"})));
        assert_eq!(ids(&data), vec!["1", "2"]);
    }

    #[test]
    fn blank_search_returns_everything() {
        let data = jobs().generate(&args(json!({"search": "  "})));
        assert_eq!(ids(&data), vec!["1", "2", "3"]);
    }

    #[test]
    fn filters_require_exact_match() {
        let data = jobs().generate(&args(json!({"status": "open"})));
        assert_eq!(ids(&data), vec!["1", "3"]);

        let data = jobs().generate(&args(json!({"status": "open", "search": "front"})));
        assert_eq!(ids(&data), vec!["1"]);
    }

    #[test]
    fn unconfigured_arguments_are_ignored() {
        let data = jobs().generate(&args(json!({"company": "Globex"})));
        assert_eq!(ids(&data), vec!["1", "2", "3"]);
    }

    #[test]
    fn limit_alone_takes_first_items() {
        let data = jobs().generate(&args(json!({"limit": 2})));
        assert_eq!(ids(&data), vec!["1", "2"]);
    }

    #[test]
    fn page_and_limit_slice() {
        let data = jobs().generate(&args(json!({"page": 2, "limit": 2})));
        assert_eq!(ids(&data), vec!["3"]);

        let data = jobs().generate(&args(json!({"page": 3, "limit": 2})));
        assert_eq!(data, json!([]));
    }

    #[test]
    fn page_without_limit_uses_page_size() {
        let list = jobs().page_size(1);
        assert_eq!(ids(&list.generate(&args(json!({"page": 2})))), vec!["2"]);
        assert_eq!(ids(&list.generate(&args(json!({"page": "3"})))), vec!["3"]);
    }

    #[test]
    fn invalid_pagination_is_ignored() {
        let data = jobs().generate(&args(json!({"page": 0, "limit": -1})));
        assert_eq!(ids(&data), vec!["1", "2", "3"]);
    }

    #[test]
    fn generation_is_deterministic() {
        let list = jobs();
        let request = args(json!({"search": "engineer", "limit": 5}));
        assert_eq!(list.generate(&request), list.generate(&request));
    }

    #[test]
    fn record_lookup_by_id() {
        let users = RecordFallback::new([json!({"id": 1, "name": "Ana"}), json!({"id": 2, "name": "Bo"})]);
        assert_eq!(users.generate(&args(json!({"id": 2}))), json!({"id": 2, "name": "Bo"}));
        assert_eq!(users.generate(&args(json!({"id": "1"}))), json!({"id": 1, "name": "Ana"}));
        assert_eq!(users.generate(&args(json!({"id": 9}))), Value::Null);
        assert_eq!(users.generate(&Args::new()), Value::Null);
    }

    #[test]
    fn record_lookup_with_custom_fields() {
        let profiles = RecordFallback::new([json!({"userId": "u1", "bio": "Designer"})])
            .id_field("userId")
            .id_arg("user");
        assert_eq!(profiles.generate(&args(json!({"user": "u1"})))["bio"], json!("Designer"));
    }

    #[test]
    fn registry_dispatches_by_endpoint() {
        let registry = FallbackRegistry::new()
            .register("jobs", jobs())
            .register("jobs.count", |_: &Args| json!(3));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("jobs"));
        assert_eq!(registry.synthesize("jobs.count", &Args::new()), Fallback::Data(json!(3)));
        assert_eq!(ids(&registry.synthesize("jobs", &Args::new()).into_value()), vec!["1", "2", "3"]);
    }

    #[test]
    fn unknown_endpoint_yields_empty_collection() {
        let registry = FallbackRegistry::new();
        let fallback = registry.synthesize("reports", &Args::new());
        assert!(fallback.is_unknown());
        assert_eq!(fallback.into_value(), json!([]));
        assert!(registry.is_empty());
    }

    #[test]
    fn registering_twice_replaces_generator() {
        let mut registry = FallbackRegistry::new().register("jobs", |_: &Args| json!("first"));
        registry.insert("jobs", |_: &Args| json!("second"));
        assert_eq!(registry.synthesize("jobs", &Args::new()), Fallback::Data(json!("second")));
        assert_eq!(format!("{registry:?}"), r#"FallbackRegistry { endpoints: ["jobs"] }"#);
    }
}

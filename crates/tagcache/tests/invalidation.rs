// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tag invalidation, background refetch and mutations.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde_json::{Value, json};
use tagcache::{DataSource, Error, Provides, Query, QueryClient, QueryStatus, Tag, testing::ScriptedFetcher};

fn client(fetcher: &ScriptedFetcher) -> QueryClient<ScriptedFetcher> {
    QueryClient::builder(fetcher.clone()).name("invalidation_tests").build()
}

/// Yields until `done` holds, failing the test if it never does.
async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Answers with an increasing version number per call.
fn versioned(fetcher: &ScriptedFetcher, endpoint: &str) {
    let version = Arc::new(AtomicU64::new(0));
    fetcher.respond_with(endpoint, move |_args| Ok(json!({"version": version.fetch_add(1, Ordering::AcqRel) + 1})));
}

fn job(id: &str) -> Query {
    Query::with_args("job", &json!({"id": id})).unwrap().provides(Tag::with_id("Job", id))
}

fn job_list() -> Query {
    Query::new("jobs").provides(Provides::from_fn(|data: &Value, _args| {
        let mut tags = vec![Tag::with_id("Job", "LIST")];
        if let Some(jobs) = data.as_array() {
            tags.extend(jobs.iter().filter_map(|job| job["id"].as_str()).map(|id| Tag::with_id("Job", id)));
        }
        tags
    }))
}

#[tokio::test]
async fn exact_and_wildcard_invalidation() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("job", json!({}));
    fetcher.respond("users", json!([]));
    let client = client(&fetcher);

    let one = client.execute_query(&job("1")).await.unwrap().key;
    let two = client.execute_query(&job("2")).await.unwrap().key;
    let users = client.execute("users", &(), Tag::new("User")).await.unwrap().key;

    assert_eq!(client.invalidate(&[Tag::with_id("Job", "1")]), vec![one.clone()]);
    assert!(client.entry(&one).unwrap().is_stale());
    assert!(client.entry(&two).unwrap().is_fresh());

    assert_eq!(client.invalidate(&[Tag::new("Job")]), vec![one.clone(), two.clone()]);
    assert!(client.entry(&two).unwrap().is_stale());
    assert!(client.entry(&users).unwrap().is_fresh());

    assert!(client.invalidate(&[Tag::with_id("Job", "3")]).is_empty());
    assert!(client.invalidate(&[]).is_empty());
}

#[tokio::test]
async fn computed_tags_link_lists_to_records() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("jobs", json!([{"id": "1"}, {"id": "2"}]));
    let client = client(&fetcher);

    let list = client.execute_query(&job_list()).await.unwrap().key;
    assert_eq!(client.entry(&list).unwrap().tags().len(), 3);
    assert_eq!(client.entries_by_tag(&Tag::with_id("Job", "2")).len(), 1);

    assert_eq!(client.invalidate(&[Tag::with_id("Job", "2")]), vec![list.clone()]);
    assert!(client.entry(&list).unwrap().is_stale());
}

#[tokio::test]
async fn stale_entries_keep_data_until_reloaded() {
    let fetcher = ScriptedFetcher::new();
    versioned(&fetcher, "job");
    let client = client(&fetcher);

    client.execute_query(&job("1")).await.unwrap();
    client.invalidate(&[Tag::new("Job")]);

    // Nobody observes the entry, so nothing is refetched in the background.
    tokio::task::yield_now().await;
    assert_eq!(fetcher.call_count("job"), 1);
    let stale = client.entry(job("1").key()).unwrap();
    assert_eq!(stale.status(), QueryStatus::Success);
    assert_eq!(stale.data(), Some(&json!({"version": 1})));

    let reloaded = client.execute_query(&job("1")).await.unwrap();
    assert!(!reloaded.from_cache);
    assert_eq!(reloaded.data, json!({"version": 2}));
    assert!(client.entry(job("1").key()).unwrap().is_fresh());
}

#[tokio::test]
async fn subscribing_to_a_stale_entry_reloads_it() {
    let fetcher = ScriptedFetcher::new();
    versioned(&fetcher, "job");
    let client = client(&fetcher);

    client.execute_query(&job("1")).await.unwrap();
    client.invalidate(&[Tag::with_id("Job", "1")]);
    assert_eq!(fetcher.call_count("job"), 1);

    let subscription = client.subscribe(job("1"));
    let key = subscription.key().clone();
    eventually(|| client.entry(&key).is_some_and(|entry| entry.is_fresh())).await;

    assert_eq!(fetcher.call_count("job"), 2);
    assert_eq!(client.entry(&key).unwrap().data(), Some(&json!({"version": 2})));
}

#[tokio::test]
async fn subscribed_entries_are_refetched_in_the_background() {
    let fetcher = ScriptedFetcher::new();
    versioned(&fetcher, "job");
    let client = client(&fetcher);

    let subscription = client.subscribe(job("1"));
    let key = subscription.key().clone();
    eventually(|| client.entry(&key).is_some_and(|entry| entry.is_fresh())).await;
    client.execute_query(&job("2")).await.unwrap();

    client.invalidate(&[Tag::new("Job")]);
    eventually(|| client.entry(&key).is_some_and(|entry| entry.is_fresh())).await;

    assert_eq!(client.entry(&key).unwrap().data(), Some(&json!({"version": 3})));
    assert!(client.entry(job("2").key()).unwrap().is_stale());
    assert_eq!(fetcher.call_count("job"), 3);
}

#[tokio::test]
async fn mutation_refetches_affected_subscriptions() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("jobs", json!([{"id": "1"}]));
    fetcher.respond("jobs.create", json!({"id": "2"}));
    let client = client(&fetcher);

    let subscription = client.subscribe(job_list());
    let list = subscription.key().clone();
    eventually(|| client.entry(&list).is_some_and(|entry| entry.is_fresh())).await;

    fetcher.respond("jobs", json!([{"id": "1"}, {"id": "2"}]));
    let output = client
        .mutate("jobs.create", &json!({"title": "QA Engineer"}), &[Tag::with_id("Job", "LIST")])
        .await
        .unwrap();

    assert_eq!(output.data, json!({"id": "2"}));
    assert_eq!(output.source, DataSource::Remote);
    assert_eq!(output.invalidated, vec![list.clone()]);

    eventually(|| fetcher.call_count("jobs") == 2 && client.entry(&list).is_some_and(|entry| entry.is_fresh())).await;
    assert_eq!(client.entry(&list).unwrap().data(), Some(&json!([{"id": "1"}, {"id": "2"}])));
}

#[tokio::test]
async fn offline_mutation_uses_fallback_and_still_invalidates() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("job", json!({}));
    let client = QueryClient::builder(fetcher.clone())
        .fallback("jobs.delete", |_args: &tagcache::Args| json!({"deleted": true}))
        .build();

    let key = client.execute_query(&job("1")).await.unwrap().key;
    let output = client.mutate("jobs.delete", &json!({"id": "1"}), &[Tag::with_id("Job", "1")]).await.unwrap();

    assert_eq!(output.source, DataSource::Fallback);
    assert_eq!(output.data, json!({"deleted": true}));
    assert_eq!(output.invalidated, vec![key.clone()]);
    assert!(client.entry(&key).unwrap().is_stale());
}

#[tokio::test]
async fn failed_mutation_invalidates_nothing() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("job", json!({}));
    let client = client(&fetcher);

    let key = client.execute_query(&job("1")).await.unwrap().key;
    let error = client.mutate("jobs.delete", &json!({"id": "1"}), &[Tag::new("Job")]).await.unwrap_err();

    assert!(matches!(&error, Error::Mutation { endpoint, .. } if endpoint == "jobs.delete"));
    assert!(client.entry(&key).unwrap().is_fresh());
}

#[tokio::test]
async fn invalidation_during_a_load_requeues_it() {
    let fetcher = ScriptedFetcher::new();
    versioned(&fetcher, "jobs");
    fetcher.hold();
    let client = client(&fetcher);

    let subscription = client.subscribe(Query::new("jobs").provides(Tag::new("Job")));
    let key = subscription.key().clone();
    eventually(|| fetcher.call_count("jobs") == 1).await;
    assert_eq!(client.entry(&key).unwrap().status(), QueryStatus::Loading);

    // The entry is not indexed yet; the load remembers the invalidation instead.
    assert!(client.invalidate(&[Tag::new("Job")]).is_empty());
    fetcher.release();

    eventually(|| fetcher.call_count("jobs") == 2 && client.entry(&key).is_some_and(|entry| entry.is_fresh())).await;
    assert_eq!(client.entry(&key).unwrap().data(), Some(&json!({"version": 2})));
}

#[tokio::test]
async fn unrelated_invalidation_during_a_load_is_dropped() {
    let fetcher = ScriptedFetcher::new();
    versioned(&fetcher, "jobs");
    fetcher.hold();
    let client = client(&fetcher);

    let subscription = client.subscribe(Query::new("jobs").provides(Tag::new("Job")));
    let key = subscription.key().clone();
    eventually(|| fetcher.call_count("jobs") == 1).await;

    client.invalidate(&[Tag::new("User")]);
    fetcher.release();

    eventually(|| client.entry(&key).is_some_and(|entry| entry.is_fresh())).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fetcher.call_count("jobs"), 1);
    assert_eq!(client.entry(&key).unwrap().data(), Some(&json!({"version": 1})));
}

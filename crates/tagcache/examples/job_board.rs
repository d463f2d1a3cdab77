// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A job board that keeps working while its backend is down.
//!
//! The board observes the job list through a query handle, posts a new job through a mutation
//! that invalidates the list, then loses its backend and keeps serving jobs, applications, users
//! and profiles from fallback data.
//!
//! Run with: cargo run -p tagcache --example job_board

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tagcache::{
    Args, FetchFn, FetchRequest, ListFallback, Method, Provides, Query, QueryClient, QueryStatus, RecordFallback, Tag,
    TransportFailure,
};

#[derive(Debug, Default)]
struct Backend {
    online: AtomicBool,
    jobs: Mutex<Vec<Value>>,
}

impl Backend {
    fn handle(&self, request: &FetchRequest) -> Result<Value, TransportFailure> {
        if !self.online.load(Ordering::Acquire) {
            return Err(TransportFailure::from("connection refused"));
        }

        let mut jobs = self.jobs.lock();
        match (&*request.endpoint, request.method) {
            ("jobs", Method::Query) => Ok(Value::Array(jobs.clone())),
            ("jobs.create", Method::Mutate) => {
                let mut job = Value::Object(request.args.as_ref().clone());
                job["id"] = json!((jobs.len() + 1).to_string());
                jobs.push(job.clone());
                Ok(job)
            }
            (endpoint, _) => Err(TransportFailure::from(format!("no route for `{endpoint}`"))),
        }
    }
}

fn job_tags(data: &Value, _args: &Args) -> Vec<Tag> {
    let mut tags = vec![Tag::with_id("Job", "LIST")];
    if let Some(jobs) = data.as_array() {
        tags.extend(jobs.iter().filter_map(|job| job["id"].as_str()).map(|id| Tag::with_id("Job", id)));
    }
    tags
}

fn render(label: &str, data: Option<&Value>) {
    let titles: Vec<&str> = data
        .and_then(Value::as_array)
        .map(|jobs| jobs.iter().filter_map(|job| job["title"].as_str()).collect())
        .unwrap_or_default();
    println!("{label}: {titles:?}");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), tagcache::Error> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let backend = Arc::new(Backend {
        online: AtomicBool::new(true),
        jobs: Mutex::new(vec![json!({"id": "1", "title": "Frontend Engineer"})]),
    });
    let remote = Arc::clone(&backend);
    let fetcher = FetchFn::new(move |request: FetchRequest| {
        let response = remote.handle(&request);
        async move { response }
    });

    let client = QueryClient::builder(fetcher)
        .name("job_board")
        .fallback(
            "jobs",
            ListFallback::new([
                json!({"id": "1", "title": "Frontend Engineer"}),
                json!({"id": "2", "title": "Senior Front-End Developer"}),
                json!({"id": "3", "title": "Backend Engineer"}),
            ]),
        )
        .fallback("job", RecordFallback::new([json!({"id": "1", "title": "Frontend Engineer"})]))
        .fallback(
            "applications",
            ListFallback::new([
                json!({"id": "a1", "job_id": "1", "status": "pending", "name": "Ada Lovelace"}),
                json!({"id": "a2", "job_id": "1", "status": "accepted", "name": "Grace Hopper"}),
                json!({"id": "a3", "job_id": "3", "status": "pending", "name": "Alan Turing"}),
            ])
            .filter_by("job_id")
            .filter_by("status"),
        )
        .fallback(
            "users",
            ListFallback::new([
                json!({"id": "u1", "name": "Ada Lovelace"}),
                json!({"id": "u2", "name": "Grace Hopper"}),
            ])
            .page_size(10),
        )
        .fallback(
            "user.profile",
            RecordFallback::new([json!({"user_id": "u1", "headline": "Analytical engines"})])
                .id_field("user_id")
                .id_arg("user_id"),
        )
        .build();

    let mut board = client.query(Query::new("jobs").provides(Provides::from_fn(job_tags)));
    while board.state().status != QueryStatus::Success {
        board.changed().await;
    }
    render("online", board.state().data.as_ref());

    let post = client.mutation("jobs.create", [Tag::with_id("Job", "LIST")]);
    post.trigger(&json!({"title": "QA Engineer"})).await?;
    while board.state().data.as_ref().and_then(Value::as_array).map_or(0, Vec::len) < 2 {
        board.changed().await;
    }
    render("after posting", board.state().data.as_ref());

    backend.online.store(false, Ordering::Release);
    let search = client.execute("jobs", &json!({"search": "front"}), Tag::new("Job")).await?;
    render("offline search", Some(&search.data));

    let job = client.execute("job", &json!({"id": "1"}), Tag::with_id("Job", "1")).await?;
    println!("offline record: {} ({:?})", job.data["title"], job.source);

    let pending = client
        .execute(
            "applications",
            &json!({"job_id": "1", "status": "pending"}),
            Tag::with_id("Application", "LIST"),
        )
        .await?;
    println!("offline pending applications: {}", pending.data);

    let users = client.execute("users", &json!({"search": "grace", "page": 1}), Tag::new("User")).await?;
    println!("offline user search: {}", users.data);

    let profile = client.execute("user.profile", &json!({"user_id": "u1"}), Tag::with_id("User", "u1")).await?;
    println!("offline profile: {}", profile.data);

    match client.execute("reports", &(), Provides::Nothing).await {
        Ok(_) => println!("reports unexpectedly available"),
        Err(error) => println!("reports: {error}"),
    }

    Ok(())
}

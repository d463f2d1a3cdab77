// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates using `InFlight` to keep a burst of identical screen loads down to one
//! network round-trip.
//!
//! Five consumers ask for the same job list at nearly the same time. Only the first one
//! performs the fetch; the others join it and receive a copy of its result.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tagcache_flight::InFlight;

#[tokio::main]
async fn main() {
    let flights = InFlight::<String, String>::new();
    let execution_count = Arc::new(AtomicUsize::new(0));

    println!("Starting 5 concurrent loads of jobs({{\"search\":\"rust\"}})...\n");

    let mut handles = Vec::new();
    for i in 1..=5 {
        let flights = flights.clone();
        let counter = Arc::clone(&execution_count);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();

            let result = flights
                .get_or_start("jobs({\"search\":\"rust\"})".to_string(), move || async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    println!("  [Consumer {i}] Fetching job list from the API... (execution #{count})");

                    // Simulate a slow endpoint
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    "[Rust Engineer, Rust Intern]".to_string()
                })
                .await;

            let elapsed = start.elapsed();
            match result {
                Ok(jobs) => println!("  [Consumer {i}] Got result in {elapsed:?}: {jobs}"),
                Err(abandoned) => println!("  [Consumer {i}] Failed after {elapsed:?}: {abandoned}"),
            }
        });

        handles.push(handle);

        // Stagger the requests slightly to see the deduplication in action
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for handle in handles {
        handle.await.expect("Task panicked");
    }

    let total_executions = execution_count.load(Ordering::SeqCst);
    println!("\nAll consumers served! The API was called {total_executions} time(s) for 5 loads.");
}

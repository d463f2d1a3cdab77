// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for the remote fetch collaborator.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::{Args, Fetch, FetchRequest, Method, TransportFailure};

type Responder = Arc<dyn Fn(&Args) -> Result<Value, TransportFailure> + Send + Sync>;

/// One request observed by a [`ScriptedFetcher`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct FetchCall {
    /// The endpoint called.
    pub endpoint: String,
    /// The normalized arguments.
    pub args: Args,
    /// Read or write.
    pub method: Method,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, Responder>,
    calls: Vec<FetchCall>,
}

/// A scripted [`Fetch`] implementation that records every request.
///
/// Endpoints answer with whatever was scripted for them; unscripted endpoints fail as if the
/// remote source were offline. While [held](Self::hold), requests are recorded but do not
/// complete until [released](Self::release), which makes in-flight behavior observable.
///
/// Clones share the script and the recorded calls.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{Query, QueryClient, testing::ScriptedFetcher};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tagcache::Error> {
/// let fetcher = ScriptedFetcher::new();
/// fetcher.respond("users", json!(["ada"]));
///
/// let client = QueryClient::builder(fetcher.clone()).build();
/// client.execute_query(&Query::new("users")).await?;
/// assert_eq!(fetcher.call_count("users"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ScriptedFetcher {
    script: Arc<Mutex<Script>>,
    gate: Arc<watch::Sender<bool>>,
}

impl ScriptedFetcher {
    /// Creates a fetcher with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::default(),
            gate: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Answers every request to `endpoint` with `value`.
    pub fn respond(&self, endpoint: impl Into<String>, value: Value) {
        self.respond_with(endpoint, move |_args| Ok(value.clone()));
    }

    /// Answers requests to `endpoint` by calling `responder` with the arguments.
    pub fn respond_with<R>(&self, endpoint: impl Into<String>, responder: R)
    where
        R: Fn(&Args) -> Result<Value, TransportFailure> + Send + Sync + 'static,
    {
        self.script.lock().responses.insert(endpoint.into(), Arc::new(responder));
    }

    /// Fails every request to `endpoint` with `reason`.
    pub fn fail(&self, endpoint: impl Into<String>, reason: impl Into<String>) {
        let reason = reason.into();
        self.respond_with(endpoint, move |_args| Err(TransportFailure::from(reason.clone())));
    }

    /// Holds every request, including ones already waiting, until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    /// Lets held requests complete.
    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Every request seen so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<FetchCall> {
        self.script.lock().calls.clone()
    }

    /// Number of requests seen for `endpoint`.
    #[must_use]
    pub fn call_count(&self, endpoint: &str) -> usize {
        self.script.lock().calls.iter().filter(|call| call.endpoint == endpoint).count()
    }

    /// Number of requests seen for all endpoints.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.script.lock().calls.len()
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScriptedFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let script = self.script.lock();
        let mut endpoints: Vec<_> = script.responses.keys().collect();
        endpoints.sort_unstable();
        f.debug_struct("ScriptedFetcher")
            .field("endpoints", &endpoints)
            .field("calls", &script.calls.len())
            .field("held", &*self.gate.borrow())
            .finish()
    }
}

impl Fetch for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) -> impl Future<Output = Result<Value, TransportFailure>> + Send {
        let responder = {
            let mut script = self.script.lock();
            script.calls.push(FetchCall {
                endpoint: request.endpoint.to_string(),
                args: (*request.args).clone(),
                method: request.method,
            });
            script.responses.get(&*request.endpoint).cloned()
        };
        let mut gate = self.gate.subscribe();

        async move {
            // The sender lives as long as the fetcher, which outlives its requests.
            let _released = gate.wait_for(|held| !*held).await;
            match responder {
                Some(responder) => responder(&request.args),
                None => Err(TransportFailure::from(format!("`{}` is offline", request.endpoint))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn request(endpoint: &str) -> FetchRequest {
        FetchRequest {
            endpoint: Arc::from(endpoint),
            args: Arc::new(Args::new()),
            method: Method::Query,
        }
    }

    #[tokio::test]
    async fn scripted_and_unscripted_endpoints() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("users", json!(["ada"]));
        fetcher.fail("jobs", "boom");

        assert_eq!(fetcher.fetch(request("users")).await.unwrap(), json!(["ada"]));
        assert_eq!(fetcher.fetch(request("jobs")).await.unwrap_err().to_string(), "transport failure: boom");
        assert!(fetcher.fetch(request("reports")).await.unwrap_err().to_string().contains("offline"));
        assert_eq!(fetcher.total_calls(), 3);
        assert_eq!(fetcher.call_count("users"), 1);
    }

    #[tokio::test]
    async fn held_requests_wait_for_release() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("users", json!([]));
        fetcher.hold();

        let pending = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch(request("users")).await }
        });
        while fetcher.total_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());

        fetcher.release();
        assert_eq!(pending.await.unwrap().unwrap(), json!([]));
        assert!(format!("{fetcher:?}").contains("held: false"));
    }
}

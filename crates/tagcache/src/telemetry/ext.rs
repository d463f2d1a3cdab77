// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tokio::time::Instant;

/// Result of a timed async operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timed<R> {
    pub result: R,
    pub duration: Duration,
}

/// Awaits `f` and measures how long it took on the Tokio clock.
pub(crate) async fn timed<F, R>(f: F) -> Timed<R>
where
    F: Future<Output = R>,
{
    let start = Instant::now();
    let result = f.await;
    Timed {
        result,
        duration: start.elapsed(),
    }
}

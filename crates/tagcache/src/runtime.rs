// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Where background refetches and eviction timers run.

use tokio::runtime::Handle;

#[derive(Debug, Clone, Default)]
pub(crate) struct Runtime {
    handle: Option<Handle>,
}

impl Runtime {
    /// Uses `handle`, or the runtime current at each spawn when `None`.
    pub(crate) fn new(handle: Option<Handle>) -> Self {
        Self { handle }
    }

    /// Spawns `work`. Returns `false` and drops `work` if no runtime is available.
    pub(crate) fn spawn<T>(&self, work: T) -> bool
    where
        T: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle.clone().or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                drop(handle.spawn(work));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn spawn_without_runtime_reports_failure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        assert!(!Runtime::default().spawn(async move { flag.store(true, Ordering::Release) }));
        assert!(!ran.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn spawn_uses_current_runtime() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(Runtime::default().spawn(async move {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn spawn_uses_configured_handle_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let spawner = Runtime::new(Some(runtime.handle().clone()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(spawner.spawn(async move {
            let _ = tx.send("done");
        }));
        assert_eq!(runtime.block_on(rx).unwrap(), "done");
    }
}

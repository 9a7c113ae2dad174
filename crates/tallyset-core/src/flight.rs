//! Single-in-flight execution per key.
//!
//! The first caller for a key starts the work; callers arriving while it runs
//! await the same shared future and receive a clone of its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::ServiceError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ServiceError>>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Mutex<HashMap<String, SharedResult<T>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless a run for `key` is already in flight,
    /// in which case attach to it. `make` is not called when attaching.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(key) {
                Some(existing) => {
                    tracing::debug!(key, "attaching to in-flight run");
                    existing.clone()
                }
                None => {
                    let shared = make().boxed().shared();
                    inflight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            inflight.remove(key);
        }
        result
    }

    /// Number of keys with a run in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

//! Fetch strategies reconciling the active cache generation with the network
//!
//! Every strategy takes the request plus a [`StrategyContext`] naming the store,
//! the active generation, and the transport. Store failures are treated as
//! misses; only a transport-level failure can surface as an `Err`.

mod cache_first;
mod network_first;
mod stale_while_revalidate;

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CacheStore, CachedEntry, GenerationHandle};
use crate::classifier::Strategy;
use crate::lifecycle::WriteGate;
use crate::lock::mutex_lock;
use crate::request::{Request, RequestKey, Response};
use crate::transport::{Transport, TransportError};

const SOURCE: &str = "strategy";

/// Background refreshes still running after their request was answered
///
/// A process that exits should [`drain`](RefreshTracker::drain) first, or the
/// refreshes are cancelled with the runtime.
#[derive(Default)]
pub struct RefreshTracker {
    tasks: Mutex<JoinSet<()>>,
}

impl RefreshTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spawn<F>(&self, refresh: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "refresh.spawn");
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "background refresh ended abnormally");
            }
        }
        tasks.spawn(refresh);
    }

    /// Refreshes not yet reaped
    pub fn pending(&self) -> usize {
        mutex_lock(&self.tasks, SOURCE, "refresh.pending").len()
    }

    /// Waits for every refresh started so far, including ones started while waiting
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *mutex_lock(&self.tasks, SOURCE, "refresh.drain"));
            if tasks.is_empty() {
                return;
            }
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    warn!(error = %e, "background refresh ended abnormally");
                }
            }
        }
    }
}

/// Everything a strategy needs to serve one request
#[derive(Clone)]
pub struct StrategyContext {
    /// Shared cache store
    pub store: Arc<CacheStore>,
    /// The generation currently answering lookups
    pub generation: GenerationHandle,
    /// Network transport
    pub transport: Arc<dyn Transport>,
    /// Key of the pre-cached offline page, served for failed navigations
    pub offline_fallback: Option<RequestKey>,
    /// Refuses writes once `generation` is no longer active
    pub gate: Arc<WriteGate>,
    /// Owner of background refreshes
    pub refreshes: Arc<RefreshTracker>,
}

impl StrategyContext {
    pub(crate) fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
        self.store.lookup(&self.generation, key)
    }

    /// Writes a response into the active generation; failures are logged and dropped
    ///
    /// A generation retired since the request started is left alone.
    pub(crate) fn remember(&self, key: &RequestKey, response: &Response) {
        let label = self.generation.label();
        let written = self
            .gate
            .write_if_active(label, || self.store.put(&self.generation, key, response));
        match written {
            None => debug!(generation = label, key = %key, "generation retired; not caching"),
            Some(Err(e)) => warn!(
                generation = label,
                key = %key,
                error = %e,
                "cache write failed; continuing without caching"
            ),
            Some(Ok(_)) => {}
        }
    }
}

/// Runs the named strategy
pub async fn execute(
    strategy: Strategy,
    request: &Request,
    ctx: &StrategyContext,
) -> Result<Response, TransportError> {
    match strategy {
        Strategy::Bypass => ctx.transport.fetch(request).await,
        Strategy::NetworkFirst => network_first::execute(request, ctx).await,
        Strategy::CacheFirst => Ok(cache_first::execute(request, ctx).await),
        Strategy::StaleWhileRevalidate => stale_while_revalidate::execute(request, ctx).await,
    }
}

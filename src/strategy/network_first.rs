//! Network-first: freshest content when reachable, last known good otherwise

use tracing::debug;

use super::StrategyContext;
use crate::request::{Request, Response};
use crate::transport::TransportError;

/// Fetches from the network, falling back to the cache and then the offline page
///
/// Successful responses are written to the active generation before they are
/// returned. Non-2xx responses are returned as-is and never trigger a fallback.
pub(crate) async fn execute(
    request: &Request,
    ctx: &StrategyContext,
) -> Result<Response, TransportError> {
    let key = request.key();

    let err = match ctx.transport.fetch(request).await {
        Ok(response) => {
            ctx.remember(&key, &response);
            return Ok(response);
        }
        Err(err) => err,
    };

    if let Some(entry) = ctx.lookup(&key) {
        debug!(strategy = "network-first", key = %key, outcome = "cached", error = %err, "network failed; serving cached response");
        return Ok(entry.into_response());
    }

    if request.is_navigation() {
        if let Some(entry) = ctx.offline_fallback.as_ref().and_then(|k| ctx.lookup(k)) {
            debug!(strategy = "network-first", key = %key, outcome = "offline-fallback", error = %err, "network failed; serving offline page");
            return Ok(entry.into_response());
        }
    }

    debug!(strategy = "network-first", key = %key, outcome = "failed", error = %err, "network failed with nothing cached");
    Err(err)
}

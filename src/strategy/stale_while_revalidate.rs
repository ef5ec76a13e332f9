//! Stale-while-revalidate: answer from the cache now, refresh it for next time
//!
//! Concurrent refreshes of the same key are not de-duplicated; each read starts
//! its own fetch and the last successful write wins.

use tracing::{debug, warn};

use super::StrategyContext;
use crate::request::{Request, RequestKey, Response};
use crate::transport::TransportError;

/// Returns the cached response if any, always starting a refresh
///
/// A hit hands the refresh to [`RefreshTracker`](super::RefreshTracker) and
/// returns at once. On a cold cache the refresh is awaited and its result
/// returned, failure included.
pub(crate) async fn execute(
    request: &Request,
    ctx: &StrategyContext,
) -> Result<Response, TransportError> {
    let key = request.key();

    if let Some(entry) = ctx.lookup(&key) {
        debug!(strategy = "stale-while-revalidate", key = %key, outcome = "hit", "serving cached response; refreshing in background");
        let refresh = revalidate(request.clone(), key, ctx.clone());
        ctx.refreshes.spawn(async move {
            let _ = refresh.await;
        });
        return Ok(entry.into_response());
    }

    debug!(strategy = "stale-while-revalidate", key = %key, outcome = "miss", "awaiting network");
    match tokio::spawn(revalidate(request.clone(), key.clone(), ctx.clone())).await {
        Ok(result) => result,
        Err(join_err) => {
            warn!(key = %key, error = %join_err, "refresh task did not complete");
            Err(TransportError::Aborted)
        }
    }
}

async fn revalidate(
    request: Request,
    key: RequestKey,
    ctx: StrategyContext,
) -> Result<Response, TransportError> {
    match ctx.transport.fetch(&request).await {
        Ok(response) => {
            ctx.remember(&key, &response);
            Ok(response)
        }
        Err(err) => {
            debug!(key = %key, error = %err, "background refresh failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::test_support::*;
    use super::*;
    use crate::lifecycle::WriteGate;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn test_hit_returns_without_waiting_on_transport() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.hang("/api/items");
        let (ctx, _temp_dir) = context(transport);
        seed(&ctx, "/api/items", "old");

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            execute(&request("/api/items"), &ctx),
        )
        .await
        .expect("hit must not wait on the transport")
        .unwrap();

        assert_eq!(&response.body[..], b"old");
    }

    #[tokio::test]
    async fn test_hit_refreshes_cache_in_background() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/items", 200, "new");
        let (ctx, _temp_dir) = context(transport.clone());
        seed(&ctx, "/api/items", "old");

        let response = execute(&request("/api/items"), &ctx).await.unwrap();

        assert_eq!(&response.body[..], b"old");
        assert_eq!(ctx.refreshes.pending(), 1);
        ctx.refreshes.drain().await;
        assert_eq!(cached_body(&ctx, "/api/items").as_deref(), Some("new"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_old_entry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/items", 503, "down");
        let (ctx, _temp_dir) = context(transport.clone());
        seed(&ctx, "/api/items", "old");

        let response = execute(&request("/api/items"), &ctx).await.unwrap();
        assert_eq!(&response.body[..], b"old");

        ctx.refreshes.drain().await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(cached_body(&ctx, "/api/items").as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_miss_awaits_network_and_stores() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/items", 200, "fresh");
        let (ctx, _temp_dir) = context(transport);

        let response = execute(&request("/api/items"), &ctx).await.unwrap();

        assert_eq!(&response.body[..], b"fresh");
        assert_eq!(cached_body(&ctx, "/api/items").as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_miss_propagates_transport_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_offline(true);
        let (ctx, _temp_dir) = context(transport);

        let result = execute(&request("/api/items"), &ctx).await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_miss_returns_application_error_uncached() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/items", 401, "unauthorized");
        let (ctx, _temp_dir) = context(transport);

        let response = execute(&request("/api/items"), &ctx).await.unwrap();

        assert_eq!(response.status, 401);
        assert!(cached_body(&ctx, "/api/items").is_none());
    }

    #[tokio::test]
    async fn test_refresh_finishing_after_retirement_leaves_store_alone() {
        let transport = Arc::new(ScriptedTransport::new());
        let gate = transport.gated("/api/items", 200, "late");
        let (mut ctx, _temp_dir) = context(transport);
        seed(&ctx, "/api/items", "old");
        let write_gate = Arc::new(WriteGate::new(Some("v1")));
        ctx.gate = write_gate.clone();

        let response = execute(&request("/api/items"), &ctx).await.unwrap();
        assert_eq!(&response.body[..], b"old");

        // v2 takes over and v1 is swept while the refresh is still in flight
        write_gate.set(Some("v2"));
        ctx.store.delete("v1").unwrap();
        gate.add_permits(1);
        ctx.refreshes.drain().await;

        assert!(ctx.store.list_generations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_falls_back_to_network() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/items", 200, "new");
        let (ctx, _temp_dir) = context(transport);
        seed(&ctx, "/api/items", "old");
        let response = execute(&request("/api/items"), &ctx).await.unwrap();
        assert_eq!(&response.body[..], b"old");
        ctx.refreshes.drain().await;

        break_store(&ctx);
        let response = execute(&request("/api/items"), &ctx).await.unwrap();

        assert_eq!(&response.body[..], b"new");
    }
}

//! Cache-first: static assets are immutable, so a hit never touches the network

use tracing::{debug, warn};

use super::StrategyContext;
use crate::request::{Request, Response};

/// Serves from the cache, fetching and storing on a miss
///
/// Never fails: when the asset is neither cached nor reachable, a synthesized
/// unavailable response is returned instead of an error.
pub(crate) async fn execute(request: &Request, ctx: &StrategyContext) -> Response {
    let key = request.key();

    if let Some(entry) = ctx.lookup(&key) {
        debug!(strategy = "cache-first", key = %key, outcome = "hit", "serving cached asset");
        return entry.into_response();
    }

    match ctx.transport.fetch(request).await {
        Ok(response) => {
            debug!(strategy = "cache-first", key = %key, outcome = "miss", status = response.status, "fetched asset");
            ctx.remember(&key, &response);
            response
        }
        Err(err) => {
            warn!(strategy = "cache-first", key = %key, error = %err, "asset unavailable");
            Response::asset_unavailable()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::*;
    use super::*;
    use crate::request::ASSET_UNAVAILABLE_STATUS;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn test_hit_makes_no_network_call() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/app.js", 200, "network");
        let (ctx, _temp_dir) = context(transport.clone());
        seed(&ctx, "/app.js", "cached");

        let response = execute(&request("/app.js"), &ctx).await;

        assert_eq!(&response.body[..], b"cached");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/app.css", 200, "body{}");
        let (ctx, _temp_dir) = context(transport.clone());

        let response = execute(&request("/app.css"), &ctx).await;

        assert_eq!(&response.body[..], b"body{}");
        assert_eq!(transport.calls(), 1);
        assert_eq!(cached_body(&ctx, "/app.css").as_deref(), Some("body{}"));
    }

    #[tokio::test]
    async fn test_miss_with_failed_transport_is_synthesized_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_offline(true);
        let (ctx, _temp_dir) = context(transport);

        let response = execute(&request("/logo.png"), &ctx).await;

        assert_eq!(response.status, ASSET_UNAVAILABLE_STATUS);
        assert!(cached_body(&ctx, "/logo.png").is_none());
    }

    #[tokio::test]
    async fn test_miss_with_application_error_is_returned_uncached() {
        let transport = Arc::new(ScriptedTransport::new());
        let (ctx, _temp_dir) = context(transport);

        // Unscripted paths answer 404
        let response = execute(&request("/missing.js"), &ctx).await;

        assert_eq!(response.status, 404);
        assert!(cached_body(&ctx, "/missing.js").is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_returns_network_response() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/app.js", 200, "network");
        let (ctx, _temp_dir) = context(transport.clone());
        break_store(&ctx);

        let response = execute(&request("/app.js"), &ctx).await;

        assert_eq!(&response.body[..], b"network");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_offline_is_synthesized_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_offline(true);
        let (ctx, _temp_dir) = context(transport);
        seed(&ctx, "/app.js", "cached");
        break_store(&ctx);

        let response = execute(&request("/app.js"), &ctx).await;

        assert_eq!(response.status, ASSET_UNAVAILABLE_STATUS);
    }
}

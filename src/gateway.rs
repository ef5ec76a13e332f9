//! Single entry point for outbound requests
//!
//! Every request passes the admission filter, is classified, and is handed to
//! its strategy against the active generation. Lifecycle events and control
//! messages reach the cache through the same object.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cache::GenerationHandle;
use crate::classifier::{AdmissionFilter, RoutingTable, Strategy};
use crate::control::{self, ControlCommand};
use crate::lifecycle::{ClientLease, LifecycleController, LifecycleError};
use crate::request::{Request, Response};
use crate::strategy::{self, RefreshTracker, StrategyContext};
use crate::transport::{Transport, TransportError};

/// Where the gateway sends a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Rejected by the admission filter; forwarded untouched
    Passthrough,
    /// Admitted and handled by a strategy
    Intercept(Strategy),
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Passthrough => "passthrough",
            Route::Intercept(strategy) => strategy.as_str(),
        }
    }
}

/// Intercepts requests and dispatches them to fetch strategies
pub struct Gateway {
    lifecycle: Arc<LifecycleController>,
    routing: RoutingTable,
    admission: AdmissionFilter,
    transport: Arc<dyn Transport>,
    refreshes: Arc<RefreshTracker>,
}

impl Gateway {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        routing: RoutingTable,
        admission: AdmissionFilter,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            lifecycle,
            routing,
            admission,
            transport,
            refreshes: Arc::new(RefreshTracker::new()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// Decides how a request would be handled, without performing it
    pub fn route(&self, request: &Request) -> Route {
        if !self.admission.admits(request) {
            return Route::Passthrough;
        }
        Route::Intercept(self.routing.classify(request))
    }

    /// Serves one request
    ///
    /// Returns a response whenever the cache or network can produce one. The only
    /// error is a transport failure that the selected strategy could not absorb.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: &Request) -> Result<Response, TransportError> {
        let strategy = match self.route(request) {
            Route::Passthrough | Route::Intercept(Strategy::Bypass) => {
                debug!("not intercepted");
                return self.transport.fetch(request).await;
            }
            Route::Intercept(strategy) => strategy,
        };

        let Some(generation) = self.lifecycle.active() else {
            debug!(strategy = %strategy, "no active generation; forwarding");
            return self.transport.fetch(request).await;
        };

        let ctx = self.context(generation);
        strategy::execute(strategy, request, &ctx).await
    }

    fn context(&self, generation: GenerationHandle) -> StrategyContext {
        StrategyContext {
            store: Arc::clone(self.lifecycle.store()),
            generation,
            transport: Arc::clone(&self.transport),
            offline_fallback: Some(self.lifecycle.manifest().offline_fallback_key()),
            gate: Arc::clone(self.lifecycle.write_gate()),
            refreshes: Arc::clone(&self.refreshes),
        }
    }

    /// Waits for background refreshes started by earlier requests
    pub async fn drain(&self) {
        let pending = self.refreshes.pending();
        if pending > 0 {
            debug!(pending, "waiting for background refreshes");
        }
        self.refreshes.drain().await;
    }

    /// Installs a version using this gateway's transport
    pub async fn on_install(&self, version: &str) -> Result<GenerationHandle, LifecycleError> {
        self.lifecycle
            .on_install(version, self.transport.as_ref())
            .await
    }

    /// Activates the waiting generation if no caller holds the old one
    pub fn on_activate(&self) -> Option<String> {
        self.lifecycle.on_activate()
    }

    /// Applies a control command synchronously
    pub fn on_control_message(&self, command: ControlCommand) {
        control::apply(&self.lifecycle, command);
    }

    /// Binds a caller to the active generation
    pub fn connect(&self) -> ClientLease {
        self.lifecycle.connect()
    }
}

//! In-memory transport used by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::request::{Request, Response};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Respond(Response),
    Fail(TransportError),
    Hang,
    /// Answers once a permit is added to the semaphore
    Gated(Arc<Semaphore>, Response),
}

/// Answers by URL path; unknown paths get a 404
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<String, Reply>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, path: &str, status: u16, body: &str) -> &Self {
        self.set(path, Reply::Respond(Response::new(status, body.to_string())))
    }

    pub(crate) fn hang(&self, path: &str) -> &Self {
        self.set(path, Reply::Hang)
    }

    /// Holds the path's response until the returned gate gets a permit
    pub(crate) fn gated(&self, path: &str, status: u16, body: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.set(
            path,
            Reply::Gated(gate.clone(), Response::new(status, body.to_string())),
        );
        gate
    }

    pub(crate) fn set(&self, path: &str, reply: Reply) -> &Self {
        self.replies.lock().unwrap().insert(path.to_string(), reply);
        self
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("offline".to_string()));
        }
        let reply = self.replies.lock().unwrap().get(request.url.path()).cloned();
        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::Gated(gate, response)) => {
                let _ = gate.acquire().await;
                Ok(response)
            }
            None => Ok(Response::new(404, "not found")),
        }
    }
}

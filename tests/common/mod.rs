//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

use shellcache::cache::{CacheStore, CachedEntry};
use shellcache::classifier::{AdmissionFilter, RoutingTable};
use shellcache::gateway::Gateway;
use shellcache::lifecycle::{LifecycleController, Manifest};
use shellcache::request::{Request, Response};
use shellcache::transport::{Transport, TransportError};

pub const ORIGIN: &str = "https://app.example.com";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Transport answering by URL path, with a switch to simulate losing the network
#[derive(Debug, Default)]
pub struct FakeNetwork {
    bodies: Mutex<HashMap<String, (u16, String)>>,
    hanging: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, status: u16, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn hang(&self, path: &str) {
        self.hanging.lock().unwrap().push(path.to_string());
    }

    /// Holds replies for `path` until a permit is added to the returned semaphore
    pub fn gate(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("network unreachable".to_string()));
        }
        let path = request.url.path().to_string();
        if self.hanging.lock().unwrap().contains(&path) {
            return std::future::pending().await;
        }
        let gate = self.gates.lock().unwrap().get(&path).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        let reply = self.bodies.lock().unwrap().get(&path).cloned();
        Ok(match reply {
            Some((status, body)) => Response::new(status, body),
            None => Response::new(404, "not found"),
        })
    }
}

/// A gateway over a temporary store with the `["/", "/offline.html"]` manifest
pub struct Harness {
    pub gateway: Gateway,
    pub network: Arc<FakeNetwork>,
    pub temp_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let network = FakeNetwork::new();
        network.serve("/", 200, "<html>home</html>");
        network.serve("/offline.html", 200, "<html>offline</html>");

        let origin = Url::parse(ORIGIN).unwrap();
        let manifest = Manifest::new(
            &origin,
            &["/".to_string(), "/offline.html".to_string()],
            "/offline.html",
        )
        .unwrap();
        let store = Arc::new(CacheStore::with_dir(temp_dir.path().to_path_buf()));
        let lifecycle = Arc::new(LifecycleController::new(store, manifest));
        let gateway = Gateway::new(
            lifecycle,
            RoutingTable::default(),
            AdmissionFilter::new(&origin, ["fonts.gstatic.com"]),
            network.clone(),
        );

        Self {
            gateway,
            network,
            temp_dir,
        }
    }

    /// Installs and activates `version`
    pub async fn deploy(&self, version: &str) {
        self.gateway.on_install(version).await.unwrap();
        assert_eq!(self.gateway.on_activate().as_deref(), Some(version));
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.gateway.lifecycle().store()
    }

    pub fn generations(&self) -> Vec<String> {
        self.store().list_generations().unwrap().into_iter().collect()
    }

    pub fn cached(&self, request: &Request) -> Option<CachedEntry> {
        let generation = self.gateway.lifecycle().active()?;
        self.store().lookup(&generation, &request.key())
    }
}

/// Writes a configuration file pointing at `origin`
pub fn write_config(dir: &Path, origin: &str, version: &str) -> std::path::PathBuf {
    let path = dir.join("shellcache.toml");
    let content = format!(
        r#"origin = "{origin}"
version = "{version}"

[manifest]
paths = ["/", "/offline.html"]
offline_fallback = "/offline.html"

[transport]
timeout_secs = 2
"#
    );
    std::fs::write(&path, content).unwrap();
    path
}

/// Plain HTTP/1.1 origin whose routes can be changed while it runs
pub struct TestServer {
    pub origin: String,
    routes: Arc<Mutex<HashMap<String, String>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Replaces the body served for `path`
    pub fn serve(&self, path: &str, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_string());
    }

    /// Stops accepting connections
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Serves bodies by path until shut down; unknown paths answer 404
pub async fn spawn_http_server(routes: &[(&str, &str)]) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    let routes: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(
        routes
            .iter()
            .map(|(path, body)| (path.to_string(), body.to_string()))
            .collect(),
    ));

    let shared = routes.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = shared.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let body = routes.lock().unwrap().get(&path).cloned();
                let reply = match body {
                    Some(body) => format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                    None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    TestServer {
        origin,
        routes,
        task,
    }
}

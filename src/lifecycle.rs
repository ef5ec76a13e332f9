//! Generation lifecycle: install, wait, activate, sweep
//!
//! A version is installed into its own generation by fetching the manifest
//! all-or-nothing. It then waits until no caller is bound to the currently active
//! generation (or until it is force-activated). Activation makes it the only
//! generation that answers lookups and deletes every other generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStore, GenerationHandle, GenerationMarker, StoreError};
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::request::{Request, RequestKey};
use crate::transport::Transport;

const SOURCE: &str = "lifecycle";

/// Lifecycle state of one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Manifest is being fetched
    Installing,
    /// Installed, not yet serving
    Waiting,
    /// Answers every lookup
    Active,
    /// Replaced or failed; entries are gone
    Redundant,
}

/// Errors raised while installing a generation
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The cache store could not open or write the generation
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A manifest member could not be fetched successfully
    #[error("install incomplete: {path}: {reason}")]
    InstallIncomplete { path: String, reason: String },

    /// The manifest is inconsistent
    #[error("{0}")]
    InvalidManifest(String),
}

/// One shell resource pre-cached at install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path as configured
    pub path: String,
    /// Path resolved against the origin
    pub url: Url,
}

/// Ordered shell resources fetched during install, one of them the offline page
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    offline_fallback: Url,
}

impl Manifest {
    /// Resolves manifest paths against the origin
    ///
    /// Every path must be absolute, same-origin, and listed once; the offline
    /// fallback must be one of them.
    pub fn new(origin: &Url, paths: &[String], offline_fallback: &str) -> Result<Self, LifecycleError> {
        let mut entries: Vec<ManifestEntry> = Vec::with_capacity(paths.len());
        for path in paths {
            let url = resolve(origin, path)?;
            if entries.iter().any(|entry| entry.path == *path) {
                return Err(LifecycleError::InvalidManifest(format!(
                    "'{path}' is listed more than once"
                )));
            }
            entries.push(ManifestEntry {
                path: path.clone(),
                url,
            });
        }

        let offline_fallback = entries
            .iter()
            .find(|entry| entry.path == offline_fallback)
            .map(|entry| entry.url.clone())
            .ok_or_else(|| {
                LifecycleError::InvalidManifest(format!(
                    "offline fallback '{offline_fallback}' is not listed in the manifest"
                ))
            })?;

        Ok(Self {
            entries,
            offline_fallback,
        })
    }

    /// Manifest members in configured order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// URL of the offline page
    pub fn offline_fallback(&self) -> &Url {
        &self.offline_fallback
    }

    /// Cache key of the offline page
    pub fn offline_fallback_key(&self) -> RequestKey {
        Request::get(self.offline_fallback.clone()).key()
    }
}

fn resolve(origin: &Url, path: &str) -> Result<Url, LifecycleError> {
    let invalid = |reason: &str| LifecycleError::InvalidManifest(format!("'{path}' {reason}"));

    if !path.starts_with('/') {
        return Err(invalid("is not an absolute path"));
    }
    let url = origin
        .join(path)
        .map_err(|e| invalid(&format!("cannot be resolved: {e}")))?;
    if url.origin() != origin.origin() {
        return Err(invalid("does not resolve to the application origin"));
    }
    Ok(url)
}

/// Label of the only generation strategies may write into
///
/// Activation holds the write side while it swaps the label and sweeps, so a
/// strategy write either lands before the sweep or is refused.
#[derive(Debug, Default)]
pub struct WriteGate {
    label: RwLock<Option<String>>,
}

impl WriteGate {
    pub fn new(label: Option<&str>) -> Self {
        Self {
            label: RwLock::new(label.map(str::to_string)),
        }
    }

    /// Label currently open for writes
    pub fn current(&self) -> Option<String> {
        rw_read(&self.label, SOURCE, "write_gate.current").clone()
    }

    /// Runs `write` while `label` is held open, or returns `None` if it is not
    pub fn write_if_active<T>(&self, label: &str, write: impl FnOnce() -> T) -> Option<T> {
        let current = rw_read(&self.label, SOURCE, "write_gate.write");
        (current.as_deref() == Some(label)).then(write)
    }

    #[cfg(test)]
    pub(crate) fn set(&self, label: Option<&str>) {
        *rw_write(&self.label, SOURCE, "write_gate.set") = label.map(str::to_string);
    }
}

/// Active and waiting generations as recorded by their on-disk markers
#[derive(Debug, Clone, Default)]
pub struct DurableState {
    /// Most recently activated generation
    pub active: Option<GenerationMarker>,
    /// Newest generation installed after it and never activated
    pub waiting: Option<GenerationMarker>,
}

impl DurableState {
    /// Reads every install marker in the store
    pub fn read(store: &CacheStore) -> Result<Self, StoreError> {
        let markers: Vec<GenerationMarker> = store
            .list_generations()?
            .iter()
            .filter_map(|label| store.installed_marker(label))
            .collect();

        let active = markers
            .iter()
            .filter(|marker| marker.activated_at.is_some())
            .max_by_key(|marker| marker.activated_at)
            .cloned();
        let waiting = markers
            .iter()
            .filter(|marker| marker.activated_at.is_none())
            .filter(|marker| {
                active
                    .as_ref()
                    .map_or(true, |active| marker.installed_at > active.installed_at)
            })
            .max_by_key(|marker| marker.installed_at)
            .cloned();

        Ok(Self { active, waiting })
    }

    /// Whether `label` is the recorded active or waiting generation
    pub fn holds(&self, label: &str) -> bool {
        [&self.active, &self.waiting]
            .into_iter()
            .flatten()
            .any(|marker| marker.label == label)
    }
}

#[derive(Debug, Default)]
struct Registry {
    states: BTreeMap<String, LifecycleState>,
    active: Option<GenerationHandle>,
    waiting: Option<GenerationHandle>,
    /// Callers bound to each generation
    leases: HashMap<String, usize>,
}

impl Registry {
    fn bound_to_active(&self) -> usize {
        self.active
            .as_ref()
            .and_then(|active| self.leases.get(active.label()))
            .copied()
            .unwrap_or(0)
    }
}

/// Owns generation state transitions for one embedding process
#[derive(Debug)]
pub struct LifecycleController {
    store: Arc<CacheStore>,
    manifest: Manifest,
    registry: Mutex<Registry>,
    gate: Arc<WriteGate>,
}

impl LifecycleController {
    pub fn new(store: Arc<CacheStore>, manifest: Manifest) -> Self {
        Self {
            store,
            manifest,
            registry: Mutex::new(Registry::default()),
            gate: Arc::new(WriteGate::default()),
        }
    }

    /// Gate strategy writes must pass to reach the active generation
    pub fn write_gate(&self) -> &Arc<WriteGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// State of a generation this controller has seen
    pub fn state(&self, label: &str) -> Option<LifecycleState> {
        mutex_lock(&self.registry, SOURCE, "state")
            .states
            .get(label)
            .copied()
    }

    /// Every generation this controller has seen, with its state
    pub fn states(&self) -> Vec<(String, LifecycleState)> {
        mutex_lock(&self.registry, SOURCE, "states")
            .states
            .iter()
            .map(|(label, state)| (label.clone(), *state))
            .collect()
    }

    /// The generation currently answering lookups
    pub fn active(&self) -> Option<GenerationHandle> {
        mutex_lock(&self.registry, SOURCE, "active").active.clone()
    }

    /// The installed generation awaiting activation
    pub fn waiting(&self) -> Option<GenerationHandle> {
        mutex_lock(&self.registry, SOURCE, "waiting").waiting.clone()
    }

    /// Number of callers bound to the active generation
    pub fn clients(&self) -> usize {
        mutex_lock(&self.registry, SOURCE, "clients").bound_to_active()
    }

    /// Restores the active and waiting generations recorded on disk
    ///
    /// Used at process start so a previously activated generation keeps serving
    /// and an installed but never activated one keeps waiting. Every other
    /// generation is swept. Returns the active label.
    pub fn resume(&self) -> Result<Option<String>, StoreError> {
        let mut registry = mutex_lock(&self.registry, SOURCE, "resume");
        if let Some(active) = &registry.active {
            return Ok(Some(active.label().to_string()));
        }

        let durable = DurableState::read(&self.store)?;
        let mut gate = rw_write(&self.gate.label, SOURCE, "resume");

        if let Some(marker) = &durable.active {
            let handle = self.store.open(&marker.label)?;
            if registry
                .waiting
                .as_ref()
                .is_some_and(|waiting| waiting.label() == marker.label)
            {
                registry.waiting = None;
            }
            registry.active = Some(handle);
            registry
                .states
                .insert(marker.label.clone(), LifecycleState::Active);
            *gate = Some(marker.label.clone());
            info!(generation = %marker.label, installed_at = %marker.installed_at, "resumed active generation");
        }

        if registry.waiting.is_none() {
            if let Some(marker) = &durable.waiting {
                registry.waiting = Some(self.store.open(&marker.label)?);
                registry
                    .states
                    .insert(marker.label.clone(), LifecycleState::Waiting);
                info!(generation = %marker.label, "restored waiting generation");
            }
        }

        if durable.active.is_none() && registry.waiting.is_none() {
            debug!("no installed generation to resume");
        }

        let keep: Vec<String> = [&registry.active, &registry.waiting]
            .into_iter()
            .flatten()
            .map(|handle| handle.label().to_string())
            .collect();
        self.sweep(&keep);
        drop(gate);

        Ok(durable.active.map(|marker| marker.label))
    }

    /// Installs a version into a new generation, leaving it `Waiting`
    ///
    /// All manifest members are fetched fresh and concurrently; if any fails,
    /// the generation is deleted and the version becomes `Redundant`.
    /// Installing the version that is already active is a no-op.
    pub async fn on_install(
        &self,
        version: &str,
        transport: &dyn Transport,
    ) -> Result<GenerationHandle, LifecycleError> {
        {
            let mut registry = mutex_lock(&self.registry, SOURCE, "on_install.begin");
            if let Some(active) = registry.active.as_ref().filter(|a| a.label() == version) {
                info!(version, "version already active; nothing to install");
                return Ok(active.clone());
            }
            registry
                .states
                .insert(version.to_string(), LifecycleState::Installing);
        }
        info!(version, entries = self.manifest.entries.len(), "installing generation");

        let result = match self.populate(version, transport).await {
            Ok(handle) => {
                let mut registry = mutex_lock(&self.registry, SOURCE, "on_install.commit");
                self.commit_install(&mut registry, handle)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            warn!(version, error = %err, "install failed; discarding generation");
            let mut registry = mutex_lock(&self.registry, SOURCE, "on_install.abort");
            if let Err(e) = self.store.delete(version) {
                warn!(version, error = %e, "failed to delete incomplete generation");
            }
            if registry.waiting.as_ref().is_some_and(|w| w.label() == version) {
                registry.waiting = None;
            }
            registry
                .states
                .insert(version.to_string(), LifecycleState::Redundant);
        }
        result
    }

    async fn populate(
        &self,
        version: &str,
        transport: &dyn Transport,
    ) -> Result<GenerationHandle, LifecycleError> {
        let handle = self.store.open(version)?;

        let requests: Vec<Request> = self
            .manifest
            .entries
            .iter()
            .map(|entry| Request::get(entry.url.clone()).with_header("cache-control", "no-cache"))
            .collect();
        let results = join_all(requests.iter().map(|request| transport.fetch(request))).await;

        for ((entry, request), result) in self.manifest.entries.iter().zip(&requests).zip(results) {
            let response = result.map_err(|e| LifecycleError::InstallIncomplete {
                path: entry.path.clone(),
                reason: e.to_string(),
            })?;
            if !response.is_success() {
                return Err(LifecycleError::InstallIncomplete {
                    path: entry.path.clone(),
                    reason: format!("status {}", response.status),
                });
            }
            self.store.put(&handle, &request.key(), &response)?;
        }
        Ok(handle)
    }

    /// Verifies and marks a populated generation, then moves it to `Waiting`
    ///
    /// Runs under the registry lock so an activation sweep cannot interleave
    /// between the check and the marker write.
    fn commit_install(
        &self,
        registry: &mut Registry,
        handle: GenerationHandle,
    ) -> Result<GenerationHandle, LifecycleError> {
        for entry in &self.manifest.entries {
            if self
                .store
                .lookup(&handle, &Request::get(entry.url.clone()).key())
                .is_none()
            {
                return Err(LifecycleError::InstallIncomplete {
                    path: entry.path.clone(),
                    reason: "entry removed before install completed".to_string(),
                });
            }
        }
        self.store.mark_installed(&handle)?;

        let label = handle.label().to_string();
        if let Some(previous) = registry.waiting.replace(handle.clone()) {
            if previous.label() != label {
                info!(generation = previous.label(), "superseded waiting generation");
                registry
                    .states
                    .insert(previous.label().to_string(), LifecycleState::Redundant);
                if let Err(e) = self.store.delete(previous.label()) {
                    warn!(generation = previous.label(), error = %e, "failed to delete superseded generation");
                }
            }
        }
        registry.states.insert(label.clone(), LifecycleState::Waiting);
        info!(generation = %label, "generation installed; waiting for activation");
        Ok(handle)
    }

    /// Activates the waiting generation if no caller is bound to the active one
    ///
    /// Returns the label that became active, if any.
    pub fn on_activate(&self) -> Option<String> {
        let mut registry = mutex_lock(&self.registry, SOURCE, "on_activate");
        let clients = registry.bound_to_active();
        if clients > 0 && registry.waiting.is_some() {
            debug!(clients, "activation deferred until bound callers release");
            return None;
        }
        self.activate_locked(&mut registry)
    }

    /// Activates the waiting generation regardless of bound callers
    ///
    /// No-op when nothing is waiting.
    pub fn force_activate(&self) -> Option<String> {
        let mut registry = mutex_lock(&self.registry, SOURCE, "force_activate");
        self.activate_locked(&mut registry)
    }

    fn activate_locked(&self, registry: &mut Registry) -> Option<String> {
        let next = registry.waiting.take()?;
        let label = next.label().to_string();
        let mut gate = rw_write(&self.gate.label, SOURCE, "activate");

        if let Some(previous) = registry.active.replace(next.clone()) {
            if previous.label() != label {
                registry
                    .states
                    .insert(previous.label().to_string(), LifecycleState::Redundant);
            }
        }
        registry.states.insert(label.clone(), LifecycleState::Active);
        *gate = Some(label.clone());
        if let Err(e) = self.store.mark_activated(&next) {
            warn!(generation = %label, error = %e, "failed to record activation");
        }
        info!(generation = %label, "generation activated");

        self.sweep(std::slice::from_ref(&label));
        Some(label)
    }

    /// Deletes every generation not named in `keep`
    fn sweep(&self, keep: &[String]) {
        let labels = match self.store.list_generations() {
            Ok(labels) => labels,
            Err(e) => {
                warn!(error = %e, "sweep skipped: cannot list generations");
                return;
            }
        };
        for label in labels.iter().filter(|label| !keep.contains(label)) {
            match self.store.delete(label) {
                Ok(()) => info!(generation = %label, "swept obsolete generation"),
                Err(e) => warn!(generation = %label, error = %e, "failed to sweep generation"),
            }
        }
    }

    /// Binds a caller to the active generation until the lease is dropped
    pub fn connect(self: &Arc<Self>) -> ClientLease {
        let mut registry = mutex_lock(&self.registry, SOURCE, "connect");
        let label = registry.active.as_ref().map(|a| a.label().to_string());
        if let Some(label) = &label {
            *registry.leases.entry(label.clone()).or_insert(0) += 1;
        }
        ClientLease {
            controller: Arc::clone(self),
            label,
        }
    }

    fn release(&self, label: &str) {
        let mut registry = mutex_lock(&self.registry, SOURCE, "release");
        let remaining = match registry.leases.get_mut(label) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        registry.leases.remove(label);

        let bound_to_active = registry
            .active
            .as_ref()
            .is_some_and(|active| active.label() == label);
        if bound_to_active && registry.waiting.is_some() {
            debug!(generation = label, "last caller released; activating waiting generation");
            self.activate_locked(&mut registry);
        }
    }
}

/// A caller's binding to the generation that was active when it connected
#[derive(Debug)]
pub struct ClientLease {
    controller: Arc<LifecycleController>,
    label: Option<String>,
}

impl ClientLease {
    /// Label of the generation this caller is bound to
    pub fn generation(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if let Some(label) = self.label.take() {
            self.controller.release(&label);
        }
    }
}

//! Sandbox registry
//!
//! The only shared mutable structure in the broker: a table from sandbox id to
//! its live resources and lifecycle state, guarded by one async `RwLock`. No
//! operation holds the lock across an await on anything else.
//!
//! Removing a sandbox detaches its resources but keeps a tombstone with the
//! final state, so ids that once existed stay distinguishable from fabricated
//! ones and can never be routed to again. Only the most recent tombstones are
//! kept; older ones are forgotten and their ids become unknown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{RegistryError, SandboxError};
use crate::transport::McpTransport;
use crate::types::{BootstrapMetadata, ContainerHandle, ImageRef, Sandbox, SandboxId, SandboxState};

/// Live resources of one sandbox.
pub struct SandboxEntry {
    id: SandboxId,
    metadata: Arc<BootstrapMetadata>,
    image: ImageRef,
    transport: Arc<dyn McpTransport>,
    handle: StdMutex<Option<ContainerHandle>>,
    container_name: String,
    /// Calls hold it shared; STOP takes it exclusively to drain them.
    gate: RwLock<()>,
    server_info: Option<Value>,
}

impl SandboxEntry {
    pub fn new(
        id: SandboxId,
        metadata: Arc<BootstrapMetadata>,
        image: ImageRef,
        transport: Arc<dyn McpTransport>,
        handle: ContainerHandle,
        server_info: Option<Value>,
    ) -> Self {
        Self {
            id,
            metadata,
            image,
            transport,
            container_name: handle.name.clone(),
            handle: StdMutex::new(Some(handle)),
            gate: RwLock::new(()),
            server_info,
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn metadata(&self) -> &Arc<BootstrapMetadata> {
        &self.metadata
    }

    pub fn transport(&self) -> &Arc<dyn McpTransport> {
        &self.transport
    }

    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    /// Admit one in-flight call.
    pub async fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Wait for every in-flight call to finish and keep new ones out.
    pub async fn drain(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    fn take_handle(&self) -> Option<ContainerHandle> {
        self.handle.lock().ok().and_then(|mut handle| handle.take())
    }
}

/// Tombstones kept by [`SandboxRegistry::new`].
pub const DEFAULT_RETAINED_TOMBSTONES: usize = 256;

struct Record {
    sandbox: Sandbox,
    entry: Option<Arc<SandboxEntry>>,
    retired_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_tombstone(&self) -> bool {
        self.entry.is_none() && self.sandbox.state.is_terminal()
    }
}

pub struct SandboxRegistry {
    records: RwLock<HashMap<SandboxId, Record>>,
    retained_tombstones: usize,
}

impl Default for SandboxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_TOMBSTONES)
    }

    /// Keep at most `retained_tombstones` stopped or failed sandboxes.
    pub fn with_retention(retained_tombstones: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retained_tombstones,
        }
    }

    /// Register a fully built entry in its initial state, in one step.
    pub async fn insert(&self, entry: SandboxEntry, state: SandboxState) -> Result<Arc<SandboxEntry>, RegistryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&entry.id) {
            return Err(RegistryError::Duplicate(entry.id.clone()));
        }

        let now = Utc::now();
        let sandbox = Sandbox {
            id: entry.id.clone(),
            repository_url: entry.metadata.repository_url.clone(),
            transport_kind: entry.transport.kind(),
            state,
            image: entry.image.tag.clone(),
            container_name: entry.container_name.clone(),
            created_at: now,
            last_active_at: now,
            server_info: entry.server_info.clone(),
        };
        let entry = Arc::new(entry);
        records.insert(
            entry.id.clone(),
            Record {
                sandbox,
                entry: Some(entry.clone()),
                retired_at: None,
            },
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &SandboxId) -> Option<Sandbox> {
        self.records.read().await.get(id).map(|r| r.sandbox.clone())
    }

    pub async fn state(&self, id: &SandboxId) -> Option<SandboxState> {
        self.records.read().await.get(id).map(|r| r.sandbox.state)
    }

    /// Move a sandbox forward in its lifecycle. Regressions and moves out of
    /// a terminal state are rejected; repeating the current state is a no-op.
    /// Returns the previous state.
    pub async fn update_state(&self, id: &SandboxId, next: SandboxState) -> Result<SandboxState, RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSandbox(id.clone()))?;

        let current = record.sandbox.state;
        if current == next {
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id: id.clone(),
                from: current,
                to: next,
            });
        }

        log::debug!("Sandbox {}: {} -> {}", id, current, next);
        record.sandbox.state = next;
        if next.is_terminal() {
            self.prune_tombstones(&mut records);
        }
        Ok(current)
    }

    /// Detach a sandbox's resources, leaving a tombstone. The container
    /// handle comes out exactly once; later calls return `None`.
    pub async fn remove(&self, id: &SandboxId) -> Option<ContainerHandle> {
        let entry = {
            let mut records = self.records.write().await;
            let record = records.get_mut(id)?;
            let entry = record.entry.take()?;
            record.retired_at = Some(Utc::now());
            self.prune_tombstones(&mut records);
            entry
        };
        entry.take_handle()
    }

    /// Forget the oldest tombstones beyond the retention cap.
    fn prune_tombstones(&self, records: &mut HashMap<SandboxId, Record>) {
        let mut tombstones: Vec<(DateTime<Utc>, SandboxId)> = records
            .iter()
            .filter(|(_, r)| r.is_tombstone())
            .map(|(id, r)| (r.retired_at.unwrap_or(r.sandbox.last_active_at), id.clone()))
            .collect();
        if tombstones.len() <= self.retained_tombstones {
            return;
        }

        tombstones.sort();
        let excess = tombstones.len() - self.retained_tombstones;
        for (_, id) in tombstones.into_iter().take(excess) {
            log::debug!("Forgetting stopped sandbox {}", id);
            records.remove(&id);
        }
    }

    /// Live entry of a sandbox, regardless of its state.
    pub async fn entry(&self, id: &SandboxId) -> Option<Arc<SandboxEntry>> {
        self.records.read().await.get(id).and_then(|r| r.entry.clone())
    }

    /// Entry of a sandbox that may receive tool traffic.
    pub async fn checkout(&self, id: &SandboxId) -> Result<Arc<SandboxEntry>, SandboxError> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| SandboxError::UnknownSandbox(id.clone()))?;

        match (&record.entry, record.sandbox.state) {
            (Some(entry), SandboxState::Running) => Ok(entry.clone()),
            (_, state) => Err(SandboxError::NotRunning {
                id: id.clone(),
                state,
            }),
        }
    }

    /// Fails with NOT_RUNNING unless the sandbox is RUNNING right now.
    pub async fn ensure_running(&self, id: &SandboxId) -> Result<(), SandboxError> {
        match self.state(id).await {
            Some(SandboxState::Running) => Ok(()),
            Some(state) => Err(SandboxError::NotRunning {
                id: id.clone(),
                state,
            }),
            None => Err(SandboxError::UnknownSandbox(id.clone())),
        }
    }

    pub async fn touch(&self, id: &SandboxId) {
        if let Some(record) = self.records.write().await.get_mut(id) {
            record.sandbox.last_active_at = Utc::now();
        }
    }

    pub async fn running_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.sandbox.state == SandboxState::Running)
            .count()
    }

    /// Sandboxes that still own resources (not yet removed).
    pub async fn live_ids(&self) -> Vec<SandboxId> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.entry.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Image tags of sandboxes that still own resources.
    pub async fn images_in_use(&self) -> HashSet<String> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.entry.is_some())
            .map(|r| r.sandbox.image.clone())
            .collect()
    }

    /// RUNNING sandboxes without traffic since `cutoff`.
    pub async fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<SandboxId> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.sandbox.state == SandboxState::Running && r.sandbox.last_active_at < cutoff)
            .map(|r| r.sandbox.id.clone())
            .collect()
    }

    /// Snapshots of every known sandbox, newest first.
    pub async fn list(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self
            .records
            .read()
            .await
            .values()
            .map(|r| r.sandbox.clone())
            .collect();
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sandboxes
    }
}

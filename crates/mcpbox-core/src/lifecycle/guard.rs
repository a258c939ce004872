//! Scoped ownership of a freshly started container.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::RuntimeError;
use crate::lifecycle::{ContainerRuntime, StdioPipe};
use crate::types::ContainerHandle;

/// Owns a started container until it is committed to the registry.
///
/// Dropping an armed guard (failed or cancelled START) schedules the
/// container's stop and removal on the current tokio runtime.
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: ContainerHandle,
    stdio: Option<StdioPipe>,
    grace: Duration,
    armed: bool,
}

impl std::fmt::Debug for ContainerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerGuard")
            .field("handle", &self.handle)
            .field("grace", &self.grace)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl ContainerGuard {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        handle: ContainerHandle,
        stdio: Option<StdioPipe>,
        grace: Duration,
    ) -> Self {
        Self {
            runtime,
            handle,
            stdio,
            grace,
            armed: true,
        }
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub(crate) fn handle_mut(&mut self) -> &mut ContainerHandle {
        &mut self.handle
    }

    /// Takes the attached stdio streams, if the container has them.
    pub fn take_stdio(&mut self) -> Option<StdioPipe> {
        self.stdio.take()
    }

    /// Hands the container over; the guard no longer cleans it up.
    pub fn commit(mut self) -> ContainerHandle {
        self.armed = false;
        self.handle.clone()
    }

    /// Stops and removes the container now.
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(e) = teardown(self.runtime.as_ref(), &self.handle.id, self.grace).await {
            log::warn!("Failed to clean up container {}: {}", self.handle.name, e);
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        log::warn!(
            "Container {} was started but never committed, scheduling cleanup",
            self.handle.name
        );
        let runtime = self.runtime.clone();
        let id = self.handle.id.clone();
        let name = self.handle.name.clone();
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = teardown(runtime.as_ref(), &id, grace).await {
                        log::warn!("Deferred cleanup of container {} failed: {}", name, e);
                    }
                });
            }
            Err(_) => log::error!("No runtime available to clean up container {}", name),
        }
    }
}

/// Graceful stop followed by forced removal. A failed stop does not prevent
/// the removal attempt.
pub(crate) async fn teardown(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    grace: Duration,
) -> Result<(), RuntimeError> {
    if let Err(e) = runtime.stop_container(container_id, grace).await {
        log::debug!("Stopping container {} failed: {}", container_id, e);
    }
    runtime.remove_container(container_id).await
}

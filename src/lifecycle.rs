//! Container lifecycle: deduplicated cold starts, stop and restart
//!
//! A cold start is a background task that asks the runtime to start the
//! container, then polls until the container reports running or the start
//! deadline passes. At most one start task exists per container; concurrent
//! callers share its outcome. The in-flight marker is removed by the task
//! itself once it resolves, whatever the result.

use crate::config::LifecycleConfig;
use crate::docker::{RuntimeError, SharedRuntime};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared result of a cold start: `true` once the container is running and settled
pub type StartOutcome = Shared<BoxFuture<'static, bool>>;

/// Timing for cold starts
#[derive(Debug, Clone)]
pub struct StartPolicy {
    /// Delay between readiness checks
    pub poll_interval: Duration,
    /// Upper bound on the whole start, launch call included
    pub max_wait: Duration,
    /// Pause after the container reports running, before it counts as ready
    pub settle_delay: Duration,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(15),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl From<&LifecycleConfig> for StartPolicy {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_wait: config.start_timeout(),
            settle_delay: config.settle_delay(),
        }
    }
}

struct InFlightStart {
    id: u64,
    outcome: StartOutcome,
    abort: AbortHandle,
}

/// Starts, stops and restarts containers through a [`ContainerRuntime`](crate::docker::ContainerRuntime)
pub struct LifecycleController {
    runtime: SharedRuntime,
    policy: StartPolicy,
    in_flight: Arc<DashMap<String, InFlightStart>>,
    next_start_id: AtomicU64,
}

impl LifecycleController {
    pub fn new(runtime: SharedRuntime, policy: StartPolicy) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            policy,
            in_flight: Arc::new(DashMap::new()),
            next_start_id: AtomicU64::new(0),
        })
    }

    pub fn policy(&self) -> &StartPolicy {
        &self.policy
    }

    pub async fn is_running(&self, container: &str) -> bool {
        self.runtime.is_running(container).await
    }

    /// Whether a cold start for `container` is currently in flight
    pub fn is_starting(&self, container: &str) -> bool {
        self.in_flight.contains_key(container)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Begin a cold start, or join the one already in flight.
    ///
    /// The start runs on its own task, so dropping the returned future does
    /// not cancel it.
    pub fn start(&self, container: &str) -> StartOutcome {
        match self.in_flight.entry(container.to_string()) {
            Entry::Occupied(existing) => {
                debug!(container, "Joining in-flight start");
                existing.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_start_id.fetch_add(1, Ordering::Relaxed);
                let runtime = Arc::clone(&self.runtime);
                let policy = self.policy.clone();
                let in_flight = Arc::clone(&self.in_flight);
                let name = container.to_string();

                let task = tokio::spawn(async move {
                    let ready = run_start(&runtime, &name, &policy).await;
                    in_flight.remove_if(&name, |_, start| start.id == id);
                    ready
                });

                let abort = task.abort_handle();
                let outcome = task.map(|joined| joined.unwrap_or(false)).boxed().shared();
                slot.insert(InFlightStart {
                    id,
                    outcome: outcome.clone(),
                    abort,
                });
                outcome
            }
        }
    }

    /// Begin a cold start without waiting for it
    pub fn trigger_start(&self, container: &str) {
        drop(self.start(container));
    }

    /// Best-effort stop; stopping a stopped container succeeds
    pub async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        info!(container, "Stopping container");
        self.runtime.stop(container).await.map_err(|e| {
            warn!(container, error = %e, "Failed to stop container");
            e
        })
    }

    pub async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
        info!(container, "Restarting container");
        self.runtime.restart(container).await.map_err(|e| {
            error!(container, error = %e, "Failed to restart container");
            e
        })
    }

    /// Abort every in-flight start. Waiters observe a failed start.
    pub fn shutdown(&self) {
        let pending: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for container in pending {
            if let Some((_, start)) = self.in_flight.remove(&container) {
                debug!(container, "Aborting in-flight start");
                start.abort.abort();
            }
        }
    }
}

async fn run_start(runtime: &SharedRuntime, container: &str, policy: &StartPolicy) -> bool {
    let began = Instant::now();
    let deadline = began + policy.max_wait;
    info!(container, "Cold-starting container");

    match tokio::time::timeout_at(deadline, runtime.start(container)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(container, error = %e, "Failed to start container");
            return false;
        }
        Err(_) => {
            error!(container, timeout_secs = policy.max_wait.as_secs(), "Start request timed out");
            return false;
        }
    }

    if !wait_until_running(runtime, container, policy.poll_interval, deadline).await {
        error!(
            container,
            timeout_secs = policy.max_wait.as_secs(),
            "Timed out waiting for container to run"
        );
        return false;
    }

    info!(
        container,
        elapsed_ms = began.elapsed().as_millis() as u64,
        "Container running"
    );
    tokio::time::sleep(policy.settle_delay).await;
    true
}

/// Poll `is_running` until it reports true or `deadline` passes
pub async fn wait_until_running(
    runtime: &SharedRuntime,
    container: &str,
    poll_interval: Duration,
    deadline: Instant,
) -> bool {
    loop {
        match tokio::time::timeout_at(deadline, runtime.is_running(container)).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

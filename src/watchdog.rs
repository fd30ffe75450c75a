//! Periodic sweep that stops containers idle past their timeout

use crate::lifecycle::LifecycleController;
use crate::registry::{ProjectEntry, RegistryStore, Settings};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Added to the runtime stop timeout to bound one entry's work in a sweep
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Slugs whose containers were stopped
    pub stopped: Vec<String>,
    /// Slugs whose stop failed or timed out
    pub failed: Vec<String>,
}

/// A dynamic entry that is past its idle timeout, as of the sweep instant
#[derive(Debug)]
struct IdleCandidate {
    slug: String,
    container: String,
    idle_secs: i64,
    timeout_secs: i64,
}

fn idle_candidate(slug: &str, project: &ProjectEntry, settings: &Settings, now: DateTime<Utc>) -> Option<IdleCandidate> {
    let target = project.dynamic_target()?;

    let timeout_secs = project.effective_idle_timeout(settings);
    if timeout_secs <= 0 {
        return None;
    }

    let idle = now - project.idle_since()?;
    if idle.num_milliseconds() <= timeout_secs.saturating_mul(1000) {
        return None;
    }
    let idle_secs = idle.num_seconds();

    Some(IdleCandidate {
        slug: slug.to_string(),
        container: target.container,
        idle_secs,
        timeout_secs,
    })
}

pub struct IdleWatchdog {
    registry: Arc<RegistryStore>,
    lifecycle: Arc<LifecycleController>,
    interval: Duration,
    entry_timeout: Duration,
}

impl IdleWatchdog {
    pub fn new(
        registry: Arc<RegistryStore>,
        lifecycle: Arc<LifecycleController>,
        interval: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            interval,
            entry_timeout: stop_timeout + STOP_MARGIN,
        }
    }

    /// Sweep once with the current wall clock
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Stop every running dynamic container idle longer than its timeout at `now`.
    ///
    /// Entries are handled concurrently, each bounded by the stop timeout plus
    /// a margin. A failing entry is reported and does not affect the others.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let registry = self.registry.load().await;

        let candidates: Vec<IdleCandidate> = registry
            .projects
            .iter()
            .filter_map(|(slug, project)| idle_candidate(slug, project, &registry.settings, now))
            .collect();

        if candidates.is_empty() {
            debug!(projects = registry.projects.len(), "Idle sweep: nothing to stop");
            return SweepReport::default();
        }

        let outcomes = futures::future::join_all(
            candidates
                .into_iter()
                .map(|candidate| async move {
                    let stopped = tokio::time::timeout(self.entry_timeout, self.stop_if_running(&candidate)).await;
                    (candidate, stopped)
                }),
        )
        .await;

        let mut report = SweepReport::default();
        for (candidate, outcome) in outcomes {
            match outcome {
                Ok(Ok(true)) => report.stopped.push(candidate.slug),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    warn!(slug = %candidate.slug, container = %candidate.container, error = %e, "Idle stop failed");
                    report.failed.push(candidate.slug);
                }
                Err(_) => {
                    warn!(
                        slug = %candidate.slug,
                        container = %candidate.container,
                        timeout_secs = self.entry_timeout.as_secs(),
                        "Idle stop timed out"
                    );
                    report.failed.push(candidate.slug);
                }
            }
        }

        if !report.stopped.is_empty() || !report.failed.is_empty() {
            info!(stopped = ?report.stopped, failed = ?report.failed, "Idle sweep complete");
        }
        report
    }

    async fn stop_if_running(&self, candidate: &IdleCandidate) -> Result<bool, crate::docker::RuntimeError> {
        if !self.lifecycle.is_running(&candidate.container).await {
            return Ok(false);
        }

        info!(
            slug = %candidate.slug,
            container = %candidate.container,
            idle_secs = candidate.idle_secs,
            timeout_secs = candidate.timeout_secs,
            "Stopping idle container"
        );
        self.lifecycle.stop(&candidate.container).await?;
        Ok(true)
    }

    /// Sweep every `interval` until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Idle watchdog started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Idle watchdog stopping");
                        break;
                    }
                }
            }
        }
    }
}

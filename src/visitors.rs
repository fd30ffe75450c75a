//! Bounded, append-only log of proxied visits and per-project statistics

use crate::error::StoreError;
use crate::registry::write_replace;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Number of entries returned in `recentVisitors`
const RECENT_VISITORS: usize = 20;

/// One proxied request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorEntry {
    pub timestamp: DateTime<Utc>,
    pub slug: String,
    pub ip: String,
    pub user_agent: String,
    pub path: String,
}

/// Coarse device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ["mobile", "android", "iphone"].iter().any(|m| ua.contains(m)) {
            DeviceClass::Mobile
        } else if ["tablet", "ipad"].iter().any(|m| ua.contains(m)) {
            DeviceClass::Tablet
        } else {
            DeviceClass::Desktop
        }
    }
}

/// Analytics for one project over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorStats {
    /// All retained visits for the project
    pub total: usize,
    /// Visits inside the window
    #[serde(rename = "last24h")]
    pub in_window: usize,
    /// Distinct IPs inside the window
    #[serde(rename = "uniqueVisitors24h")]
    pub unique_visitors: usize,
    pub devices: BTreeMap<DeviceClass, usize>,
    /// Newest first
    pub recent_visitors: Vec<VisitorEntry>,
}

impl VisitorStats {
    /// Compute stats for `slug` from `entries` (oldest first)
    pub fn compute(entries: &[VisitorEntry], slug: &str, window: Duration, now: DateTime<Utc>) -> Self {
        let for_slug: Vec<&VisitorEntry> = entries.iter().filter(|v| v.slug == slug).collect();
        let recent: Vec<&VisitorEntry> = for_slug
            .iter()
            .copied()
            .filter(|v| now - v.timestamp < window)
            .collect();

        let mut devices = BTreeMap::new();
        for v in &recent {
            *devices.entry(DeviceClass::from_user_agent(&v.user_agent)).or_insert(0) += 1;
        }

        let unique_visitors = recent.iter().map(|v| v.ip.as_str()).collect::<HashSet<_>>().len();

        let recent_visitors = recent
            .iter()
            .rev()
            .take(RECENT_VISITORS)
            .map(|v| (*v).clone())
            .collect();

        Self {
            total: for_slug.len(),
            in_window: recent.len(),
            unique_visitors,
            devices,
            recent_visitors,
        }
    }
}

/// File-backed visitor log
pub struct VisitorLog {
    path: PathBuf,
    cap: usize,
    write_lock: Mutex<()>,
}

impl VisitorLog {
    pub fn new(path: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            path: path.into(),
            cap: cap.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// All retained entries, oldest first. Missing or corrupt file reads as
    /// empty; elements that are not visitor records are skipped.
    pub async fn entries(&self) -> Vec<VisitorEntry> {
        let raw = self.raw_entries().await;
        let total = raw.len();
        let entries: Vec<VisitorEntry> = raw
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        if entries.len() < total {
            debug!(skipped = total - entries.len(), "Skipped malformed visitor records");
        }
        entries
    }

    /// The stored array as-is, so appends keep records this process cannot parse
    async fn raw_entries(&self) -> Vec<Value> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read visitor log");
                return Vec::new();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Visitor log is not a JSON array, starting fresh");
            Vec::new()
        })
    }

    /// Append one entry, dropping the oldest beyond the cap
    pub async fn append(&self, entry: VisitorEntry) -> Result<(), StoreError> {
        self.append_many(std::iter::once(entry)).await
    }

    /// Append several entries with a single rewrite
    pub async fn append_many<I>(&self, new_entries: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = VisitorEntry>,
    {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.raw_entries().await;
        for entry in new_entries {
            entries.push(serde_json::to_value(entry)?);
        }

        if entries.len() > self.cap {
            let excess = entries.len() - self.cap;
            entries.drain(..excess);
            debug!(dropped = excess, cap = self.cap, "Trimmed visitor log");
        }

        let json = serde_json::to_string_pretty(&entries)?;
        write_replace(&self.path, json.as_bytes()).await?;
        Ok(())
    }

    /// Statistics for `slug` over the trailing `window`
    pub async fn query_by_slug(&self, slug: &str, window: Duration, now: DateTime<Utc>) -> VisitorStats {
        let entries = self.entries().await;
        VisitorStats::compute(&entries, slug, window, now)
    }
}

//! Project registry: the durable slug → deployment descriptor document
//!
//! The registry is read and rewritten as a whole. Writes from this process
//! are serialized through an async mutex; anything outside the process is
//! last-writer-wins.

use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_NEXT_PORT: u32 = 10001;
const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 3600;

/// Whether a project has a backing container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// Served elsewhere, no container; always "active"
    Static,
    /// Backed by a start/stoppable container on a local port
    Dynamic,
    /// Missing or unrecognised `type`; never controlled by the proxy
    Other,
}

impl ProjectKind {
    fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "static" => Some(ProjectKind::Static),
            "dynamic" => Some(ProjectKind::Dynamic),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&'static str> {
        match self {
            ProjectKind::Static => Some("static"),
            ProjectKind::Dynamic => Some("dynamic"),
            ProjectKind::Other => None,
        }
    }
}

/// Global registry settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Idle budget in seconds for projects without their own `idleTimeout`
    pub default_idle_timeout: i64,

    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            extra: Map::new(),
        }
    }
}

impl Settings {
    fn from_fields(mut fields: Map<String, Value>) -> Self {
        let default_idle_timeout =
            take_field(&mut fields, "defaultIdleTimeout", integer_from_value).unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        Self {
            default_idle_timeout,
            extra: fields,
        }
    }

    fn to_fields(&self) -> Map<String, Value> {
        let mut fields = self.extra.clone();
        put_field(
            &mut fields,
            "defaultIdleTimeout",
            Value::from(self.default_idle_timeout),
            self.default_idle_timeout == DEFAULT_IDLE_TIMEOUT_SECS,
        );
        fields
    }
}

/// One deployed project
///
/// Keys this process does not know about, and known keys whose value does
/// not have the expected shape, are kept verbatim in `extra` and written
/// back untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectEntry {
    pub kind: ProjectKind,

    pub port: Option<u16>,

    pub container: Option<String>,

    /// Seconds; `<= 0` disables idle eviction, `None` uses the global default
    pub idle_timeout: Option<i64>,

    pub visitors: u64,

    pub last_access: Option<DateTime<Utc>>,

    pub created: Option<DateTime<Utc>>,

    pub description: Option<String>,

    pub extra: Map<String, Value>,
}

/// Where to send traffic for a dynamic project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTarget {
    pub port: u16,
    pub container: String,
}

impl ProjectEntry {
    /// A dynamic project with no visits yet
    pub fn dynamic(port: u16, container: &str, created: DateTime<Utc>) -> Self {
        Self {
            kind: ProjectKind::Dynamic,
            port: Some(port),
            container: Some(container.to_string()),
            idle_timeout: None,
            visitors: 0,
            last_access: None,
            created: Some(created),
            description: None,
            extra: Map::new(),
        }
    }

    /// A static project
    pub fn static_site(created: DateTime<Utc>) -> Self {
        Self {
            kind: ProjectKind::Static,
            port: None,
            container: None,
            idle_timeout: None,
            visitors: 0,
            last_access: None,
            created: Some(created),
            description: None,
            extra: Map::new(),
        }
    }

    /// Set the idle timeout (builder pattern)
    pub fn with_idle_timeout(mut self, secs: i64) -> Self {
        self.idle_timeout = Some(secs);
        self
    }

    /// Set the last access time (builder pattern)
    pub fn with_last_access(mut self, at: DateTime<Utc>) -> Self {
        self.last_access = Some(at);
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind == ProjectKind::Dynamic
    }

    /// Port and container of a dynamic project, if it has both
    pub fn dynamic_target(&self) -> Option<DynamicTarget> {
        if !self.is_dynamic() {
            return None;
        }
        match (self.port, self.container.as_deref()) {
            (Some(port), Some(container)) if !container.is_empty() => Some(DynamicTarget {
                port,
                container: container.to_string(),
            }),
            _ => None,
        }
    }

    pub fn effective_idle_timeout(&self, settings: &Settings) -> i64 {
        self.idle_timeout.unwrap_or(settings.default_idle_timeout)
    }

    /// The instant the idle clock counts from
    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.last_access.or(self.created)
    }

    fn from_fields(mut fields: Map<String, Value>) -> Self {
        Self {
            kind: take_field(&mut fields, "type", ProjectKind::from_value).unwrap_or(ProjectKind::Other),
            port: take_field(&mut fields, "port", |v| integer_from_value(v).and_then(|n| u16::try_from(n).ok())),
            container: take_field(&mut fields, "container", string_from_value),
            idle_timeout: take_field(&mut fields, "idleTimeout", integer_from_value),
            visitors: take_field(&mut fields, "visitors", |v| {
                integer_from_value(v).and_then(|n| u64::try_from(n).ok())
            })
            .unwrap_or(0),
            last_access: take_field(&mut fields, "lastAccess", timestamp_from_value),
            created: take_field(&mut fields, "created", timestamp_from_value),
            description: take_field(&mut fields, "description", string_from_value),
            extra: fields,
        }
    }

    fn to_fields(&self) -> Map<String, Value> {
        let mut fields = self.extra.clone();
        if let Some(kind) = self.kind.as_str() {
            fields.insert("type".to_string(), Value::from(kind));
        }
        if let Some(port) = self.port {
            fields.insert("port".to_string(), Value::from(port));
        }
        if let Some(container) = &self.container {
            fields.insert("container".to_string(), Value::from(container.as_str()));
        }
        if let Some(idle_timeout) = self.idle_timeout {
            fields.insert("idleTimeout".to_string(), Value::from(idle_timeout));
        }
        put_field(&mut fields, "visitors", Value::from(self.visitors), self.visitors == 0);
        if let Some(last_access) = self.last_access {
            fields.insert("lastAccess".to_string(), timestamp_to_value(last_access));
        }
        if let Some(created) = self.created {
            fields.insert("created".to_string(), timestamp_to_value(created));
        }
        if let Some(description) = &self.description {
            fields.insert("description".to_string(), Value::from(description.as_str()));
        }
        fields
    }
}

impl Serialize for ProjectEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_fields().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProjectEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::deserialize(deserializer)?;
        Ok(Self::from_fields(fields))
    }
}

impl Serialize for Settings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_fields().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::deserialize(deserializer)?;
        Ok(Self::from_fields(fields))
    }
}

/// Root registry document
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    pub projects: BTreeMap<String, ProjectEntry>,

    pub next_port: u32,

    pub settings: Settings,

    /// Project values that are not JSON objects, written back as found
    pub unparsed_projects: Map<String, Value>,

    pub extra: Map<String, Value>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            projects: BTreeMap::new(),
            next_port: DEFAULT_NEXT_PORT,
            settings: Settings::default(),
            unparsed_projects: Map::new(),
            extra: Map::new(),
        }
    }
}

impl Registry {
    pub fn project(&self, slug: &str) -> Option<&ProjectEntry> {
        self.projects.get(slug)
    }

    /// Build a registry from any JSON value.
    ///
    /// Only a non-object root or a non-object `projects` is rejected; every
    /// other oddity is tolerated per field.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err("registry root is not a JSON object".to_string());
        };

        let mut projects = BTreeMap::new();
        let mut unparsed_projects = Map::new();
        match fields.remove("projects") {
            None | Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                for (slug, entry) in entries {
                    match entry {
                        Value::Object(entry) => {
                            projects.insert(slug, ProjectEntry::from_fields(entry));
                        }
                        other => {
                            unparsed_projects.insert(slug, other);
                        }
                    }
                }
            }
            Some(_) => return Err("`projects` is not a JSON object".to_string()),
        }

        let next_port = take_field(&mut fields, "nextPort", |v| {
            integer_from_value(v).and_then(|n| u32::try_from(n).ok())
        })
        .unwrap_or(DEFAULT_NEXT_PORT);

        let settings = take_field(&mut fields, "settings", |v| match v {
            Value::Object(settings) => Some(Settings::from_fields(settings.clone())),
            _ => None,
        })
        .unwrap_or_default();

        Ok(Self {
            projects,
            next_port,
            settings,
            unparsed_projects,
            extra: fields,
        })
    }

    fn to_fields(&self) -> Map<String, Value> {
        let mut projects = self.unparsed_projects.clone();
        for (slug, entry) in &self.projects {
            projects.insert(slug.clone(), Value::Object(entry.to_fields()));
        }

        let mut fields = self.extra.clone();
        fields.insert("projects".to_string(), Value::Object(projects));
        put_field(
            &mut fields,
            "nextPort",
            Value::from(self.next_port),
            self.next_port == DEFAULT_NEXT_PORT,
        );
        put_field(
            &mut fields,
            "settings",
            Value::Object(self.settings.to_fields()),
            self.settings == Settings::default(),
        );
        fields
    }
}

impl Serialize for Registry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_fields().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Registry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::from_value(Value::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// Remove `key` and convert it. A value that does not convert goes back
/// into `fields` so it is written out unchanged.
fn take_field<T>(fields: &mut Map<String, Value>, key: &str, convert: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
    let value = fields.remove(key)?;
    let converted = convert(&value);
    if converted.is_none() {
        fields.insert(key.to_string(), value);
    }
    converted
}

/// Insert a typed value, unless it is only a placeholder default and the
/// original unconverted value is still held under `key`.
fn put_field(fields: &mut Map<String, Value>, key: &str, value: Value, is_default: bool) {
    if is_default && fields.contains_key(key) {
        return;
    }
    fields.insert(key.to_string(), value);
}

/// Integer from a JSON number (fractions truncated) or a numeric string
pub(crate) fn integer_from_value(value: &Value) -> Option<i64> {
    let from_float = |f: f64| Some(f).filter(|f| f.is_finite()).map(|f| f as i64);
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(from_float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(from_float))
        }
        _ => None,
    }
}

fn string_from_value(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// RFC 3339 timestamps only; anything else (including `""`) is unset
fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.as_str()?.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn timestamp_to_value(at: DateTime<Utc>) -> Value {
    Value::from(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Why a default registry was substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultReason {
    /// No file on disk yet
    Missing,
    /// File exists but could not be read or parsed
    Corrupt(String),
}

/// Result of reading the registry file
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryLoad {
    Loaded(Registry),
    Defaulted {
        reason: DefaultReason,
        registry: Registry,
    },
}

impl RegistryLoad {
    pub fn into_registry(self) -> Registry {
        match self {
            RegistryLoad::Loaded(registry) => registry,
            RegistryLoad::Defaulted { registry, .. } => registry,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, RegistryLoad::Defaulted { .. })
    }
}

/// Fields of a project the management API may change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub idle_timeout: Option<i64>,
    /// `Some(None)` clears the description
    pub description: Option<Option<String>>,
}

/// File-backed registry access
pub struct RegistryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the registry, substituting the empty default on failure
    pub async fn read(&self) -> RegistryLoad {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registry file not found, using empty registry");
                return RegistryLoad::Defaulted {
                    reason: DefaultReason::Missing,
                    registry: Registry::default(),
                };
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read registry, using empty registry");
                return RegistryLoad::Defaulted {
                    reason: DefaultReason::Corrupt(e.to_string()),
                    registry: Registry::default(),
                };
            }
        };

        match serde_json::from_str::<Registry>(&content) {
            Ok(registry) => RegistryLoad::Loaded(registry),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Registry is not a JSON document, using empty registry");
                RegistryLoad::Defaulted {
                    reason: DefaultReason::Corrupt(e.to_string()),
                    registry: Registry::default(),
                }
            }
        }
    }

    /// Shorthand for `read().await.into_registry()`
    pub async fn load(&self) -> Registry {
        self.read().await.into_registry()
    }

    /// Persist the whole document, replacing the previous version
    pub async fn write(&self, registry: &Registry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_unlocked(registry).await
    }

    async fn write_unlocked(&self, registry: &Registry) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(registry)?;
        write_replace(&self.path, json.as_bytes()).await?;
        Ok(())
    }

    /// Read-modify-write under the in-process write lock.
    ///
    /// `f` returns `None` to skip the write. A file that exists but cannot be
    /// parsed is never overwritten.
    pub async fn update<T, F>(&self, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut Registry) -> Option<T>,
    {
        let _guard = self.write_lock.lock().await;
        let mut registry = match self.read().await {
            RegistryLoad::Defaulted {
                reason: DefaultReason::Corrupt(message),
                ..
            } => return Err(StoreError::Unreadable(message)),
            load => load.into_registry(),
        };
        let Some(result) = f(&mut registry) else {
            return Ok(None);
        };
        self.write_unlocked(&registry).await?;
        Ok(Some(result))
    }

    /// Count a proxied request against `slug`. Returns false if the slug is unknown.
    pub async fn record_access(&self, slug: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = self
            .update(|registry| {
                let project = registry.projects.get_mut(slug)?;
                project.visitors += 1;
                // never move the clock backwards
                if project.last_access.map_or(true, |prev| prev < now) {
                    project.last_access = Some(now);
                }
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn set_default_idle_timeout(&self, secs: i64) -> Result<Settings, StoreError> {
        let settings = self
            .update(|registry| {
                registry.settings.default_idle_timeout = secs;
                registry.settings.extra.remove("defaultIdleTimeout");
                // a non-object `settings` is held here until replaced
                registry.extra.remove("settings");
                Some(registry.settings.clone())
            })
            .await?;
        Ok(settings.unwrap_or_default())
    }

    /// Apply `patch` to `slug`; `None` if the project does not exist
    pub async fn patch_project(
        &self,
        slug: &str,
        patch: ProjectPatch,
    ) -> Result<Option<ProjectEntry>, StoreError> {
        self.update(|registry| {
            let project = registry.projects.get_mut(slug)?;
            if let Some(idle_timeout) = patch.idle_timeout {
                project.idle_timeout = Some(idle_timeout);
            }
            match patch.description {
                Some(Some(description)) => project.description = Some(description),
                Some(None) => {
                    project.description = None;
                    project.extra.insert("description".to_string(), Value::Null);
                }
                None => {}
            }
            Some(project.clone())
        })
        .await
    }
}

/// Write to a sibling temp file then rename over `path`, so concurrent
/// readers never observe a half-written document.
pub(crate) async fn write_replace(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

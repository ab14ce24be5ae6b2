//! State Store (C1): per-operation JSON state at
//! `<build_dir>/operations/<name>/state.json`, with an append-only,
//! size-rotated event log alongside it.
//!
//! Field-level `read`/`update`/`bulk_update` operate on an untyped
//! `serde_json::Map` so a caller does not need the full `Operation` schema
//! to touch one field; `load`/`save` operate on the typed `Operation` for
//! callers (the phase state machine, mostly) that want the whole record.
//! Every write goes through [`crate::atomic::atomic_write`] so a reader
//! never observes a torn file.

use crate::atomic::atomic_write;
use crate::events;
use crate::types::{Operation, CURRENT_SCHEMA_VERSION};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state.json for {operation}: {source}")]
    Malformed {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Event(#[from] events::EventLogError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Legacy schema-0 field, superseded by dependency tracking in the
/// external issue tracker (see `v0d::dependency`). Callers that care are
/// notified via [`StateStore::load_with_migration`]'s `on_legacy_after`.
const LEGACY_AFTER_FIELD: &str = "after";

#[derive(Debug, Clone)]
pub struct StateStore {
    build_dir: PathBuf,
    events_max_bytes: u64,
    events_rotate_keep: u32,
}

impl StateStore {
    pub fn new(build_dir: impl Into<PathBuf>, events_max_bytes: u64, events_rotate_keep: u32) -> Self {
        Self {
            build_dir: build_dir.into(),
            events_max_bytes,
            events_rotate_keep,
        }
    }

    pub fn operation_dir(&self, name: &str) -> PathBuf {
        self.build_dir.join("operations").join(name)
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.operation_dir(name).join("state.json")
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state_path(name).exists()
    }

    /// List operation names known to this store (directories under
    /// `operations/` that carry a `state.json`).
    pub fn list_names(&self) -> Result<Vec<String>> {
        let dir = self.build_dir.join("operations");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            if entry.path().join("state.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_map(&self, name: &str) -> Result<Map<String, Value>> {
        let path = self.state_path(name);
        if !path.exists() {
            return Err(StateError::NotFound(name.to_string()));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let value: Value =
            serde_json::from_str(&content).map_err(|e| StateError::Malformed {
                operation: name.to_string(),
                source: e,
            })?;
        Ok(value.as_object().cloned().unwrap_or_default())
    }

    fn write_map(&self, name: &str, map: &Map<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map).expect("Map<String, Value> always serializes");
        atomic_write(&self.operation_dir(name), "state.json", &bytes)
            .map_err(|e| io_err(&self.operation_dir(name), e))
    }

    /// Create a brand-new operation's `state.json`. Fails if one already
    /// exists at this name.
    pub fn create(&self, op: &Operation) -> Result<()> {
        let path = self.state_path(&op.name);
        if path.exists() {
            return Err(StateError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "operation already exists"),
            });
        }
        let value = serde_json::to_value(op).expect("Operation always serializes");
        let map = value.as_object().cloned().unwrap_or_default();
        self.write_map(&op.name, &map)
    }

    /// Read a single field's raw JSON value.
    pub fn read(&self, name: &str, field: &str) -> Result<Option<Value>> {
        let map = self.read_map(name)?;
        Ok(map.get(field).cloned())
    }

    /// Read several fields in a single pass.
    pub fn read_fields(&self, name: &str, fields: &[&str]) -> Result<Vec<Option<Value>>> {
        let map = self.read_map(name)?;
        Ok(fields.iter().map(|f| map.get(*f).cloned()).collect())
    }

    /// Set a single field, leaving the rest of the document untouched.
    pub fn update(&self, name: &str, field: &str, value: Value) -> Result<()> {
        self.bulk_update(name, &[(field, value)])
    }

    /// Apply every `(field, value)` pair atomically: a single
    /// read-modify-write-rename cycle, so a reader never sees some fields
    /// updated and others not.
    pub fn bulk_update(&self, name: &str, fields: &[(&str, Value)]) -> Result<()> {
        let mut map = self.read_map(name)?;
        for (field, value) in fields {
            map.insert((*field).to_string(), value.clone());
        }
        self.write_map(name, &map)
    }

    pub fn get_schema_version(&self, name: &str) -> Result<u32> {
        match self.read(name, "_schema_version")? {
            Some(v) => Ok(v.as_u64().unwrap_or(0) as u32),
            None => Ok(0),
        }
    }

    /// Load the typed `Operation`, migrating on disk first if its schema
    /// version is behind current. `on_legacy_after` is invoked with
    /// `(operation_name, after_value)` when a schema-0 `after` field is
    /// found, so a caller that owns the issue tracker (C7) can record the
    /// dependency there before the field is dropped.
    pub fn load_with_migration(
        &self,
        name: &str,
        on_legacy_after: Option<&dyn Fn(&str, &str)>,
    ) -> Result<Operation> {
        let version = self.get_schema_version(name)?;
        if version < CURRENT_SCHEMA_VERSION {
            self.migrate(name, version, on_legacy_after)?;
        }
        self.load(name)
    }

    /// Run schema migrations from `from_version` up to
    /// [`CURRENT_SCHEMA_VERSION`], one step at a time, each rewriting the
    /// file and recording a `schema:migrated` event. Idempotent: a file
    /// already at current version is untouched.
    fn migrate(
        &self,
        name: &str,
        from_version: u32,
        on_legacy_after: Option<&dyn Fn(&str, &str)>,
    ) -> Result<()> {
        let mut version = from_version;
        while version < CURRENT_SCHEMA_VERSION {
            match version {
                0 => self.migrate_v0_to_v1(name, on_legacy_after)?,
                other => {
                    // No migration defined past this point; stop rather than
                    // silently skip a schema version.
                    tracing::warn!(operation = name, from = other, "no migration defined; leaving schema_version as-is");
                    return Ok(());
                }
            }
            version += 1;
        }
        Ok(())
    }

    /// Schema 0 -> 1: drop the legacy `after` field (a same-process
    /// dependency pointer) in favor of tracking the dependency in the
    /// external issue tracker. The actual tracker write is the caller's
    /// responsibility via `on_legacy_after`; this step only rewrites the
    /// file and records the version bump.
    fn migrate_v0_to_v1(&self, name: &str, on_legacy_after: Option<&dyn Fn(&str, &str)>) -> Result<()> {
        let mut map = self.read_map(name)?;
        if let Some(Value::String(after)) = map.remove(LEGACY_AFTER_FIELD) {
            if let Some(hook) = on_legacy_after {
                hook(name, &after);
            }
        }
        map.insert("_schema_version".to_string(), Value::from(1u32));
        self.write_map(name, &map)?;
        self.emit_event(name, "schema:migrated", "0 -> 1: dropped legacy after field")?;
        Ok(())
    }

    /// Load the typed `Operation` without checking for pending migrations.
    /// Prefer [`Self::load_with_migration`] unless the caller already
    /// knows the schema is current.
    pub fn load(&self, name: &str) -> Result<Operation> {
        let map = self.read_map(name)?;
        serde_json::from_value(Value::Object(map)).map_err(|e| StateError::Malformed {
            operation: name.to_string(),
            source: e,
        })
    }

    /// Persist the full typed `Operation`, preserving any unknown fields
    /// already on disk (migrations are additive, never lossy).
    pub fn save(&self, op: &Operation) -> Result<()> {
        let mut map = self.read_map(&op.name).unwrap_or_default();
        let value = serde_json::to_value(op).expect("Operation always serializes");
        if let Value::Object(new_fields) = value {
            map.extend(new_fields);
        }
        self.write_map(&op.name, &map)
    }

    /// Append an event to this operation's `events.log`, rotating first if
    /// the file is already over the configured threshold.
    pub fn emit_event(&self, name: &str, kind: &str, detail: &str) -> Result<()> {
        events::emit_event(
            &self.operation_dir(name),
            kind,
            detail,
            self.events_max_bytes,
            self.events_rotate_keep,
        )?;
        Ok(())
    }

    /// Read the current (non-rotated) `events.log` lines, for diagnostics
    /// and tests.
    pub fn read_events(&self, name: &str) -> Result<Vec<String>> {
        events::read_current(&self.operation_dir(name)).map_err(|e| io_err(&self.operation_dir(name), e))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

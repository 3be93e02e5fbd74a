/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Declarative object API consumed by the controllers.
//!
//! [`ObjectApi`] is the platform boundary: JSON documents keyed by kind,
//! namespace and name, with compare-and-swap updates on
//! `metadata.resourceVersion` and a broadcast watch. [`InMemoryApi`] provides
//! the platform semantics the controllers depend on (server-assigned
//! identity, finalizers, owner-reference garbage collection) without a
//! cluster. [`Client`] layers typed access on top.

use crate::sandboxd::clock::{Clock, SystemClock};
use crate::sandboxd::k8s::pod::ObjectMeta;
use rand::{rngs::OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    SandboxTemplate,
    SandboxWarmPool,
    Sandbox,
    SandboxClaim,
    Pod,
    Service,
    NetworkPolicy,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::SandboxTemplate,
        ResourceKind::SandboxWarmPool,
        ResourceKind::Sandbox,
        ResourceKind::SandboxClaim,
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::NetworkPolicy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::SandboxTemplate => "SandboxTemplate",
            ResourceKind::SandboxWarmPool => "SandboxWarmPool",
            ResourceKind::Sandbox => "Sandbox",
            ResourceKind::SandboxClaim => "SandboxClaim",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored entity with typed access to its metadata.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

#[derive(Debug)]
pub enum StoreError {
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    Conflict {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    Invalid(String),
    Unavailable(String),
    Serialization(serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound {
                kind,
                namespace,
                name,
            } => write!(f, "{kind} {namespace}/{name} not found"),
            StoreError::AlreadyExists {
                kind,
                namespace,
                name,
            } => write!(f, "{kind} {namespace}/{name} already exists"),
            StoreError::Conflict {
                kind,
                namespace,
                name,
            } => write!(
                f,
                "{kind} {namespace}/{name} was modified; resourceVersion is stale"
            ),
            StoreError::Invalid(msg) => write!(f, "invalid object: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "object store unavailable: {msg}"),
            StoreError::Serialization(err) => write!(f, "object encoding failed: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification delivered to watchers.
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub event_type: WatchEventType,
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub object: Value,
    pub resource_version: u64,
}

impl StoreEvent {
    pub fn decode<T: Resource>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.object.clone())?)
    }
}

/// Identity and version a delete must still match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    /// Pins the delete to the exact object version that was observed.
    pub fn observed(meta: &ObjectMeta) -> Self {
        Self {
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
        }
    }

    fn admits(&self, meta: &ObjectMeta) -> bool {
        let uid_matches = self.uid.is_none() || self.uid == meta.uid;
        let version_matches =
            self.resource_version.is_none() || self.resource_version == meta.resource_version;
        uid_matches && version_matches
    }
}

/// Object-safe platform API.
pub trait ObjectApi: Send + Sync {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value, StoreError>;

    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<Value>, StoreError>;

    fn create(&self, kind: ResourceKind, object: Value) -> Result<Value, StoreError>;

    /// Replaces the object if `metadata.resourceVersion` matches the stored one.
    fn update(&self, kind: ResourceKind, object: Value) -> Result<Value, StoreError>;

    /// Deletes the object, failing with a conflict if `preconditions` no
    /// longer describe the stored object.
    fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn not_found(&self) -> StoreError {
        StoreError::NotFound {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

struct StoreState {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
}

impl StoreState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// Single-process stand-in for the platform's object store.
pub struct InMemoryApi {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                objects: BTreeMap::new(),
                last_version: 0,
            }),
            events,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, event_type: WatchEventType, key: &ObjectKey, object: Value, version: u64) {
        // No subscribers is not an error.
        let _ = self.events.send(StoreEvent {
            event_type,
            kind: key.kind,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            object,
            resource_version: version,
        });
    }

    /// Removes `key` and garbage-collects every object owned by it.
    fn remove_locked(&self, state: &mut StoreState, key: &ObjectKey) -> Result<(), StoreError> {
        let Some(object) = state.objects.remove(key) else {
            return Ok(());
        };
        let version = state.next_version();
        let meta = read_meta(&object)?;
        self.publish(WatchEventType::Deleted, key, object, version);

        let Some(uid) = meta.uid else {
            return Ok(());
        };
        let dependents: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(candidate, _)| candidate.namespace == key.namespace)
            .filter(|(_, value)| {
                read_meta(value)
                    .map(|m| m.owner_references.iter().any(|owner| owner.uid == uid))
                    .unwrap_or(false)
            })
            .map(|(candidate, _)| candidate.clone())
            .collect();

        for dependent in dependents {
            match self.delete_locked(state, &dependent, &Preconditions::default()) {
                Err(err) if err.is_not_found() => {}
                other => other?,
            }
        }
        Ok(())
    }

    fn delete_locked(
        &self,
        state: &mut StoreState,
        key: &ObjectKey,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError> {
        let Some(object) = state.objects.get(key).cloned() else {
            return Err(key.not_found());
        };
        let mut meta = read_meta(&object)?;
        if !preconditions.admits(&meta) {
            return Err(StoreError::Conflict {
                kind: key.kind,
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            });
        }
        if meta.finalizers.is_empty() {
            return self.remove_locked(state, key);
        }
        if meta.deletion_timestamp.is_some() {
            return Ok(());
        }

        let version = state.next_version();
        meta.deletion_timestamp = Some(self.clock.now());
        meta.resource_version = Some(version.to_string());
        let mut object = object;
        write_meta(&mut object, &meta)?;
        state.objects.insert(key.clone(), object.clone());
        self.publish(WatchEventType::Modified, key, object, version);
        Ok(())
    }
}

impl Default for InMemoryApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectApi for InMemoryApi {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value, StoreError> {
        let key = ObjectKey::new(kind, namespace, name);
        let state = self.lock();
        state.objects.get(&key).cloned().ok_or_else(|| key.not_found())
    }

    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, value)| value.clone())
            .collect())
    }

    fn create(&self, kind: ResourceKind, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = read_meta(&object)?;
        if meta.name.is_empty() {
            return Err(StoreError::Invalid(format!("{kind} requires metadata.name")));
        }
        let key = ObjectKey::new(kind, &meta.namespace, &meta.name);

        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind,
                namespace: key.namespace,
                name: key.name,
            });
        }

        let version = state.next_version();
        meta.uid = Some(generate_uid());
        meta.creation_timestamp = Some(self.clock.now());
        meta.deletion_timestamp = None;
        meta.generation = Some(1);
        meta.resource_version = Some(version.to_string());
        write_meta(&mut object, &meta)?;

        state.objects.insert(key.clone(), object.clone());
        self.publish(WatchEventType::Added, &key, object.clone(), version);
        Ok(object)
    }

    fn update(&self, kind: ResourceKind, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = read_meta(&object)?;
        let key = ObjectKey::new(kind, &meta.namespace, &meta.name);

        let mut state = self.lock();
        let stored = state.objects.get(&key).cloned().ok_or_else(|| key.not_found())?;
        let stored_meta = read_meta(&stored)?;

        let Some(expected) = meta.resource_version.as_deref() else {
            return Err(StoreError::Invalid(format!(
                "{kind} {}/{} update requires metadata.resourceVersion",
                key.namespace, key.name
            )));
        };
        if stored_meta.resource_version.as_deref() != Some(expected) {
            return Err(StoreError::Conflict {
                kind,
                namespace: key.namespace,
                name: key.name,
            });
        }

        let generation = stored_meta.generation.unwrap_or(1);
        meta.generation = Some(if object.get("spec") != stored.get("spec") {
            generation + 1
        } else {
            generation
        });
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;

        let version = state.next_version();
        meta.resource_version = Some(version.to_string());
        write_meta(&mut object, &meta)?;

        if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
            state.objects.insert(key.clone(), object.clone());
            self.remove_locked(&mut state, &key)?;
            return Ok(object);
        }

        state.objects.insert(key.clone(), object.clone());
        self.publish(WatchEventType::Modified, &key, object.clone(), version);
        Ok(object)
    }

    fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError> {
        let key = ObjectKey::new(kind, namespace, name);
        let mut state = self.lock();
        self.delete_locked(&mut state, &key, preconditions)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn read_meta(object: &Value) -> Result<ObjectMeta, StoreError> {
    let meta = object
        .get("metadata")
        .cloned()
        .ok_or_else(|| StoreError::Invalid("object has no metadata".to_string()))?;
    Ok(serde_json::from_value(meta)?)
}

fn write_meta(object: &mut Value, meta: &ObjectMeta) -> Result<(), StoreError> {
    let Value::Object(map) = object else {
        return Err(StoreError::Invalid("object is not a JSON map".to_string()));
    };
    map.insert("metadata".to_string(), serde_json::to_value(meta)?);
    Ok(())
}

fn generate_uid() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Typed handle over an [`ObjectApi`].
#[derive(Clone)]
pub struct Client {
    api: Arc<dyn ObjectApi>,
}

impl Client {
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    pub fn get<T: Resource>(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let value = self.api.get(T::KIND, namespace, name)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn get_opt<T: Resource>(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        match self.get::<T>(namespace, name) {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        self.api
            .list(T::KIND, namespace)?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    pub fn create<T: Resource>(&self, object: &T) -> Result<T, StoreError> {
        let created = self.api.create(T::KIND, serde_json::to_value(object)?)?;
        Ok(serde_json::from_value(created)?)
    }

    pub fn update<T: Resource>(&self, object: &T) -> Result<T, StoreError> {
        let updated = self.api.update(T::KIND, serde_json::to_value(object)?)?;
        Ok(serde_json::from_value(updated)?)
    }

    pub fn delete<T: Resource>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api.delete(T::KIND, namespace, name, &Preconditions::default())
    }

    /// Deletes `object` only if the stored copy is still the observed version.
    pub fn delete_observed<T: Resource>(&self, object: &T) -> Result<(), StoreError> {
        let meta = object.metadata();
        self.api.delete(
            T::KIND,
            &meta.namespace,
            &meta.name,
            &Preconditions::observed(meta),
        )
    }

    pub fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.api.watch()
    }
}

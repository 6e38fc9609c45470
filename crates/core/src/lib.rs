//! Vigil core types: object identity, cached objects, change notifications and
//! the contracts the reconciliation engine expects from its collaborators.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod object;

pub use object::CachedObject;

pub mod prelude {
    pub use super::{
        CachedObject, Delta, KeyError, Notification, ObjectCache, ObjectError, ObjectKey, ObjectWriter, WriteError,
    };
}

/// Identity of a watched object: `(namespace, name)`. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Format(String),
    #[error("empty name in key: {0:?}")]
    EmptyName(String),
    #[error("empty namespace in key: {0:?}")]
    EmptyNamespace(String),
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn cluster(name: &str) -> Self { Self::new(None, name) }

    /// Split a work-item key (`ns/name` or `name`) back into an identity.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if name.is_empty() => Err(KeyError::EmptyName(key.to_string())),
            [name] => Ok(Self::cluster(name)),
            [ns, _] if ns.is_empty() => Err(KeyError::EmptyNamespace(key.to_string())),
            [_, name] if name.is_empty() => Err(KeyError::EmptyName(key.to_string())),
            [ns, name] => Ok(Self::namespaced(ns, name)),
            _ => Err(KeyError::Format(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Errors turning a raw object into a [`CachedObject`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("object missing metadata")]
    MissingMetadata,
    #[error("object missing metadata.name")]
    MissingName,
    #[error("metadata.{0} is not a string map")]
    BadMap(&'static str),
}

/// Input to the mirrored cache, produced by the change stream.
#[derive(Debug, Clone)]
pub enum Delta {
    Applied(CachedObject),
    Deleted(CachedObject),
    /// Full relisting (initial list or watch restart). Replaces the cache contents.
    Replaced(Vec<CachedObject>),
}

/// Change notification emitted by the mirrored cache after a delta has been applied.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Arc<CachedObject>),
    Updated { old: Arc<CachedObject>, new: Arc<CachedObject> },
    Deleted(Arc<CachedObject>),
}

impl Notification {
    /// The object the notification is about (the new state for updates).
    pub fn object(&self) -> &CachedObject {
        match self {
            Notification::Added(o) | Notification::Deleted(o) => o.as_ref(),
            Notification::Updated { new, .. } => new.as_ref(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Notification::Added(_) => "add",
            Notification::Updated { .. } => "update",
            Notification::Deleted(_) => "delete",
        }
    }
}

/// Read side of the mirrored cache.
pub trait ObjectCache: Send + Sync {
    /// Point lookup; `None` means the object is not (or no longer) known.
    fn get(&self, key: &ObjectKey) -> Option<Arc<CachedObject>>;
    /// True once the initial listing has been applied.
    fn is_synced(&self) -> bool;
}

/// Failure of an optimistic-concurrency write against the remote API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The object changed since the version the write was based on.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The server rejected the object itself; retrying the same write cannot succeed.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transient: {0}")]
    Transient(String),
}

/// Write side of the remote API.
#[async_trait::async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Replace the object, conditional on `obj.resource_version` still being current.
    /// Returns the object as stored by the server.
    async fn update(&self, obj: &CachedObject) -> Result<CachedObject, WriteError>;
}

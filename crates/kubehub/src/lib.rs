//! Shadow kubehub: the managed object store and type resolution seams, with
//! kube-rs backed implementations and in-memory ones for tests.

#![forbid(unsafe_code)]

use anyhow::Result;
use futures::stream::BoxStream;
use kube::Client;
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use shadow_core::{ObjectType, StoreError};

mod client;
mod memory;
mod resolver;

pub use client::{DiscoveryResolver, KubeObjectStore};
pub use memory::{MemoryObjectStore, OpKind, OpRecord};
pub use resolver::StaticResolver;

/// Raw change notification from a store watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object created or modified.
    Applied(Json),
    /// Object removed; carries its last known state.
    Deleted(Json),
    /// Full relist of the watched type.
    Restarted(Vec<Json>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Field ownership of a write: the manager it is attributed to, and whether
/// an apply takes over fields owned by other managers instead of conflicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOpts<'a> {
    pub field_manager: &'a str,
    pub force: bool,
}

impl<'a> WriteOpts<'a> {
    pub fn manager(field_manager: &'a str) -> Self {
        Self { field_manager, force: false }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Get/list/patch/delete/watch over untyped objects, addressed by
/// (type, namespace, name). Cluster-scoped objects use an empty namespace.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<Json, StoreError>;

    async fn get_opt(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<Option<Json>, StoreError> {
        match self.get(ty, namespace, name).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List objects of `ty`; `None` lists across all namespaces.
    async fn list(&self, ty: &ObjectType, namespace: Option<&str>) -> Result<Vec<Json>, StoreError>;

    async fn delete(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Server-side apply: creates or updates, attributing the payload's fields
    /// to `opts.field_manager`. Without `force`, setting a field another
    /// manager owns to a different value is a [`StoreError::Conflict`].
    async fn apply(
        &self,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: &Json,
        opts: WriteOpts<'_>,
    ) -> Result<Json, StoreError>;

    /// JSON merge patch on an existing object. `opts.force` is ignored.
    async fn merge(
        &self,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: &Json,
        opts: WriteOpts<'_>,
    ) -> Result<Json, StoreError>;

    /// Long-lived watch over all namespaces for `ty`.
    fn watch(&self, ty: &ObjectType) -> WatchStream;
}

/// Maps a group/version/kind to its served resource collection.
pub trait TypeResolver: Send + Sync {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Option<ObjectType>;
}

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client, created from the default kubeconfig/in-cluster config on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await?;
    let _ = CLIENT.set(client.clone());
    Ok(CLIENT.get().cloned().unwrap_or(client))
}

/// Drop `metadata.managedFields` in place.
pub fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub(crate) fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

use std::sync::Arc;

use metrics::counter;
use serde_json::Value as Json;
use shadow_core::{ObjectType, OwnerMeta, StoreError, DELETED_STATUS, FIELD_MANAGER};
use shadow_kubehub::{ObjectStore, WriteOpts};
use shadow_schema::StatusPaths;
use tracing::{debug, error, info};

use crate::ObjectEvent;

/// Copies the status of a linked component onto its owner's record.
///
/// Status paths are chosen by the watched kind, never by the snapshot's own
/// `kind` field: objects delivered by a relist often carry none.
#[derive(Clone)]
pub struct StatusPropagator {
    store: Arc<dyn ObjectStore>,
    paths: Arc<StatusPaths>,
    record_type: ObjectType,
    field_manager: String,
}

impl StatusPropagator {
    pub fn new(store: Arc<dyn ObjectStore>, paths: Arc<StatusPaths>, record_type: ObjectType) -> Self {
        Self { store, paths, record_type, field_manager: FIELD_MANAGER.to_string() }
    }

    /// Manager the record status patches are attributed to.
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn field_manager(&self) -> &str { &self.field_manager }

    /// Owner named by the back-reference annotation, plus the status of `obj` read as a `kind`.
    pub fn extract(&self, kind: &str, obj: &Json) -> (Option<OwnerMeta>, String) {
        (shadow_apply::read_back_reference(obj), self.paths.status_of(kind, obj))
    }

    /// Creation is reconciled synchronously by the composite store.
    pub fn on_add(&self, _obj: &Json) {}

    /// Patch the owner's status when it changed. Returns whether a patch was sent.
    pub async fn on_update(&self, kind: &str, old: &Json, new: &Json) -> Result<bool, StoreError> {
        let (Some(owner), old_status) = self.extract(kind, old) else { return Ok(false) };
        let (_, new_status) = self.extract(kind, new);
        if old_status == new_status {
            return Ok(false);
        }
        info!(ns = %owner.namespace, owner = %owner.name, from = %old_status, to = %new_status, "component status changed");
        self.patch_status(&owner, &new_status).await?;
        Ok(true)
    }

    /// Mark the owner's record as deleted when its linked component goes away.
    pub async fn on_delete(&self, kind: &str, obj: &Json) -> Result<bool, StoreError> {
        let (Some(owner), _) = self.extract(kind, obj) else { return Ok(false) };
        info!(ns = %owner.namespace, owner = %owner.name, "linked component deleted");
        self.patch_status(&owner, DELETED_STATUS).await?;
        Ok(true)
    }

    /// Dispatch one informer event for an object of `kind`; failures are logged, never returned.
    pub async fn handle(&self, kind: &str, ev: &ObjectEvent) {
        let res = match ev {
            ObjectEvent::Added(obj) => {
                self.on_add(obj);
                Ok(false)
            }
            ObjectEvent::Updated { old, new } => self.on_update(kind, old, new).await,
            ObjectEvent::Deleted(obj) => self.on_delete(kind, obj).await,
        };
        if let Err(e) = res {
            counter!("shadow_status_patch_err", 1u64);
            error!(kind, error = %e, "status propagation failed");
        }
    }

    async fn patch_status(&self, owner: &OwnerMeta, status: &str) -> Result<(), StoreError> {
        let body = serde_json::json!({ "spec": { "status": status } });
        self.store
            .merge(&self.record_type, &owner.namespace, &owner.name, &body, WriteOpts::manager(&self.field_manager))
            .await?;
        counter!("shadow_status_patch_ok", 1u64);
        debug!(owner = %owner.name, ns = %owner.namespace, status = %status, "record status patched");
        Ok(())
    }
}

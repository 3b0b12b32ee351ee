//! Shadow registry: one long-lived watch per component type, feeding status
//! changes of linked components back onto their owners' records.
//!
//! Only the first component of a shadow resource carries the owner
//! back-reference, so the aggregated status of a shadow resource is the
//! status of its first declared component, and bootstrap only watches the
//! type of each record's first component.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashSet;
use shadow_core::{ObjectType, PersistedRecord, ShadowResult, TypeKey};
use shadow_kubehub::{ObjectStore, WatchStream};
use shadow_schema::StatusPaths;
use tracing::{debug, info, warn};

mod cache;
mod propagate;

pub use cache::{InformerCache, ObjectEvent};
pub use propagate::StatusPropagator;

/// Registered watch streams. Membership is add-only for the process lifetime.
pub struct WatchRegistry {
    store: Arc<dyn ObjectStore>,
    propagator: StatusPropagator,
    record_type: ObjectType,
    watching: Mutex<FxHashSet<TypeKey>>,
}

impl WatchRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, paths: Arc<StatusPaths>, record_type: ObjectType) -> Self {
        let propagator = StatusPropagator::new(Arc::clone(&store), paths, record_type.clone());
        Self { store, propagator, record_type, watching: Mutex::new(FxHashSet::default()) }
    }

    /// Attribute record status patches to `field_manager` instead of the default.
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.propagator = self.propagator.with_field_manager(field_manager);
        self
    }

    pub fn propagator(&self) -> &StatusPropagator { &self.propagator }

    fn lock(&self) -> MutexGuard<'_, FxHashSet<TypeKey>> {
        self.watching.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a watch for `ty` unless one is already registered. The check and
    /// insert happen under one lock, so concurrent callers start at most one
    /// stream per type. Must be called from within a Tokio runtime.
    pub fn ensure_watch(&self, ty: &ObjectType) -> bool {
        let key = ty.key();
        if !self.lock().insert(key.clone()) {
            return false;
        }
        let stream = self.store.watch(ty);
        tokio::spawn(run_watch(key.clone(), ty.kind.clone(), stream, self.propagator.clone()));
        counter!("shadow_watch_started", 1u64);
        info!(resource = %key, "watch started");
        true
    }

    pub fn is_watching(&self, key: &TypeKey) -> bool { self.lock().contains(key) }

    /// Registered type keys, sorted.
    pub fn watched(&self) -> Vec<TypeKey> {
        let mut keys: Vec<TypeKey> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Re-register watches for existing records after a restart: one per
    /// distinct first-component type. Returns the number of records inspected.
    pub async fn rehydrate(&self) -> ShadowResult<usize> {
        let records = self.store.list(&self.record_type, None).await?;
        let mut inspected = 0usize;
        for raw in records {
            let rec = match PersistedRecord::from_value(raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable record during rehydrate");
                    continue;
                }
            };
            inspected += 1;
            match rec.first_component() {
                Some(first) => {
                    self.ensure_watch(&first.object_type());
                }
                None => warn!(
                    ns = %rec.metadata.namespace.as_deref().unwrap_or(""),
                    name = %rec.metadata.name,
                    "record has no components; nothing to watch"
                ),
            }
        }
        info!(records = inspected, watches = self.lock().len(), "watches rehydrated");
        Ok(inspected)
    }
}

async fn run_watch(key: TypeKey, kind: String, mut stream: WatchStream, propagator: StatusPropagator) {
    let mut cache = InformerCache::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(ev) => {
                for oe in cache.observe(ev) {
                    propagator.handle(&kind, &oe).await;
                }
                debug!(resource = %key, cached = cache.len(), "watch event processed");
            }
            Err(e) => warn!(resource = %key, error = %e, "watch stream error"),
        }
    }
    warn!(resource = %key, "watch stream ended");
}

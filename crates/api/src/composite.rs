use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use shadow_core::{
    ComponentRef, ObjectType, PersistedRecord, RecordSpec, ShadowError, ShadowList, ShadowResource, ShadowResult,
};
use shadow_kubehub::{ObjectStore, TypeResolver, WriteOpts};
use shadow_registry::WatchRegistry;
use shadow_schema::StatusPaths;
use tracing::{debug, info, warn};

use crate::table::{self, Table, TableOptions, TableSource};
use crate::{CancelHandle, ListOptions, MergeFn, RequestCtx, ResourceEvent, Settings, ShadowStorage, StreamHandle};

fn observe<T>(op: &'static str, t0: Instant, res: &ShadowResult<T>) {
    let outcome = if res.is_ok() { "ok" } else { "err" };
    counter!("shadow_requests_total", 1u64, "op" => op, "outcome" => outcome);
    histogram!("shadow_request_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Ok(_) => info!(op, took_ms = %t0.elapsed().as_millis(), "api: {} ok", op),
        Err(e) => warn!(op, error = %e, took_ms = %t0.elapsed().as_millis(), "api: {} failed", op),
    }
}

/// One-based `[n/total]` position of the `index`th step, as logged.
fn progress(index: usize, total: usize) -> String {
    format!("[{}/{}]", index + 1, total)
}

/// A component after apply: resolved type, persisted reference and the store's copy.
struct Applied {
    ty: ObjectType,
    reference: ComponentRef,
    live: Json,
}

/// Lightweight list entry: identity, status and timestamps, no components.
fn summary(rec: &PersistedRecord) -> ShadowResource {
    let mut out = ShadowResource::stub(rec.metadata.namespace.as_deref().unwrap_or(""), &rec.metadata.name);
    out.status.state = rec.spec.status.clone();
    out.metadata.uid = Some(rec.spec.id.clone()).filter(|s| !s.is_empty());
    out.metadata.creation_timestamp = rec.metadata.creation_timestamp.clone();
    out.metadata.resource_version = rec.metadata.resource_version.clone();
    out
}

/// Shadow resources composed of objects in a managed store, with a persisted
/// record of each composition.
///
/// Writes are ordered and non-atomic: components are applied in list order,
/// the first failure aborts, and components applied before it stay in place.
/// The record is only written once every component applied. Deletes follow
/// the same contract.
pub struct CompositeStore {
    objects: Arc<dyn ObjectStore>,
    resolver: Arc<dyn TypeResolver>,
    registry: Arc<WatchRegistry>,
    paths: Arc<StatusPaths>,
    settings: Settings,
}

impl CompositeStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        resolver: Arc<dyn TypeResolver>,
        registry: Arc<WatchRegistry>,
        paths: Arc<StatusPaths>,
        settings: Settings,
    ) -> Self {
        Self { objects, resolver, registry, paths, settings }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> { &self.registry }

    pub fn settings(&self) -> &Settings { &self.settings }

    fn scoped(&self, ctx: &RequestCtx) -> RequestCtx { ctx.or_timeout(self.settings.request_timeout) }

    async fn load_record(&self, ctx: &RequestCtx, ns: &str, name: &str) -> ShadowResult<Option<PersistedRecord>> {
        let raw = ctx.guard(self.objects.get_opt(&self.settings.record_type, ns, name)).await?;
        Ok(raw.map(PersistedRecord::from_value).transpose()?)
    }

    /// Resolve, namespace and annotate every component before anything is written.
    fn prepare(&self, obj: &ShadowResource) -> ShadowResult<Vec<(ObjectType, Json)>> {
        let owner = obj.owner();
        let mut out = Vec::with_capacity(obj.spec.flow_list.len());
        for (i, raw) in obj.spec.flow_list.iter().enumerate() {
            let (ty, mut component) = shadow_apply::resolve_identifier(self.resolver.as_ref(), raw)?;
            shadow_apply::default_namespace(&ty, &mut component, obj.namespace())?;
            if i == 0 {
                shadow_apply::stamp_back_reference(&mut component, &owner)?;
            }
            out.push((ty, component));
        }
        Ok(out)
    }

    async fn apply_components(&self, ctx: &RequestCtx, prepared: Vec<(ObjectType, Json)>) -> ShadowResult<Vec<Applied>> {
        let total = prepared.len();
        let mut applied = Vec::with_capacity(total);
        for (ty, component) in prepared {
            let reference = shadow_apply::component_ref(&ty, &component);
            let res = ctx
                .guard(self.objects.apply(
                    &ty,
                    &reference.namespace,
                    &reference.name,
                    &component,
                    WriteOpts::manager(&self.settings.field_manager),
                ))
                .await;
            let step = progress(applied.len(), total);
            match res {
                Ok(live) => {
                    debug!(kind = %ty.kind, name = %reference.name, "{} component applied", step);
                    applied.push(Applied { ty, reference, live });
                }
                Err(e) => {
                    warn!(
                        kind = %ty.kind,
                        name = %reference.name,
                        error = %e,
                        "{} component apply failed; earlier components left applied",
                        step
                    );
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    /// Upsert the record unless its component list is unchanged. Returns whether it was written.
    ///
    /// The apply is forced: `spec.status` is also written by the status
    /// propagator's merge patches, and a rewrite replaces that value.
    async fn reconcile_record(&self, ctx: &RequestCtx, ns: &str, name: &str, applied: &[Applied]) -> ShadowResult<bool> {
        let refs: Vec<ComponentRef> = applied.iter().map(|a| a.reference.clone()).collect();
        if let Some(existing) = self.load_record(ctx, ns, name).await? {
            if existing.spec.component_refs == refs {
                debug!(ns, name, "record unchanged");
                return Ok(false);
            }
        }
        let status = applied.first().map(|a| self.paths.status_of(&a.ty.kind, &a.live)).unwrap_or_default();
        let id = uuid::Uuid::new_v4().to_string();
        let record = PersistedRecord::new(&self.settings.record_type, ns, name, RecordSpec { component_refs: refs, status, id });
        let payload = serde_json::to_value(&record)?;
        let opts = WriteOpts::manager(&self.settings.field_manager).force();
        ctx.guard(self.objects.apply(&self.settings.record_type, ns, name, &payload, opts)).await?;
        info!(ns, name, id = %record.spec.id, components = record.spec.component_refs.len(), "record written");
        Ok(true)
    }

    async fn create_inner(&self, ctx: &RequestCtx, namespace: &str, mut obj: ShadowResource) -> ShadowResult<ShadowResource> {
        if obj.spec.flow_list.is_empty() {
            return Err(ShadowError::Validation("componentList must not be empty".into()));
        }
        if obj.name().is_empty() {
            return Err(ShadowError::Validation("metadata.name is required".into()));
        }
        let declared = obj.metadata.namespace.clone().unwrap_or_default();
        if declared.is_empty() {
            obj.metadata.namespace = Some(namespace.to_string());
        } else if !namespace.is_empty() && declared != namespace {
            return Err(ShadowError::Validation(format!(
                "metadata.namespace {} does not match request namespace {}",
                declared, namespace
            )));
        }
        let prepared = self.prepare(&obj)?;
        let applied = self.apply_components(ctx, prepared).await?;
        self.reconcile_record(ctx, obj.namespace(), obj.name(), &applied).await?;
        if let Some(first) = applied.first() {
            self.registry.ensure_watch(&first.ty);
        }
        Ok(obj)
    }

    async fn get_inner(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<ShadowResource> {
        let rec = self
            .load_record(ctx, namespace, name)
            .await?
            .ok_or_else(|| ShadowError::not_found(namespace, name))?;
        let mut out = summary(&rec);
        out.metadata.namespace = Some(namespace.to_string());
        for r in &rec.spec.component_refs {
            let live = ctx.guard(self.objects.get(&r.object_type(), &r.namespace, &r.name)).await?;
            out.spec.flow_list.push(shadow_apply::strip_internal_fields(live));
        }
        shadow_apply::canonical_round_trip(&out)
    }

    async fn list_inner(&self, ctx: &RequestCtx, namespace: &str, opts: &ListOptions) -> ShadowResult<ShadowList> {
        let scope = Some(namespace).filter(|s| !s.is_empty());
        let raws = ctx.guard(self.objects.list(&self.settings.record_type, scope)).await?;
        let limit = opts.limit.filter(|l| *l > 0).unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for raw in raws {
            if items.len() >= limit {
                break;
            }
            match PersistedRecord::from_value(raw) {
                Ok(rec) => items.push(summary(&rec)),
                Err(e) => warn!(ns = %namespace, error = %e, "skipping undecodable record"),
            }
        }
        Ok(ShadowList::new(items))
    }

    async fn delete_inner(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<ShadowResource> {
        let rec = self
            .load_record(ctx, namespace, name)
            .await?
            .ok_or_else(|| ShadowError::not_found(namespace, name))?;
        let total = rec.spec.component_refs.len();
        for (i, r) in rec.spec.component_refs.iter().enumerate() {
            if let Err(e) = ctx.guard(self.objects.delete(&r.object_type(), &r.namespace, &r.name)).await {
                warn!(
                    kind = %r.kind,
                    name = %r.name,
                    error = %e,
                    "{} component delete failed; composite left partially deleted",
                    progress(i, total)
                );
                return Err(e);
            }
        }
        ctx.guard(self.objects.delete(&self.settings.record_type, namespace, name)).await?;
        Ok(ShadowResource::stub(namespace, name))
    }
}

#[async_trait::async_trait]
impl ShadowStorage for CompositeStore {
    async fn create(&self, ctx: &RequestCtx, namespace: &str, obj: ShadowResource) -> ShadowResult<ShadowResource> {
        let t0 = Instant::now();
        info!(ns = %namespace, name = %obj.name(), components = obj.spec.flow_list.len(), "api: create start");
        let res = self.create_inner(&self.scoped(ctx), namespace, obj).await;
        observe("create", t0, &res);
        res
    }

    async fn get(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<ShadowResource> {
        let t0 = Instant::now();
        debug!(ns = %namespace, name = %name, "api: get start");
        let res = self.get_inner(&self.scoped(ctx), namespace, name).await;
        observe("get", t0, &res);
        res
    }

    async fn list(&self, ctx: &RequestCtx, namespace: &str, opts: &ListOptions) -> ShadowResult<ShadowList> {
        let t0 = Instant::now();
        debug!(ns = %namespace, limit = ?opts.limit, "api: list start");
        let res = self.list_inner(&self.scoped(ctx), namespace, opts).await;
        observe("list", t0, &res);
        res
    }

    async fn update(
        &self,
        ctx: &RequestCtx,
        namespace: &str,
        name: &str,
        merge: MergeFn,
    ) -> ShadowResult<(ShadowResource, bool)> {
        let t0 = Instant::now();
        info!(ns = %namespace, name = %name, "api: update start");
        let ctx = self.scoped(ctx);
        let res: ShadowResult<(ShadowResource, bool)> = async {
            let current = match self.get_inner(&ctx, namespace, name).await {
                Ok(obj) => Some(obj),
                Err(ShadowError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let desired = merge(current)?;
            let obj = self.create_inner(&ctx, namespace, desired).await?;
            Ok((obj, false))
        }
        .await;
        observe("update", t0, &res);
        res
    }

    async fn delete(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<(ShadowResource, bool)> {
        let t0 = Instant::now();
        info!(ns = %namespace, name = %name, "api: delete start");
        let res = self.delete_inner(&self.scoped(ctx), namespace, name).await.map(|stub| (stub, false));
        observe("delete", t0, &res);
        res
    }

    async fn watch(
        &self,
        _ctx: &RequestCtx,
        namespace: &str,
        _opts: &ListOptions,
    ) -> ShadowResult<StreamHandle<ResourceEvent>> {
        debug!(ns = %namespace, "api: watch (inert)");
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Ok(StreamHandle { rx, cancel: CancelHandle { task: None } })
    }

    fn convert_to_table(&self, src: TableSource<'_>, opts: &TableOptions) -> Table {
        table::convert_to_table(&self.paths, src, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_one_based() {
        assert_eq!(progress(0, 3), "[1/3]");
        assert_eq!(progress(2, 3), "[3/3]");
    }
}

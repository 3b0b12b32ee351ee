use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shadow_api::{CompositeStore, ListOptions, RequestCtx, Settings, ShadowStorage, TableOptions, TableSource};
use shadow_core::{ObjectType, PersistedRecord, ShadowError, ShadowResource, ShadowResult, StoreError, BACK_REF_ANNOTATION};
use shadow_kubehub::{MemoryObjectStore, OpKind, StaticResolver};
use shadow_registry::WatchRegistry;
use shadow_schema::StatusPaths;

struct Fixture {
    store: Arc<MemoryObjectStore>,
    api: CompositeStore,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryObjectStore::new());
    let paths = Arc::new(StatusPaths::default());
    let registry = Arc::new(WatchRegistry::new(store.clone(), paths.clone(), ObjectType::record()));
    let api = CompositeStore::new(
        store.clone(),
        Arc::new(StaticResolver::with_builtins()),
        registry,
        paths,
        Settings::default(),
    );
    Fixture { store, api }
}

fn pod(name: &str, phase: &str) -> serde_json::Value {
    json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name}, "spec": {"containers": []}, "status": {"phase": phase}})
}

fn config_map(name: &str) -> serde_json::Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
}

fn record(store: &MemoryObjectStore, name: &str) -> Option<PersistedRecord> {
    store
        .object(&ObjectType::record(), "ns", name)
        .map(|v| PersistedRecord::from_value(v).unwrap())
}

fn pods() -> ObjectType {
    ObjectType { group: String::new(), version: "v1".into(), kind: "Pod".into(), resource: "pods".into(), namespaced: true }
}

#[tokio::test]
async fn create_then_get_reconstructs_live_components() {
    let f = fixture();
    let ctx = RequestCtx::new();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    let out = f.api.create(&ctx, "ns", sr).await.unwrap();
    assert_eq!(out.namespace(), "ns");

    let rec = record(&f.store, "demo").unwrap();
    assert_eq!(rec.spec.component_refs.len(), 2);
    assert_eq!(rec.spec.component_refs[0].resource, "pods");
    assert_eq!(rec.spec.component_refs[1].resource, "configmaps");
    assert_eq!(rec.spec.status, "Pending");
    assert!(!rec.spec.id.is_empty());

    f.store.clear_ops();
    let got = f.api.get(&ctx, "ns", "demo").await.unwrap();
    assert_eq!(got.spec.flow_list.len(), 2);
    assert_eq!(f.store.count(OpKind::Get, "pods"), 1);
    assert_eq!(f.store.count(OpKind::Get, "configmaps"), 1);
    assert_eq!(got.metadata.uid.as_deref(), Some(rec.spec.id.as_str()));
    assert_eq!(got.status.state, "Pending");
    for c in &got.spec.flow_list {
        assert!(c["metadata"].get("managedFields").is_none());
    }
    assert_eq!(got.spec.flow_list[1]["data"]["k"], "v");
}

#[tokio::test]
async fn unchanged_recomposition_keeps_record() {
    let f = fixture();
    let ctx = RequestCtx::new();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&ctx, "ns", sr.clone()).await.unwrap();
    let first = record(&f.store, "demo").unwrap();

    f.api.create(&ctx, "ns", sr).await.unwrap();
    let second = record(&f.store, "demo").unwrap();
    assert_eq!(f.store.count(OpKind::Apply, "shims"), 1);
    assert_eq!(first.spec.id, second.spec.id);
    assert_eq!(first.spec.component_refs, second.spec.component_refs);
}

#[tokio::test]
async fn changed_composition_gets_new_id() {
    let f = fixture();
    let ctx = RequestCtx::new();
    f.api.create(&ctx, "ns", ShadowResource::new("ns", "demo", vec![pod("web", "Pending")])).await.unwrap();
    let first = record(&f.store, "demo").unwrap();

    let wider = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&ctx, "ns", wider).await.unwrap();
    let second = record(&f.store, "demo").unwrap();
    assert_ne!(first.spec.id, second.spec.id);
    assert_eq!(second.spec.component_refs.len(), 2);
    assert_eq!(f.store.count(OpKind::Apply, "shims"), 2);
}

#[tokio::test]
async fn recomposition_overrides_propagated_status() {
    let f = fixture();
    let ctx = RequestCtx::new();
    f.api.create(&ctx, "ns", ShadowResource::new("ns", "demo", vec![pod("web", "Pending")])).await.unwrap();
    let live = f.store.object(&pods(), "ns", "web").unwrap();
    let mut running = live.clone();
    running["status"]["phase"] = json!("Running");
    assert!(f.api.registry().propagator().on_update("Pod", &live, &running).await.unwrap());
    assert_eq!(record(&f.store, "demo").unwrap().spec.status, "Running");

    f.store.clear_ops();
    let wider = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&ctx, "ns", wider).await.unwrap();
    let rec = record(&f.store, "demo").unwrap();
    assert_eq!(rec.spec.component_refs.len(), 2);
    assert_eq!(rec.spec.status, "Pending");

    let applies: Vec<_> = f.store.ops().into_iter().filter(|o| o.op == OpKind::Apply).collect();
    assert_eq!(applies.len(), 3);
    assert!(applies.iter().all(|o| o.field_manager.as_deref() == Some("shadow")));
    let forced: Vec<&str> = applies.iter().filter(|o| o.force).map(|o| o.resource.as_str()).collect();
    assert_eq!(forced, vec!["shims"]);
}

#[tokio::test]
async fn empty_composition_is_rejected_without_writes() {
    let f = fixture();
    let err = f.api.create(&RequestCtx::new(), "ns", ShadowResource::new("ns", "demo", vec![])).await.unwrap_err();
    assert!(matches!(err, ShadowError::Validation(_)));
    assert!(f.store.ops().is_empty());
}

#[tokio::test]
async fn unknown_kind_fails_before_any_write() {
    let f = fixture();
    let widget = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}});
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), widget]);
    let err = f.api.create(&RequestCtx::new(), "ns", sr).await.unwrap_err();
    assert!(matches!(err, ShadowError::Resolution { .. }));
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn namespace_is_inherited_and_conflicts_rejected() {
    let f = fixture();
    let ctx = RequestCtx::new();
    let mut sr = ShadowResource::new("", "demo", vec![pod("web", "Pending")]);
    sr.metadata.namespace = None;
    let out = f.api.create(&ctx, "ns", sr).await.unwrap();
    assert_eq!(out.namespace(), "ns");
    let live = f.store.object(&pods(), "ns", "web").unwrap();
    assert_eq!(live["metadata"]["namespace"], "ns");

    let other = ShadowResource::new("elsewhere", "demo", vec![pod("web", "Pending")]);
    let err = f.api.create(&ctx, "ns", other).await.unwrap_err();
    assert!(matches!(err, ShadowError::Validation(_)));
}

#[tokio::test]
async fn only_first_component_is_linked_and_watched() {
    let f = fixture();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&RequestCtx::new(), "ns", sr).await.unwrap();

    let p = f.store.object(&pods(), "ns", "web").unwrap();
    let anno = p["metadata"]["annotations"][BACK_REF_ANNOTATION].as_str().unwrap();
    let owner: serde_json::Value = serde_json::from_str(anno).unwrap();
    assert_eq!(owner, json!({"Name": "demo", "Namespace": "ns"}));

    let cm_type = ObjectType { kind: "ConfigMap".into(), resource: "configmaps".into(), ..pods() };
    let cm = f.store.object(&cm_type, "ns", "cfg").unwrap();
    assert!(cm["metadata"].get("annotations").is_none());

    assert!(f.api.registry().is_watching(&pods().key()));
    assert!(!f.api.registry().is_watching(&cm_type.key()));
}

#[tokio::test]
async fn partial_failure_leaves_earlier_components_and_no_record() {
    let f = fixture();
    f.store.fail_on(OpKind::Apply, "cfg");
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg"), pod("tail", "Pending")]);
    let err = f.api.create(&RequestCtx::new(), "ns", sr).await.unwrap_err();
    assert!(matches!(err, ShadowError::Store(StoreError::Backend(_))));
    assert!(f.store.object(&pods(), "ns", "web").is_some());
    assert!(f.store.object(&pods(), "ns", "tail").is_none());
    assert!(record(&f.store, "demo").is_none());
    assert!(f.api.registry().watched().is_empty());
}

#[tokio::test]
async fn delete_removes_everything_then_get_is_not_found() {
    let f = fixture();
    let ctx = RequestCtx::new();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&ctx, "ns", sr).await.unwrap();

    let (stub, deleted) = f.api.delete(&ctx, "ns", "demo").await.unwrap();
    assert!(!deleted);
    assert_eq!((stub.namespace(), stub.name()), ("ns", "demo"));
    assert!(stub.spec.flow_list.is_empty());
    assert!(f.store.is_empty());

    let err = f.api.get(&ctx, "ns", "demo").await.unwrap_err();
    assert!(matches!(err, ShadowError::NotFound { .. }));
    let err = f.api.delete(&ctx, "ns", "demo").await.unwrap_err();
    assert!(matches!(err, ShadowError::NotFound { .. }));
}

#[tokio::test]
async fn delete_stops_at_first_failing_component() {
    let f = fixture();
    let ctx = RequestCtx::new();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]);
    f.api.create(&ctx, "ns", sr).await.unwrap();
    f.store.fail_on(OpKind::Delete, "cfg");

    assert!(f.api.delete(&ctx, "ns", "demo").await.is_err());
    assert!(f.store.object(&pods(), "ns", "web").is_none());
    assert!(record(&f.store, "demo").is_some());
}

#[tokio::test]
async fn update_replaces_through_merge_fn() {
    let f = fixture();
    let ctx = RequestCtx::new();

    let (created, flag) = f
        .api
        .update(
            &ctx,
            "ns",
            "demo",
            Box::new(|current: Option<ShadowResource>| -> ShadowResult<ShadowResource> {
                assert!(current.is_none());
                Ok(ShadowResource::new("ns", "demo", vec![pod("web", "Pending")]))
            }),
        )
        .await
        .unwrap();
    assert!(!flag);
    assert_eq!(created.name(), "demo");

    let (_, flag) = f
        .api
        .update(
            &ctx,
            "ns",
            "demo",
            Box::new(|current: Option<ShadowResource>| -> ShadowResult<ShadowResource> {
                let current = current.expect("existing object");
                assert_eq!(current.spec.flow_list.len(), 1);
                Ok(ShadowResource::new("ns", "demo", vec![pod("web", "Pending"), config_map("cfg")]))
            }),
        )
        .await
        .unwrap();
    assert!(!flag);
    assert_eq!(record(&f.store, "demo").unwrap().spec.component_refs.len(), 2);
}

#[tokio::test]
async fn list_returns_summaries_and_honours_limit() {
    let f = fixture();
    let ctx = RequestCtx::new();
    for name in ["a", "b", "c"] {
        let sr = ShadowResource::new("ns", name, vec![pod(&format!("{name}-pod"), "Running")]);
        f.api.create(&ctx, "ns", sr).await.unwrap();
    }
    f.store.insert(&ObjectType::record(), json!({"metadata": {"name": "junk", "namespace": "ns"}, "spec": 5}));
    f.store.clear_ops();

    let all = f.api.list(&ctx, "ns", &ListOptions::default()).await.unwrap();
    assert_eq!(all.kind, "ShadowResourceList");
    assert_eq!(all.items.len(), 3);
    assert!(all.items.iter().all(|i| i.status.state == "Running" && i.spec.flow_list.is_empty()));
    assert_eq!(f.store.count(OpKind::Get, "pods"), 0);

    let some = f.api.list(&ctx, "ns", &ListOptions { limit: Some(2) }).await.unwrap();
    assert_eq!(some.items.len(), 2);
    assert!(f.api.list(&ctx, "other", &ListOptions::default()).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn watch_stream_is_inert() {
    let f = fixture();
    let mut handle = f.api.watch(&RequestCtx::new(), "ns", &ListOptions::default()).await.unwrap();
    assert!(handle.rx.recv().await.is_none());
    handle.cancel.cancel();
}

#[tokio::test]
async fn cancelled_request_writes_nothing() {
    let f = fixture();
    let ctx = RequestCtx::new();
    ctx.cancel();
    let sr = ShadowResource::new("ns", "demo", vec![pod("web", "Pending")]);
    let err = f.api.create(&ctx, "ns", sr).await.unwrap_err();
    assert!(matches!(err, ShadowError::Cancelled));
    assert!(f.store.ops().is_empty());
}

#[tokio::test]
async fn table_uses_record_status() {
    let f = fixture();
    let ctx = RequestCtx::new();
    f.api.create(&ctx, "ns", ShadowResource::new("ns", "demo", vec![pod("web", "Running")])).await.unwrap();
    let obj = f.api.get(&ctx, "ns", "demo").await.unwrap();
    let table = f.api.convert_to_table(TableSource::Single(&obj), &TableOptions::default());
    assert_eq!(table.column_definitions.len(), 3);
    assert_eq!(table.rows[0].cells[0], "demo");
    assert_eq!(table.rows[0].cells[1], "Running");
    assert!(table.rows[0].cells[2].ends_with('Z'));
}

#[tokio::test]
async fn component_status_flows_back_to_get() {
    let f = fixture();
    let ctx = RequestCtx::new();
    f.api.create(&ctx, "ns", ShadowResource::new("ns", "demo", vec![pod("web", "Pending")])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(f.store.external_merge(&pods(), "ns", "web", &json!({"status": {"phase": "Running"}})));
    let mut state = String::new();
    for _ in 0..100 {
        state = f.api.get(&ctx, "ns", "demo").await.unwrap().status.state;
        if state == "Running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "Running");
}

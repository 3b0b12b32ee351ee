//! In-memory object store with apply/merge semantics close to the API server's,
//! an operation log, and failure injection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use serde_json::{Map, Value as Json};
use shadow_core::{ObjectType, StoreError, TypeKey};
use tokio::sync::mpsc;

use crate::{meta_str, ObjectStore, WatchEvent, WatchStream, WriteOpts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    List,
    Apply,
    Merge,
    Delete,
}

/// One call made against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub op: OpKind,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub payload: Option<Json>,
    /// Set for applies and merges.
    pub field_manager: Option<String>,
    pub force: bool,
}

type ObjKey = (TypeKey, String, String);

/// Field path below the object root, one segment per key.
type FieldPath = Vec<String>;

/// Manager and operation owning a field. Apply and merge entries of the same
/// manager are distinct owners, as on the API server.
type FieldOwner = (String, OpKind);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjKey, Json>,
    owners: BTreeMap<ObjKey, BTreeMap<FieldPath, FieldOwner>>,
    ops: Vec<OpRecord>,
    failures: Vec<(OpKind, String)>,
    subscribers: Vec<(TypeKey, mpsc::UnboundedSender<WatchEvent>)>,
    next_rv: u64,
}

impl Inner {
    fn record(&mut self, op: OpKind, ty: &ObjectType, namespace: &str, name: &str, payload: Option<&Json>) {
        self.record_write(op, ty, namespace, name, payload, None);
    }

    fn record_write(
        &mut self,
        op: OpKind,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: Option<&Json>,
        opts: Option<WriteOpts<'_>>,
    ) {
        self.ops.push(OpRecord {
            op,
            resource: ty.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            payload: payload.cloned(),
            field_manager: opts.map(|o| o.field_manager.to_string()),
            force: opts.map_or(false, |o| o.force),
        });
    }

    /// First field of `payload` that another owner holds with a different value.
    fn apply_conflict(&self, key: &ObjKey, payload: &Json, field_manager: &str) -> Option<(FieldPath, String)> {
        let existing = self.objects.get(key)?;
        let owners = self.owners.get(key)?;
        leaf_fields(payload).into_iter().find_map(|(path, value)| {
            let (manager, op) = owners.get(&path)?;
            let foreign = !(manager == field_manager && *op == OpKind::Apply);
            (foreign && field_at(existing, &path) != Some(value)).then(|| (path, manager.clone()))
        })
    }

    fn take_ownership(&mut self, key: &ObjKey, payload: &Json, owner: FieldOwner) {
        let owners = self.owners.entry(key.clone()).or_default();
        for (path, value) in leaf_fields(payload) {
            if value.is_null() {
                owners.remove(&path);
            } else {
                owners.insert(path, owner.clone());
            }
        }
    }

    fn check_failure(&self, op: OpKind, name: &str) -> Result<(), StoreError> {
        if self.failures.iter().any(|(o, n)| *o == op && n == name) {
            return Err(StoreError::Backend(format!("injected {:?} failure for {}", op, name)));
        }
        Ok(())
    }

    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn publish(&mut self, key: &TypeKey, ev: WatchEvent) {
        self.subscribers.retain(|(k, tx)| k != key || tx.send(ev.clone()).is_ok());
    }
}

/// Leaf fields of a write payload, skipping identity and metadata. Arrays are leaves.
fn leaf_fields(payload: &Json) -> Vec<(FieldPath, &Json)> {
    fn walk<'a>(v: &'a Json, path: &mut FieldPath, out: &mut Vec<(FieldPath, &'a Json)>) {
        match v {
            Json::Object(m) if !m.is_empty() => {
                for (k, child) in m {
                    path.push(k.clone());
                    walk(child, path, out);
                    path.pop();
                }
            }
            leaf => out.push((path.clone(), leaf)),
        }
    }
    let mut out = Vec::new();
    if let Json::Object(root) = payload {
        for (k, v) in root {
            if matches!(k.as_str(), "apiVersion" | "kind" | "metadata") {
                continue;
            }
            walk(v, &mut vec![k.clone()], &mut out);
        }
    }
    out
}

fn field_at<'a>(obj: &'a Json, path: &[String]) -> Option<&'a Json> {
    path.iter().try_fold(obj, |cur, seg| cur.get(seg))
}

fn not_found(ty: &ObjectType, namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound { resource: ty.resource.clone(), namespace: namespace.to_string(), name: name.to_string() }
}

/// Recursive object merge; arrays and scalars from `patch` replace.
fn deep_merge(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, pv) in p {
                match b.get_mut(k) {
                    Some(bv) if bv.is_object() && pv.is_object() => deep_merge(bv, pv),
                    _ => {
                        b.insert(k.clone(), pv.clone());
                    }
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    if let Json::Object(p) = patch {
        if !target.is_object() {
            *target = Json::Object(Map::new());
        }
        if let Json::Object(t) = target {
            for (k, pv) in p {
                if pv.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Json::Null), pv);
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn set_meta(obj: &mut Json, field: &str, value: Json) {
    if !obj.is_object() {
        *obj = Json::Object(Map::new());
    }
    if let Json::Object(root) = obj {
        let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        if let Json::Object(m) = meta {
            m.insert(field.to_string(), value);
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without recording an operation or notifying watchers.
    pub fn insert(&self, ty: &ObjectType, obj: Json) {
        let ns = meta_str(&obj, "namespace").unwrap_or("").to_string();
        let name = meta_str(&obj, "name").unwrap_or("").to_string();
        self.lock().objects.insert((ty.key(), ns, name), obj);
    }

    pub fn object(&self, ty: &ObjectType, namespace: &str, name: &str) -> Option<Json> {
        self.lock().objects.get(&(ty.key(), namespace.to_string(), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    pub fn ops(&self) -> Vec<OpRecord> { self.lock().ops.clone() }

    pub fn clear_ops(&self) { self.lock().ops.clear(); }

    /// Number of recorded `op` calls against `resource`.
    pub fn count(&self, op: OpKind, resource: &str) -> usize {
        self.lock().ops.iter().filter(|r| r.op == op && r.resource == resource).count()
    }

    /// Make every future `op` on an object called `name` fail with a backend error.
    pub fn fail_on(&self, op: OpKind, name: &str) {
        self.lock().failures.push((op, name.to_string()));
    }

    /// Mutate a stored object as an external actor would (e.g. a kubelet updating pod status),
    /// notifying watchers.
    pub fn external_merge(&self, ty: &ObjectType, namespace: &str, name: &str, patch: &Json) -> bool {
        let mut inner = self.lock();
        let key = (ty.key(), namespace.to_string(), name.to_string());
        let rv = inner.bump_rv();
        let Some(obj) = inner.objects.get_mut(&key) else { return false };
        merge_patch(obj, patch);
        set_meta(obj, "resourceVersion", Json::String(rv));
        let snapshot = obj.clone();
        inner.publish(&ty.key(), WatchEvent::Applied(snapshot));
        true
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<Json, StoreError> {
        let mut inner = self.lock();
        inner.record(OpKind::Get, ty, namespace, name, None);
        inner.check_failure(OpKind::Get, name)?;
        inner
            .objects
            .get(&(ty.key(), namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(ty, namespace, name))
    }

    async fn list(&self, ty: &ObjectType, namespace: Option<&str>) -> Result<Vec<Json>, StoreError> {
        let mut inner = self.lock();
        inner.record(OpKind::List, ty, namespace.unwrap_or(""), "", None);
        let key = ty.key();
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == key && namespace.map_or(true, |want| want == ns))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(OpKind::Delete, ty, namespace, name, None);
        inner.check_failure(OpKind::Delete, name)?;
        let obj = inner
            .objects
            .remove(&(ty.key(), namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(ty, namespace, name))?;
        inner.owners.remove(&(ty.key(), namespace.to_string(), name.to_string()));
        inner.publish(&ty.key(), WatchEvent::Deleted(obj));
        Ok(())
    }

    async fn apply(
        &self,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: &Json,
        opts: WriteOpts<'_>,
    ) -> Result<Json, StoreError> {
        let mut inner = self.lock();
        inner.record_write(OpKind::Apply, ty, namespace, name, Some(payload), Some(opts));
        inner.check_failure(OpKind::Apply, name)?;
        let key = (ty.key(), namespace.to_string(), name.to_string());
        if !opts.force {
            if let Some((path, manager)) = inner.apply_conflict(&key, payload, opts.field_manager) {
                return Err(StoreError::Conflict(format!(
                    "Apply failed with 1 conflict: conflict with \"{}\": .{}",
                    manager,
                    path.join(".")
                )));
            }
        }
        let rv = inner.bump_rv();
        let mut obj = match inner.objects.get(&key) {
            Some(existing) => {
                let mut merged = existing.clone();
                deep_merge(&mut merged, payload);
                merged
            }
            None => {
                let mut fresh = payload.clone();
                set_meta(&mut fresh, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
                set_meta(
                    &mut fresh,
                    "creationTimestamp",
                    Json::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
                );
                fresh
            }
        };
        if let Some(root) = obj.as_object_mut() {
            root.entry("apiVersion").or_insert_with(|| Json::String(ty.api_version()));
            root.entry("kind").or_insert_with(|| Json::String(ty.kind.clone()));
        }
        set_meta(&mut obj, "name", Json::String(name.to_string()));
        if ty.namespaced {
            set_meta(&mut obj, "namespace", Json::String(namespace.to_string()));
        }
        set_meta(&mut obj, "resourceVersion", Json::String(rv));
        set_meta(
            &mut obj,
            "managedFields",
            serde_json::json!([{ "manager": opts.field_manager, "operation": "Apply" }]),
        );
        inner.take_ownership(&key, payload, (opts.field_manager.to_string(), OpKind::Apply));
        inner.objects.insert(key, obj.clone());
        inner.publish(&ty.key(), WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn merge(
        &self,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: &Json,
        opts: WriteOpts<'_>,
    ) -> Result<Json, StoreError> {
        let mut inner = self.lock();
        inner.record_write(OpKind::Merge, ty, namespace, name, Some(payload), Some(opts));
        inner.check_failure(OpKind::Merge, name)?;
        let key = (ty.key(), namespace.to_string(), name.to_string());
        let rv = inner.bump_rv();
        let obj = inner.objects.get_mut(&key).ok_or_else(|| not_found(ty, namespace, name))?;
        merge_patch(obj, payload);
        set_meta(obj, "resourceVersion", Json::String(rv));
        let snapshot = obj.clone();
        inner.take_ownership(&key, payload, (opts.field_manager.to_string(), OpKind::Merge));
        inner.publish(&ty.key(), WatchEvent::Applied(snapshot.clone()));
        Ok(snapshot)
    }

    fn watch(&self, ty: &ObjectType) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let key = ty.key();
        let initial: Vec<Json> = inner
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == key)
            .map(|(_, v)| v.clone())
            .collect();
        let _ = tx.send(WatchEvent::Restarted(initial));
        inner.subscribers.push((key, tx));
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok(ev), rx)) }).boxed()
    }
}

use std::sync::RwLock;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use shadow_core::{ObjectType, StoreError};
use tracing::{debug, info};

use crate::{TypeResolver, WatchEvent, WatchStream, WriteOpts};

fn api_resource(ty: &ObjectType) -> ApiResource {
    ApiResource {
        group: ty.group.clone(),
        version: ty.version.clone(),
        api_version: ty.api_version(),
        kind: ty.kind.clone(),
        plural: ty.resource.clone(),
    }
}

fn map_kube_err(e: kube::Error, ty: &ObjectType, namespace: &str, name: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            resource: ty.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        other => StoreError::Backend(other.to_string()),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, StoreError> {
    Ok(serde_json::to_value(obj)?)
}

/// [`ObjectStore`](crate::ObjectStore) over the Kubernetes API via dynamic objects.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(crate::get_kube_client().await?))
    }

    fn api(&self, ty: &ObjectType, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(ty);
        match namespace {
            Some(ns) if ty.namespaced && !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl crate::ObjectStore for KubeObjectStore {
    async fn get(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<Json, StoreError> {
        let obj = self
            .api(ty, Some(namespace))
            .get(name)
            .await
            .map_err(|e| map_kube_err(e, ty, namespace, name))?;
        to_json(&obj)
    }

    async fn list(&self, ty: &ObjectType, namespace: Option<&str>) -> Result<Vec<Json>, StoreError> {
        let list = self
            .api(ty, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err(e, ty, namespace.unwrap_or(""), ""))?;
        list.items.iter().map(to_json).collect()
    }

    async fn delete(&self, ty: &ObjectType, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(ty, Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(e, ty, namespace, name))?;
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
        let mut pp = PatchParams::apply(opts.field_manager);
        if opts.force {
            pp = pp.force();
        }
        let obj = self
            .api(ty, Some(namespace))
            .patch(name, &pp, &Patch::Apply(payload))
            .await
            .map_err(|e| map_kube_err(e, ty, namespace, name))?;
        to_json(&obj)
    }

    async fn merge(
        &self,
        ty: &ObjectType,
        namespace: &str,
        name: &str,
        payload: &Json,
        opts: WriteOpts<'_>,
    ) -> Result<Json, StoreError> {
        let pp = PatchParams { field_manager: Some(opts.field_manager.to_string()), ..Default::default() };
        let obj = self
            .api(ty, Some(namespace))
            .patch(name, &pp, &Patch::Merge(payload))
            .await
            .map_err(|e| map_kube_err(e, ty, namespace, name))?;
        to_json(&obj)
    }

    fn watch(&self, ty: &ObjectType) -> WatchStream {
        let api = self.api(ty, None);
        debug!(resource = %ty.key(), "opening watch stream");
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|res| match res {
                Ok(Event::Applied(o)) => to_json(&o).map(WatchEvent::Applied),
                Ok(Event::Deleted(o)) => to_json(&o).map(WatchEvent::Deleted),
                Ok(Event::Restarted(list)) => {
                    list.iter().map(to_json).collect::<Result<Vec<_>, _>>().map(WatchEvent::Restarted)
                }
                Err(e) => Err(StoreError::Backend(e.to_string())),
            })
            .boxed()
    }
}

type GvkKey = (String, String, String);

/// Resolver built from API discovery across every served version of every group.
pub struct DiscoveryResolver {
    client: Client,
    types: RwLock<FxHashMap<GvkKey, ObjectType>>,
}

impl DiscoveryResolver {
    /// Run discovery once; failure here is fatal for the caller.
    pub async fn new(client: Client) -> Result<Self> {
        let me = Self { client, types: RwLock::new(FxHashMap::default()) };
        me.refresh().await?;
        Ok(me)
    }

    /// Re-run discovery, replacing the mapping. Returns the number of known types.
    pub async fn refresh(&self) -> Result<usize> {
        let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
        let mut map = FxHashMap::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let ty = ObjectType {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                        resource: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    };
                    map.insert((ty.group.clone(), ty.version.clone(), ty.kind.clone()), ty);
                }
            }
        }
        let count = map.len();
        *self.types.write().unwrap_or_else(|e| e.into_inner()) = map;
        info!(types = count, "discovery mapping loaded");
        Ok(count)
    }
}

impl TypeResolver for DiscoveryResolver {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Option<ObjectType> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.get(&(group.to_string(), version.to_string(), kind.to_string())).cloned()
    }
}

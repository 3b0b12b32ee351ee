use rustc_hash::FxHashMap;
use shadow_core::ObjectType;

use crate::TypeResolver;

/// Fixed group/version/kind table, for tests and offline use.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    types: FxHashMap<(String, String, String), ObjectType>,
}

impl StaticResolver {
    pub fn new() -> Self { Self::default() }

    /// Common core, apps and batch kinds.
    pub fn with_builtins() -> Self {
        let mut me = Self::new();
        for (group, kind, resource, namespaced) in [
            ("", "Pod", "pods", true),
            ("", "ConfigMap", "configmaps", true),
            ("", "Secret", "secrets", true),
            ("", "Service", "services", true),
            ("", "Namespace", "namespaces", false),
            ("apps", "Deployment", "deployments", true),
            ("apps", "StatefulSet", "statefulsets", true),
            ("batch", "Job", "jobs", true),
        ] {
            me.insert(ObjectType {
                group: group.to_string(),
                version: "v1".to_string(),
                kind: kind.to_string(),
                resource: resource.to_string(),
                namespaced,
            });
        }
        me
    }

    pub fn insert(&mut self, ty: ObjectType) {
        self.types.insert((ty.group.clone(), ty.version.clone(), ty.kind.clone()), ty);
    }

    pub fn with(mut self, ty: ObjectType) -> Self {
        self.insert(ty);
        self
    }
}

impl TypeResolver for StaticResolver {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Option<ObjectType> {
        self.types.get(&(group.to_string(), version.to_string(), kind.to_string())).cloned()
    }
}

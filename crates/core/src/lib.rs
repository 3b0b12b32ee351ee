//! Shadow core types: the user-facing shadow resource, the persisted record
//! that tracks its composition, and the references tying the two together.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod error;

pub use error::{ShadowError, ShadowResult, StoreError};

pub const SHADOW_GROUP: &str = "apis.abc.com";
pub const SHADOW_VERSION: &str = "v1";
pub const SHADOW_API_VERSION: &str = "apis.abc.com/v1";
pub const SHADOW_KIND: &str = "ShadowResource";
pub const SHADOW_LIST_KIND: &str = "ShadowResourceList";
pub const SHADOW_RESOURCE: &str = "shadowresources";

/// Field owner used for every apply issued by the orchestrator.
pub const FIELD_MANAGER: &str = "shadow";

/// Annotation carried by the first component only; value is an encoded [`OwnerMeta`].
pub const BACK_REF_ANNOTATION: &str = "ShadowResource";

/// Status written onto a record when its linked component disappears.
pub const DELETED_STATUS: &str = "deleted";

pub const RECORD_GROUP: &str = "kubesphere.io";
pub const RECORD_VERSION: &str = "v1";
pub const RECORD_RESOURCE: &str = "shims";
pub const RECORD_KIND: &str = "shim";

/// Resolved type metadata for an object in the managed store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectType {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural collection name, e.g. `pods`.
    pub resource: String,
    pub namespaced: bool,
}

impl ObjectType {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn key(&self) -> TypeKey {
        TypeKey { group: self.group.clone(), version: self.version.clone(), resource: self.resource.clone() }
    }

    /// Default object type used to persist records.
    pub fn record() -> Self {
        Self {
            group: RECORD_GROUP.to_string(),
            version: RECORD_VERSION.to_string(),
            kind: RECORD_KIND.to_string(),
            resource: RECORD_RESOURCE.to_string(),
            namespaced: true,
        }
    }
}

/// Registration key for watch streams: group/version/resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Durable pointer to one component object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl ComponentRef {
    /// Type metadata needed to address the referenced object. Cluster-scoped
    /// components are recorded with an empty namespace.
    pub fn object_type(&self) -> ObjectType {
        ObjectType {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            resource: self.resource.clone(),
            namespaced: !self.namespace.is_empty(),
        }
    }
}

/// Owner identity encoded into the back-reference annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OwnerMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowSpec {
    /// Raw component payloads on write; live component objects on read.
    #[serde(rename = "flowList", default)]
    pub flow_list: Vec<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowStatus {
    #[serde(rename = "State", default)]
    pub state: String,
}

/// The user-facing composite entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowResource {
    #[serde(default = "shadow_api_version")]
    pub api_version: String,
    #[serde(default = "shadow_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ShadowSpec,
    #[serde(default)]
    pub status: ShadowStatus,
}

fn shadow_api_version() -> String { SHADOW_API_VERSION.to_string() }
fn shadow_kind() -> String { SHADOW_KIND.to_string() }

impl ShadowResource {
    pub fn new(namespace: &str, name: &str, components: Vec<Json>) -> Self {
        let mut me = Self::stub(namespace, name);
        me.spec.flow_list = components;
        me
    }

    /// Identity-only object, as returned by delete.
    pub fn stub(namespace: &str, name: &str) -> Self {
        Self {
            api_version: shadow_api_version(),
            kind: shadow_kind(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: ShadowSpec::default(),
            status: ShadowStatus::default(),
        }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }

    pub fn owner(&self) -> OwnerMeta {
        OwnerMeta { name: self.name().to_string(), namespace: self.namespace().to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<ShadowResource>,
}

impl ShadowList {
    pub fn new(items: Vec<ShadowResource>) -> Self {
        Self {
            api_version: SHADOW_API_VERSION.to_string(),
            kind: SHADOW_LIST_KIND.to_string(),
            metadata: ListMeta::default(),
            items,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSpec {
    #[serde(rename = "CrInfoList", default)]
    pub component_refs: Vec<ComponentRef>,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "shadowUid", default)]
    pub id: String,
}

/// Durable record of a shadow resource's composition, stored as a managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RecordSpec,
}

impl PersistedRecord {
    pub fn new(record_type: &ObjectType, namespace: &str, name: &str, spec: RecordSpec) -> Self {
        Self {
            api_version: record_type.api_version(),
            kind: record_type.kind.clone(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn from_value(v: Json) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v)
    }

    /// The component whose type drives status aggregation.
    pub fn first_component(&self) -> Option<&ComponentRef> {
        self.spec.component_refs.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_shape_field_names() {
        let rec = PersistedRecord::new(
            &ObjectType::record(),
            "ns",
            "demo",
            RecordSpec {
                component_refs: vec![ComponentRef {
                    group: String::new(),
                    version: "v1".into(),
                    kind: "Pod".into(),
                    resource: "pods".into(),
                    namespace: "ns".into(),
                    name: "p1".into(),
                }],
                status: "Running".into(),
                id: "abc".into(),
            },
        );
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["apiVersion"], "kubesphere.io/v1");
        assert_eq!(v["kind"], "shim");
        assert_eq!(v["metadata"]["namespace"], "ns");
        assert_eq!(v["spec"]["CrInfoList"][0]["resource"], "pods");
        assert_eq!(v["spec"]["shadowUid"], "abc");
        assert_eq!(v["spec"]["status"], "Running");
        let back = PersistedRecord::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn owner_meta_encodes_pascal_case() {
        let owner = OwnerMeta { name: "a".into(), namespace: "b".into() };
        assert_eq!(serde_json::to_string(&owner).unwrap(), r#"{"Name":"a","Namespace":"b"}"#);
    }

    #[test]
    fn shadow_resource_defaults_type_markers() {
        let sr: ShadowResource = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "x"},
            "spec": {"flowList": [{"kind": "Pod"}]}
        }))
        .unwrap();
        assert_eq!(sr.api_version, SHADOW_API_VERSION);
        assert_eq!(sr.kind, SHADOW_KIND);
        assert_eq!(sr.spec.flow_list.len(), 1);
        assert_eq!(sr.namespace(), "");
    }

    #[test]
    fn type_key_display() {
        assert_eq!(ObjectType::record().key().to_string(), "kubesphere.io/v1/shims");
        let pods = TypeKey { group: String::new(), version: "v1".into(), resource: "pods".into() };
        assert_eq!(pods.to_string(), "v1/pods");
    }
}

//! Shadow apply: converts raw component payloads into resolved, addressable
//! objects and back, and manages the owner back-reference annotation.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as Json};
use shadow_core::{ComponentRef, ObjectType, OwnerMeta, ShadowError, ShadowResult, BACK_REF_ANNOTATION};
use shadow_kubehub::TypeResolver;
use tracing::debug;

fn max_payload_bytes() -> usize {
    std::env::var("SHADOW_MAX_PAYLOAD_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_payload_nodes() -> usize {
    std::env::var("SHADOW_MAX_PAYLOAD_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Type and identity read from a raw payload, before resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub object: Json,
}

/// Read `apiVersion`, `kind` and `metadata.name` off a raw payload.
pub fn decode_payload(raw: &Json) -> ShadowResult<DecodedPayload> {
    if !raw.is_object() {
        return Err(ShadowError::Validation("component payload must be a JSON object".into()));
    }
    if json_node_budget_exceeded(raw, max_payload_nodes()) {
        return Err(ShadowError::Validation(format!("component payload too complex (>{} nodes)", max_payload_nodes())));
    }
    let api_version = raw
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ShadowError::Validation("component missing apiVersion".into()))?;
    let kind = raw
        .get("kind")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ShadowError::Validation("component missing kind".into()))?;
    let meta = raw.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ShadowError::Validation(format!("{} component missing metadata.name", kind)))?;
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(DecodedPayload {
        group,
        version,
        kind: kind.to_string(),
        name: name.to_string(),
        namespace,
        object: raw.clone(),
    })
}

/// Decode a payload and resolve its kind/version to a served resource collection.
pub fn resolve_identifier(resolver: &dyn TypeResolver, raw: &Json) -> ShadowResult<(ObjectType, Json)> {
    let decoded = decode_payload(raw)?;
    let ty = resolver
        .resolve(&decoded.group, &decoded.version, &decoded.kind)
        .ok_or_else(|| ShadowError::Resolution {
            api_version: raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            kind: decoded.kind.clone(),
        })?;
    debug!(kind = %ty.kind, resource = %ty.resource, name = %decoded.name, "component resolved");
    Ok((ty, decoded.object))
}

fn metadata_map(obj: &mut Json) -> ShadowResult<&mut Map<String, Json>> {
    let root = obj
        .as_object_mut()
        .ok_or_else(|| ShadowError::Validation("component payload must be a JSON object".into()))?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    meta.as_object_mut()
        .ok_or_else(|| ShadowError::Validation("component metadata must be an object".into()))
}

/// Fill `metadata.namespace` for namespaced types that omit it.
pub fn default_namespace(ty: &ObjectType, obj: &mut Json, namespace: &str) -> ShadowResult<()> {
    if !ty.namespaced || namespace.is_empty() {
        return Ok(());
    }
    let meta = metadata_map(obj)?;
    let missing = meta.get("namespace").and_then(|v| v.as_str()).map_or(true, |s| s.is_empty());
    if missing {
        meta.insert("namespace".into(), Json::String(namespace.to_string()));
    }
    Ok(())
}

/// Attach the owner back-reference to a component object.
pub fn stamp_back_reference(obj: &mut Json, owner: &OwnerMeta) -> ShadowResult<()> {
    let encoded = serde_json::to_string(owner)?;
    let meta = metadata_map(obj)?;
    let annotations = meta.entry("annotations").or_insert_with(|| Json::Object(Map::new()));
    if !annotations.is_object() {
        *annotations = Json::Object(Map::new());
    }
    if let Some(map) = annotations.as_object_mut() {
        map.insert(BACK_REF_ANNOTATION.to_string(), Json::String(encoded));
    }
    Ok(())
}

/// Owner named by the back-reference annotation, if the object carries one.
pub fn read_back_reference(obj: &Json) -> Option<OwnerMeta> {
    let raw = obj
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(BACK_REF_ANNOTATION))
        .and_then(|v| v.as_str())?;
    match serde_json::from_str::<OwnerMeta>(raw) {
        Ok(owner) if !owner.name.is_empty() => Some(owner),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "malformed back-reference annotation");
            None
        }
    }
}

/// Remove store bookkeeping before handing a component to a caller.
pub fn strip_internal_fields(mut obj: Json) -> Json {
    shadow_kubehub::strip_managed_fields(&mut obj);
    obj
}

/// Encode to wire JSON and decode back, so callers see exactly what a transport would produce.
pub fn canonical_round_trip<T: Serialize + DeserializeOwned>(obj: &T) -> ShadowResult<T> {
    let bytes = serde_json::to_vec(obj)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Persisted reference for an applied component, built from resolved type metadata.
pub fn component_ref(ty: &ObjectType, obj: &Json) -> ComponentRef {
    let meta = obj.get("metadata");
    let field = |f: &str| meta.and_then(|m| m.get(f)).and_then(|v| v.as_str()).unwrap_or("").to_string();
    ComponentRef {
        group: ty.group.clone(),
        version: ty.version.clone(),
        kind: ty.kind.clone(),
        resource: ty.resource.clone(),
        namespace: if ty.namespaced { field("namespace") } else { String::new() },
        name: field("name"),
    }
}

/// Parse a YAML (or JSON) manifest into JSON, with size and complexity limits.
pub fn manifest_to_json(text: &str) -> Result<Json> {
    if text.len() > max_payload_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_payload_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_payload_nodes()) {
        return Err(anyhow!("manifest too complex (>{} nodes)", max_payload_nodes()));
    }
    Ok(json)
}

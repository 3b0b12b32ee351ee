//! Status field configuration: which JSON path holds the status of a given kind,
//! and a small path evaluator to read it.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

/// Environment variable extending the built-in table, e.g. `Deployment=status.conditions[0].type`.
pub const STATUS_KEYS_ENV: &str = "SHADOW_STATUS_KEYS";

/// Accepts dot paths like `status.phase`, `.status.phase` or `status.conditions[0].type`.
/// Purely numeric segments (`status.conditions.0.type`) are allowed and index arrays.
pub fn normalize_json_path(jp: &str) -> Option<String> {
    if jp.contains('?') || jp.contains('*') { return None; }
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() { return None; }
    for seg in s.split('.') {
        if seg.is_empty() { return None; }
        let (key, idx) = match seg.find('[') {
            Some(open) => {
                let inner = seg[open + 1..].strip_suffix(']')?;
                if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) { return None; }
                (&seg[..open], Some(inner))
            }
            None => (seg, None),
        };
        if idx.is_some() && key.is_empty() { return None; }
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') { return None; }
    }
    Some(s.to_string())
}

/// Walk `path` (already normalized) through `root`.
pub fn extract_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        let (key, idx) = match seg.find('[') {
            Some(open) => {
                let end = seg.rfind(']')?;
                (&seg[..open], Some(seg.get(open + 1..end)?.parse::<usize>().ok()?))
            }
            None => (seg, None),
        };
        cur = match cur {
            Json::Object(map) => map.get(key)?,
            Json::Array(arr) => arr.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

/// Render a JSON value the way status strings are stored: scalars as text,
/// containers as compact JSON, null as empty.
pub fn render(v: &Json) -> String {
    match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Static mapping from object kind to its status path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPaths {
    by_kind: FxHashMap<String, String>,
}

impl Default for StatusPaths {
    fn default() -> Self {
        let mut by_kind = FxHashMap::default();
        by_kind.insert("Pod".to_string(), "status.phase".to_string());
        by_kind.insert(shadow_core::SHADOW_KIND.to_string(), "status.State".to_string());
        Self { by_kind }
    }
}

impl StatusPaths {
    pub fn empty() -> Self { Self { by_kind: FxHashMap::default() } }

    /// Built-in table plus entries from `SHADOW_STATUS_KEYS`. Malformed entries are skipped with a warning.
    pub fn from_env() -> Self {
        let mut me = Self::default();
        if let Ok(raw) = std::env::var(STATUS_KEYS_ENV) {
            for (kind, path) in parse_overrides(&raw) {
                if let Err(e) = me.insert(&kind, &path) {
                    warn!(kind = %kind, error = %e, "ignoring status key override");
                }
            }
        }
        me
    }

    pub fn insert(&mut self, kind: &str, path: &str) -> Result<()> {
        if kind.is_empty() { return Err(anyhow!("empty kind")); }
        let jp = normalize_json_path(path).ok_or_else(|| anyhow!("unsupported status path: {}", path))?;
        self.by_kind.insert(kind.to_string(), jp);
        Ok(())
    }

    pub fn with(mut self, kind: &str, path: &str) -> Result<Self> {
        self.insert(kind, path)?;
        Ok(self)
    }

    /// Configured path for `kind`; logs a warning when none is configured.
    pub fn lookup(&self, kind: &str) -> Option<&str> {
        let found = self.by_kind.get(kind).map(|s| s.as_str());
        if found.is_none() {
            warn!(kind = %kind, "no status field configured for kind");
        }
        found
    }

    /// Status of `obj` read through the path configured for `kind`; empty when unmapped or absent.
    pub fn status_of(&self, kind: &str, obj: &Json) -> String {
        self.lookup(kind)
            .and_then(|path| extract_path(obj, path))
            .map(render)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize { self.by_kind.len() }

    pub fn is_empty(&self) -> bool { self.by_kind.is_empty() }
}

fn parse_overrides(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() { None } else { Some((k.to_string(), v.to_string())) }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_json_path_accepts_simple_paths() {
        assert_eq!(normalize_json_path(".status.phase"), Some("status.phase".to_string()));
        assert_eq!(normalize_json_path("status.conditions[0]"), Some("status.conditions[0]".to_string()));
        assert_eq!(normalize_json_path("status.conditions.0.type"), Some("status.conditions.0.type".to_string()));
        assert!(normalize_json_path("").is_none());
        assert!(normalize_json_path("status.*").is_none());
        assert!(normalize_json_path("status..phase").is_none());
        assert!(normalize_json_path("status.x[a]").is_none());
        assert!(normalize_json_path("status.x[0][1]").is_none());
    }

    #[test]
    fn status_of_reads_configured_path() {
        let paths = StatusPaths::default().with("Job", "status.conditions[0].type").unwrap();
        let pod = serde_json::json!({"status": {"phase": "Running"}});
        let job = serde_json::json!({"status": {"conditions": [{"type": "Complete"}]}});
        let sr = serde_json::json!({"status": {"State": "Pending"}});
        assert_eq!(paths.status_of("Pod", &pod), "Running");
        assert_eq!(paths.status_of("Job", &job), "Complete");
        assert_eq!(paths.status_of("ShadowResource", &sr), "Pending");
    }

    #[test]
    fn unmapped_or_missing_is_empty() {
        let paths = StatusPaths::default();
        let cm = serde_json::json!({"data": {"a": "b"}});
        assert_eq!(paths.status_of("ConfigMap", &cm), "");
        assert_eq!(paths.status_of("Pod", &serde_json::json!({})), "");
    }

    #[test]
    fn numeric_segments_index_arrays_and_values_render() {
        let v = serde_json::json!({"status": {"replicas": 3, "ready": true, "items": [{"n": 1}]}});
        assert_eq!(extract_path(&v, "status.items.0.n").map(render), Some("1".to_string()));
        assert_eq!(extract_path(&v, "status.replicas").map(render), Some("3".to_string()));
        assert_eq!(extract_path(&v, "status.ready").map(render), Some("true".to_string()));
        assert_eq!(extract_path(&v, "status.items").map(render), Some(r#"[{"n":1}]"#.to_string()));
    }

    #[test]
    fn overrides_parse_pairs() {
        let got = parse_overrides("Deployment=status.phase, Job = status.active ,bad,=x");
        assert_eq!(got, vec![
            ("Deployment".to_string(), "status.phase".to_string()),
            ("Job".to_string(), "status.active".to_string()),
        ]);
    }
}

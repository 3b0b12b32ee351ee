use std::time::Duration;

use anyhow::{bail, Result};
use shadow_core::{ObjectType, FIELD_MANAGER, RECORD_GROUP, RECORD_KIND, RECORD_RESOURCE, RECORD_VERSION};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

/// Runtime configuration for the composite store.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Field owner attributed on every component and record apply.
    pub field_manager: String,
    /// Managed object type that persists records.
    pub record_type: ObjectType,
    /// Deadline applied to requests whose context carries none.
    pub request_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { field_manager: FIELD_MANAGER.to_string(), record_type: ObjectType::record(), request_timeout: None }
    }
}

impl Settings {
    /// Read `SHADOW_FIELD_MANAGER`, `SHADOW_RECORD_{GROUP,VERSION,RESOURCE,KIND}`
    /// and `SHADOW_REQUEST_TIMEOUT_MS` (0 or unset disables the timeout).
    pub fn from_env() -> Self {
        let request_timeout = std::env::var("SHADOW_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Self {
            field_manager: env_or("SHADOW_FIELD_MANAGER", FIELD_MANAGER),
            record_type: ObjectType {
                group: env_or("SHADOW_RECORD_GROUP", RECORD_GROUP),
                version: env_or("SHADOW_RECORD_VERSION", RECORD_VERSION),
                kind: env_or("SHADOW_RECORD_KIND", RECORD_KIND),
                resource: env_or("SHADOW_RECORD_RESOURCE", RECORD_RESOURCE),
                namespaced: true,
            },
            request_timeout,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.field_manager.trim().is_empty() {
            bail!("field manager must not be empty");
        }
        let rt = &self.record_type;
        if rt.version.is_empty() || rt.kind.is_empty() || rt.resource.is_empty() {
            bail!("record type needs version, kind and resource (got {})", rt.key());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_address_shims() {
        let s = Settings::default();
        assert_eq!(s.field_manager, "shadow");
        assert_eq!(s.record_type.api_version(), "kubesphere.io/v1");
        assert_eq!(s.record_type.resource, "shims");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_parts() {
        let mut s = Settings::default();
        s.record_type.resource.clear();
        assert!(s.validate().is_err());
        let s = Settings { field_manager: " ".into(), ..Settings::default() };
        assert!(s.validate().is_err());
    }
}

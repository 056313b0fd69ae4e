use serde::{Deserialize, Serialize};

fn default_cacheable() -> bool {
    true
}

/// What the registry knows about one action: its current version and the
/// per-action overrides applied to every dispatch of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub action: String,
    pub version: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
}

impl ActionDescriptor {
    pub fn new(action: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            version: version.into(),
            allowed_domains: Vec::new(),
            cache_ttl_ms: None,
            timeout_ms: None,
            memory_bytes: None,
            cacheable: true,
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.action, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults_from_json() {
        let d: ActionDescriptor =
            serde_json::from_str(r#"{"action":"summarize","version":"v2"}"#).unwrap();
        assert!(d.cacheable);
        assert!(d.allowed_domains.is_empty());
        assert_eq!(d.cache_ttl_ms, None);
        assert_eq!(d.target(), "summarize@v2");
    }
}

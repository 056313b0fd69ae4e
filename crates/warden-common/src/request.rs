use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::target::ActionTarget;

const MAX_TENANT_ID_LEN: usize = 128;

/// Named quota/concurrency profile assigned to a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!(
                "unknown tier '{other}', available: free, pro, enterprise"
            )),
        }
    }
}

/// One request to run an action for a tenant. Never mutated after ingress.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub action_target: ActionTarget,
    pub parameters: Value,
    pub tier: Tier,
}

impl ExecutionRequest {
    /// Builds a request, generating a `req_<uuid>` id when the caller did not supply one.
    pub fn new(
        tenant_id: impl Into<String>,
        action_target: ActionTarget,
        parameters: Value,
        tier: Tier,
        request_id: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(generate_request_id),
            tenant_id: tenant_id.into(),
            action_target,
            parameters,
            tier,
        }
    }
}

pub fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4())
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<(), String> {
    if tenant_id.is_empty() {
        return Err("tenantId must not be empty".to_string());
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(format!("tenantId exceeds {MAX_TENANT_ID_LEN} bytes"));
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("tenantId may only contain [A-Za-z0-9_.-]".to_string());
    }
    Ok(())
}

/// Parameters must be a JSON object; a missing or null value counts as `{}`.
pub fn normalize_parameters(parameters: Option<Value>) -> Result<Value, String> {
    match parameters {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(v @ Value::Object(_)) => Ok(v),
        Some(_) => Err("parameters must be a JSON object".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tenant_id_validation() {
        assert!(validate_tenant_id("t1").is_ok());
        assert!(validate_tenant_id("acme-corp.eu_1").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("a b").is_err());
        assert!(validate_tenant_id(&"t".repeat(129)).is_err());
    }

    #[test]
    fn test_normalize_parameters() {
        assert_eq!(normalize_parameters(None).unwrap(), json!({}));
        assert_eq!(normalize_parameters(Some(Value::Null)).unwrap(), json!({}));
        assert_eq!(
            normalize_parameters(Some(json!({"text": "hello"}))).unwrap(),
            json!({"text": "hello"})
        );
        assert!(normalize_parameters(Some(json!([1, 2]))).is_err());
        assert!(normalize_parameters(Some(json!("hello"))).is_err());
    }

    #[test]
    fn test_request_id_generated_when_missing() {
        let target: ActionTarget = "summarize@v2".parse().unwrap();
        let req = ExecutionRequest::new("t1", target.clone(), json!({}), Tier::Pro, None);
        assert!(req.request_id.starts_with("req_"));

        let req = ExecutionRequest::new("t1", target, json!({}), Tier::Pro, Some("abc".into()));
        assert_eq!(req.request_id, "abc");
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("PRO".parse::<Tier>(), Ok(Tier::Pro));
        assert!("gold".parse::<Tier>().is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        matches!(
            (self, required),
            (Role::Admin, _)
                | (Role::Operator, Role::Viewer | Role::Operator)
                | (Role::Viewer, Role::Viewer)
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Arc<HashMap<String, Role>>,
}

/// Parses `token:role,token:role`. Auth is enabled whenever the variable is
/// set, even if no entry is valid.
pub fn parse_auth(raw: Option<&str>) -> AuthConfig {
    let Some(raw) = raw else {
        return AuthConfig::default();
    };

    let mut tokens = HashMap::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((token, role_raw)) = trimmed.split_once(':') else {
            tracing::warn!(entry=%trimmed, "invalid WARDEN_AUTH_TOKENS entry, expected token:role");
            continue;
        };
        let role = match role_raw.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "operator" => Role::Operator,
            "viewer" => Role::Viewer,
            other => {
                tracing::warn!(role=%other, "unknown role in WARDEN_AUTH_TOKENS, skipping");
                continue;
            }
        };
        tokens.insert(token.to_string(), role);
    }

    AuthConfig {
        enabled: true,
        tokens: Arc::new(tokens),
    }
}

pub fn parse_auth_from_env() -> AuthConfig {
    let raw = std::env::var("WARDEN_AUTH_TOKENS").ok();
    if raw.is_none() {
        tracing::warn!("auth disabled: WARDEN_AUTH_TOKENS not set");
    }
    parse_auth(raw.as_deref())
}

// Generic over any state that carries an AuthConfig.
pub async fn auth_middleware<S>(
    State(state): State<S>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<AuthConfig> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();

    if !auth.enabled {
        req.extensions_mut().insert(AuthContext {
            principal: "guest".into(),
            role: Role::Admin,
        });
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_token(&req) else {
        return Ok(unauthorized("missing token"));
    };
    let Some(role) = auth.tokens.get(&token).copied() else {
        return Ok(forbidden("invalid token"));
    };

    req.extensions_mut().insert(AuthContext {
        principal: token,
        role,
    });
    Ok(next.run(req).await)
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// `None` when the caller may proceed, otherwise the 403 to return.
pub fn require_role(ctx: &AuthContext, required: Role) -> Option<Response> {
    if ctx.role.allows(required) {
        None
    } else {
        Some(forbidden("insufficient permissions"))
    }
}

pub fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": {"message": msg}})),
    )
        .into_response()
}

pub fn forbidden(msg: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({"error": {"message": msg}})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::Admin.allows(Role::Operator));
        assert!(Role::Operator.allows(Role::Viewer));
        assert!(!Role::Operator.allows(Role::Admin));
        assert!(!Role::Viewer.allows(Role::Operator));
    }

    #[test]
    fn test_parse_skips_bad_entries() {
        let auth = parse_auth(Some("a:admin, b:viewer,broken,c:root,"));
        assert!(auth.enabled);
        assert_eq!(auth.tokens.len(), 2);
        assert_eq!(auth.tokens.get("a"), Some(&Role::Admin));
        assert_eq!(auth.tokens.get("b"), Some(&Role::Viewer));

        assert!(!parse_auth(None).enabled);
    }
}

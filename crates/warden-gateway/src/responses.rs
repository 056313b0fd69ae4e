use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use warden_common::{ErrorKind, ExecutionError, ExecutionResult};

/// Body of a completed execution, including application errors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    success: bool,
    error_kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

/// A rejected or failed request, rendered with its stable kind.
#[derive(Debug)]
pub struct ApiError {
    pub request_id: Option<String>,
    pub error: ExecutionError,
}

impl ApiError {
    pub fn new(error: ExecutionError, request_id: Option<String>) -> Self {
        Self { request_id, error }
    }

    pub fn validation(message: impl Into<String>, request_id: Option<String>) -> Self {
        Self::new(ExecutionError::Validation(message.into()), request_id)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::CircuitOpen | ErrorKind::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::WorkerFailure | ErrorKind::ResourceExceeded => StatusCode::BAD_GATEWAY,
        ErrorKind::ApplicationError => StatusCode::OK,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `Retry-After` is whole seconds, rounded up.
pub fn retry_after_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let retry_after_ms = self.error.retry_after_ms();
        let body = ErrorBody {
            request_id: self.request_id.as_deref(),
            success: false,
            error_kind: kind,
            message: self.error.to_string(),
            retry_after_ms,
        };

        let mut resp = (status_for(kind), Json(body)).into_response();
        if let Some(ms) = retry_after_ms {
            resp.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(ms)),
            );
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::{FailureReason, QuotaScope};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ExecutionError::Validation("x".into()), 400),
            (
                ExecutionError::QuotaExceeded {
                    scope: QuotaScope::Daily,
                    retry_after_ms: 10,
                },
                429,
            ),
            (
                ExecutionError::CircuitOpen {
                    target: "a@1".into(),
                    retry_after_ms: 10,
                },
                503,
            ),
            (ExecutionError::Backpressure { retry_after_ms: 10 }, 503),
            (
                ExecutionError::from_failure(FailureReason::Crashed, "boom", 3),
                502,
            ),
            (
                ExecutionError::from_failure(FailureReason::MemoryExceeded, "oom", 3),
                502,
            ),
            (ExecutionError::Internal("x".into()), 500),
        ];
        for (error, status) in cases {
            let resp = ApiError::new(error, None).into_response();
            assert_eq!(resp.status().as_u16(), status);
        }
    }

    #[test]
    fn test_retry_after_header_rounds_up() {
        assert_eq!(retry_after_secs(0), 0);
        assert_eq!(retry_after_secs(1), 1);
        assert_eq!(retry_after_secs(1000), 1);
        assert_eq!(retry_after_secs(1001), 2);

        let resp = ApiError::new(
            ExecutionError::CircuitOpen {
                target: "a@1".into(),
                retry_after_ms: 29_500,
            },
            Some("req_1".into()),
        )
        .into_response();
        assert_eq!(resp.headers()[header::RETRY_AFTER], "30");

        let resp = ApiError::validation("bad", None).into_response();
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// No active virtual model runner matches the request.
    #[error("{0}")]
    NotFound(String),
    /// The runner has the requested capability switched off.
    #[error("{0}")]
    Forbidden(String),
    /// Model resolution or strict mode rejected the request.
    #[error("{0}")]
    Unauthorized(String),
    /// Healthy endpoints exist but none has spare capacity.
    #[error("{0}")]
    TooManyRequests(String),
    /// No usable endpoint, or the upstream call failed.
    #[error("{0}")]
    BadGateway(String),
    /// Request body exceeds the configured limit.
    #[error("{0}")]
    PayloadTooLarge(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NotFound(_) => StatusCode::NOT_FOUND,
            RouteError::Forbidden(_) => StatusCode::FORBIDDEN,
            RouteError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RouteError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            RouteError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            RouteError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RouteError::NotFound(String::new()).status(), StatusCode::NOT_FOUND);
        assert_eq!(RouteError::Forbidden(String::new()).status(), StatusCode::FORBIDDEN);
        assert_eq!(RouteError::Unauthorized(String::new()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RouteError::TooManyRequests(String::new()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(RouteError::BadGateway(String::new()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RouteError::PayloadTooLarge(String::new()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_error_body_carries_code_and_message() {
        let resp = RouteError::Forbidden("completions are disabled".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], 403);
        assert_eq!(json["error"]["message"], "completions are disabled");
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{SecurityError, SecurityResult};
    use crate::validator::{codes, FieldError};
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn body_json(error: SecurityError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_error_display() {
        let error = SecurityError::BadRequest("Invalid input".to_string());
        assert_eq!(format!("{}", error), "Bad request: Invalid input");

        let error = SecurityError::RateLimited { retry_after_seconds: 60 };
        assert_eq!(format!("{}", error), "Rate limited. Retry after 60 seconds");

        let error = SecurityError::Validation { field: "email".to_string(), message: "bad".to_string() };
        assert_eq!(format!("{}", error), "Validation error on field 'email': bad");

        let error = SecurityError::Config("csrf.secret is not set".to_string());
        assert_eq!(format!("{}", error), "Configuration error: csrf.secret is not set");
    }

    #[test]
    fn test_error_statuses() {
        let cases = [
            (SecurityError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (SecurityError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (SecurityError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (SecurityError::RateLimited { retry_after_seconds: 5 }, StatusCode::TOO_MANY_REQUESTS),
            (SecurityError::ValidationFailed(vec![]), StatusCode::BAD_REQUEST),
            (SecurityError::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (SecurityError::Internal(anyhow::anyhow!("boom")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = SecurityError::RateLimited { retry_after_seconds: 42 }.into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let (status, body) = body_json(SecurityError::Forbidden("Invalid CSRF token".to_string())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");
        assert_eq!(body["error"]["message"], "Invalid CSRF token");
        assert_eq!(body["status"], 403);
        assert!(body["timestamp"].is_string());
        assert!(body["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_validation_failed_lists_errors() {
        let errors = vec![FieldError {
            field: "name".to_string(),
            message: "name is required".to_string(),
            code: codes::REQUIRED,
            value: Value::Null,
        }];
        let (status, body) = body_json(SecurityError::ValidationFailed(errors)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"]["errors"][0]["code"], "REQUIRED");
        assert_eq!(body["error"]["details"]["errors"][0]["field"], "name");
    }

    #[tokio::test]
    async fn test_internal_error_hides_cause() {
        let (_, body) = body_json(SecurityError::Internal(anyhow::anyhow!("secret detail"))).await;
        assert_eq!(body["error"]["message"], "An internal server error occurred");
        assert!(body["error"]["details"]["error_id"].is_string());
        assert!(!body.to_string().contains("secret detail"));
    }

    #[test]
    fn test_security_result_question_mark() {
        fn inner() -> SecurityResult<u32> {
            let parsed = "12".parse::<u32>().map_err(|e| SecurityError::BadRequest(format!("{}", e)))?;
            Ok(parsed)
        }
        fn failing() -> SecurityResult<u32> {
            Err(anyhow::anyhow!("wrapped").into())
        }
        assert_eq!(inner().unwrap(), 12);
        assert!(matches!(failing(), Err(SecurityError::Internal(_))));
    }
}

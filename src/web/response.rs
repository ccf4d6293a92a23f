use super::pipeline::HttpResponse;
use crate::error::{AuthError, GatewayError};
use serde::Serialize;
use warp::http::{header, Response, StatusCode};
use warp::hyper::Body;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<&'a str>,
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| fallback()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response body");
            fallback()
        }
    }
}

pub fn error(status: StatusCode, message: &str) -> HttpResponse {
    json(
        status,
        &ErrorBody {
            error: message,
            redirect: None,
        },
    )
}

/// 401 for missing or bad credentials, 403 for a missing permission.
/// `redirect` points clients at the login page.
pub fn auth_failure(err: &AuthError, redirect: Option<&str>) -> HttpResponse {
    let status = match err {
        AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
        AuthError::Issue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    };
    json(
        status,
        &ErrorBody {
            error: &err.to_string(),
            redirect,
        },
    )
}

pub fn gateway_failure(err: &GatewayError) -> HttpResponse {
    let status = match err {
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Unreachable { .. } | GatewayError::InvalidResponse { .. } => {
            StatusCode::BAD_GATEWAY
        }
    };
    error(status, &err.to_string())
}

pub fn not_found() -> HttpResponse {
    error(StatusCode::NOT_FOUND, "Not found")
}

fn fallback() -> HttpResponse {
    let mut response = Response::new(Body::from(r#"{"error":"Internal server error"}"#));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_auth_failure_statuses() {
        let unauthorized = auth_failure(&AuthError::MissingDevice, Some("https://login"));
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(unauthorized).await;
        assert_eq!(body["redirect"], "https://login");
        assert!(body["error"].as_str().unwrap().contains("device"));

        let forbidden = auth_failure(&AuthError::Forbidden("admin".into()), None);
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        let body = body_json(forbidden).await;
        assert!(body.get("redirect").is_none());
    }

    #[test]
    fn test_gateway_statuses() {
        let timeout = GatewayError::Timeout {
            plugin: "p".into(),
            timeout_ms: 10,
        };
        assert_eq!(gateway_failure(&timeout).status(), StatusCode::GATEWAY_TIMEOUT);

        let down = GatewayError::Unreachable {
            plugin: "p".into(),
            reason: "refused".into(),
        };
        assert_eq!(gateway_failure(&down).status(), StatusCode::BAD_GATEWAY);
    }
}

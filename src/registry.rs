use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::auth::AuthScheme;
use crate::error::AppError;

const API_PREFIX: &str = "/api/v1";

/// Status and body of a registry call. Non-2xx is not an error at this level;
/// each caller decides what a status means for its endpoint.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the JSON body, telling an HTML error page apart from a schema mismatch
    pub fn decode<T: DeserializeOwned>(&self, context: &str) -> Result<T, AppError> {
        serde_json::from_str(&self.body).map_err(|source| {
            if looks_like_html(&self.body) {
                AppError::UnexpectedContent {
                    context: context.to_string(),
                }
            } else {
                AppError::Decode {
                    context: context.to_string(),
                    source,
                }
            }
        })
    }

    /// Decode a listing-style response: 404 means the endpoint (or resource)
    /// does not exist, other non-2xx statuses are failures.
    pub fn expect_json<T: DeserializeOwned>(&self, context: &str) -> Result<T, AppError> {
        if self.status == StatusCode::NOT_FOUND {
            Err(AppError::NotFound(context.to_string()))
        } else if self.status.is_success() {
            self.decode(context)
        } else if looks_like_html(&self.body) {
            Err(AppError::UnexpectedContent {
                context: context.to_string(),
            })
        } else {
            Err(AppError::Status {
                context: context.to_string(),
                status: self.status,
            })
        }
    }
}

fn looks_like_html(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("<html") || lower.trim_start().starts_with("<!doctype html")
}

/// Authenticated client for the registry REST API. Cheap to share: clone the
/// `Arc` it lives in, never the client itself.
#[derive(Debug)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
    auth: Option<AuthScheme>,
    permits: Arc<Semaphore>,
}

impl RegistryClient {
    /// `max_concurrent` bounds in-flight requests across all tasks sharing this client.
    pub fn new(
        registry_url: &str,
        auth: Option<AuthScheme>,
        max_concurrent: usize,
    ) -> Result<Self, AppError> {
        if registry_url.trim().is_empty() {
            return Err(AppError::EmptyBaseUrl);
        }
        let registry_url = registry_url.strip_suffix('/').unwrap_or(registry_url);
        Ok(Self {
            client: Client::new(),
            base_url: format!("{}{}", registry_url, API_PREFIX),
            auth,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, AppError> {
        self.send(Method::GET, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, AppError> {
        self.send(Method::DELETE, path).await
    }

    async fn send(&self, method: Method, path: &str) -> Result<ApiResponse, AppError> {
        let url = self.url(path);
        // The semaphore is never closed, so acquire only fails if that invariant breaks.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Config(format!("request limiter closed: {}", e)))?;

        debug!("{} {}", method, url);
        let request = self.authorize(self.client.request(method, &url));
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!("{} -> {} ({} bytes)", url, status, body.len());

        Ok(ApiResponse { status, body })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(AuthScheme::Bearer(token)) => request.bearer_auth(token),
            Some(AuthScheme::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// A ready-to-paste curl line for the registry root, when a bearer token is configured
    pub fn curl_command(&self, registry_url: &str) -> Option<String> {
        let token = self.auth.as_ref()?.bearer_token()?;
        Some(format!(
            "curl -H \"Authorization: Bearer {}\" {}",
            token, registry_url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_empty_base_url_is_rejected() {
        let err = RegistryClient::new("", None, 4).unwrap_err();
        assert!(matches!(err, AppError::EmptyBaseUrl));
    }

    #[test]
    fn test_base_url_strips_one_trailing_slash() {
        let client = RegistryClient::new("https://quay.example.com/", None, 4).unwrap();
        assert_eq!(client.base_url(), "https://quay.example.com/api/v1");
        assert_eq!(
            client.url("/repository?namespace=x"),
            "https://quay.example.com/api/v1/repository?namespace=x"
        );
    }

    #[test]
    fn test_decode_distinguishes_html() {
        let html = ApiResponse {
            status: StatusCode::OK,
            body: "<html><body>Login</body></html>".to_string(),
        };
        let err = html.decode::<serde_json::Value>("list tags").unwrap_err();
        assert!(err.is_unexpected_content());
        assert!(err.to_string().contains("HTML"));

        let garbage = ApiResponse {
            status: StatusCode::OK,
            body: "{\"tags\": 3".to_string(),
        };
        let err = garbage.decode::<serde_json::Value>("list tags").unwrap_err();
        assert!(matches!(err, AppError::Decode { .. }));
    }

    #[test]
    fn test_expect_json_maps_statuses() {
        let not_found = ApiResponse {
            status: StatusCode::NOT_FOUND,
            body: "{}".to_string(),
        };
        let err = not_found.expect_json::<serde_json::Value>("list organizations").unwrap_err();
        assert_eq!(err.to_string(), "list organizations: endpoint not found (404)");

        let forbidden = ApiResponse {
            status: StatusCode::FORBIDDEN,
            body: "{\"error\": \"denied\"}".to_string(),
        };
        let err = forbidden.expect_json::<serde_json::Value>("x").unwrap_err();
        assert!(matches!(err, AppError::Status { status, .. } if status == StatusCode::FORBIDDEN));

        let login_page = ApiResponse {
            status: StatusCode::UNAUTHORIZED,
            body: "<!DOCTYPE html><html></html>".to_string(),
        };
        assert!(login_page
            .expect_json::<serde_json::Value>("x")
            .unwrap_err()
            .is_unexpected_content());
    }

    #[test]
    fn test_curl_command_needs_bearer() {
        let client = RegistryClient::new(
            "https://q",
            Some(AuthScheme::Bearer("tok".to_string())),
            1,
        )
        .unwrap();
        assert_eq!(
            client.curl_command("https://q").as_deref(),
            Some("curl -H \"Authorization: Bearer tok\" https://q")
        );

        let basic = RegistryClient::new(
            "https://q",
            Some(AuthScheme::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
            1,
        )
        .unwrap();
        assert!(basic.curl_command("https://q").is_none());
    }

    #[tokio::test]
    async fn test_get_sends_bearer_and_passes_status_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/superuser/organizations/"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = RegistryClient::new(
            &server.uri(),
            Some(AuthScheme::Bearer("tok".to_string())),
            2,
        )
        .unwrap();
        let resp = client.get("/superuser/organizations/").await.unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.body, "nope");
    }

    #[tokio::test]
    async fn test_delete_sends_basic_auth() {
        let server = MockServer::start().await;
        // "u:p" base64
        Mock::given(method("DELETE"))
            .and(path("/api/v1/repository/org/app/tag/v1"))
            .and(header("Authorization", "Basic dTpw"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = RegistryClient::new(
            &server.uri(),
            Some(AuthScheme::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
            2,
        )
        .unwrap();
        let resp = client.delete("/repository/org/app/tag/v1").await.unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let client = RegistryClient::new("http://127.0.0.1:9", None, 1).unwrap();
        let err = client.get("/superuser/organizations/").await.unwrap_err();
        assert!(matches!(err, AppError::Http(_)));
    }
}

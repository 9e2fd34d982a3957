use anyhow::Result;
use hyper::{Body, HeaderMap, Response, StatusCode, header};
use hyper::header::HeaderValue;
use log::warn;
use serde::{Deserialize, Serialize};

/// A named cross-origin policy. Two are built in: the permissive development
/// policy and the restricted production policy; both live in the config file
/// and can be edited there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsPolicy {
    #[serde(default)]
    allow_origins: Vec<String>,
    #[serde(default)]
    allow_methods: Vec<String>,
    #[serde(default)]
    allow_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    expose_headers: Vec<String>,
    #[serde(default)]
    allow_credentials: bool,
}

impl CorsPolicy {
    /// Allow-everything policy for local development. Wildcard origin, the
    /// usual browser request headers, credentials allowed.
    pub fn permissive() -> Self {
        Self {
            allow_origins: strings(&["*"]),
            allow_methods: strings(&["GET", "POST", "PUT", "DELETE", "OPTIONS"]),
            allow_headers: strings(&["Content-Type", "Authorization", "X-Requested-With", "Accept", "Origin"]),
            expose_headers: strings(&["Content-Type", "Authorization"]),
            allow_credentials: true,
        }
    }

    /// Restricted policy for production. Origins must be listed explicitly in
    /// the config before any cross-origin read is allowed.
    pub fn restricted() -> Self {
        Self {
            allow_origins: Vec::new(),
            allow_methods: strings(&["GET", "POST", "PUT", "DELETE", "OPTIONS"]),
            allow_headers: strings(&["Content-Type", "Authorization", "X-Requested-With"]),
            expose_headers: Vec::new(),
            allow_credentials: true,
        }
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }

    /// The Access-Control-Allow-Origin value for a request, if any. A
    /// wildcard policy always answers `*`; otherwise the request's origin is
    /// echoed back only when it is listed.
    fn resolve_origin(&self, request_origin: Option<&str>) -> Option<String> {
        if self.allows_any_origin() {
            return Some("*".to_string());
        }
        let origin = request_origin?;
        self.allow_origins.iter().find(|o| o.as_str() == origin).cloned()
    }

    /// Overwrite/insert this policy's CORS headers on a response.
    pub fn apply_to(&self, request_origin: Option<&str>, headers: &mut HeaderMap) {
        if let Some(origin) = self.resolve_origin(request_origin) {
            insert_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
        }
        if !self.allow_methods.is_empty() {
            insert_header(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &self.allow_methods.join(", "));
        }
        if !self.allow_headers.is_empty() {
            insert_header(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allow_headers.join(", "));
        }
        if !self.expose_headers.is_empty() {
            insert_header(headers, header::ACCESS_CONTROL_EXPOSE_HEADERS, &self.expose_headers.join(", "));
        }
        if self.allow_credentials {
            insert_header(headers, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
    }

    /// Response for a preflight request: 200, empty body, policy headers.
    /// Never touches the upstream.
    pub fn preflight_response(&self, request_origin: Option<&str>) -> Result<Response<Body>> {
        let mut response = Response::builder().status(StatusCode::OK).body(Body::empty())?;
        self.apply_to(request_origin, response.headers_mut());
        Ok(response)
    }
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!("Skipping invalid header value for {}: {}", name, e),
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissive_applies_wildcard_origin() {
        let policy = CorsPolicy::permissive();
        let mut headers = HeaderMap::new();
        policy.apply_to(Some("http://localhost:3000"), &mut headers);

        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type, Authorization, X-Requested-With, Accept, Origin"
        );
        assert_eq!(headers.get(header::ACCESS_CONTROL_EXPOSE_HEADERS).unwrap(), "Content-Type, Authorization");
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    }

    #[test]
    fn test_permissive_wildcard_without_request_origin() {
        let policy = CorsPolicy::permissive();
        let mut headers = HeaderMap::new();
        policy.apply_to(None, &mut headers);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn test_restricted_echoes_listed_origin() {
        let mut policy = CorsPolicy::restricted();
        policy.allow_origins = vec!["https://app.example.com".to_string()];

        let mut headers = HeaderMap::new();
        policy.apply_to(Some("https://app.example.com"), &mut headers);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "https://app.example.com");
    }

    #[test]
    fn test_restricted_skips_unlisted_origin() {
        let mut policy = CorsPolicy::restricted();
        policy.allow_origins = vec!["https://app.example.com".to_string()];

        let mut headers = HeaderMap::new();
        policy.apply_to(Some("https://evil.example.com"), &mut headers);
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        // The rest of the policy headers are still set
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).is_some());
    }

    #[test]
    fn test_restricted_skips_origin_when_none_sent() {
        let policy = CorsPolicy::restricted();
        let mut headers = HeaderMap::new();
        policy.apply_to(None, &mut headers);
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_apply_overwrites_existing_headers() {
        let policy = CorsPolicy::permissive();
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("http://stale.example.com"));

        policy.apply_to(None, &mut headers);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(headers.get_all(header::ACCESS_CONTROL_ALLOW_ORIGIN).iter().count(), 1);
    }

    #[tokio::test]
    async fn test_preflight_response() {
        let policy = CorsPolicy::permissive();
        let response = policy.preflight_response(Some("http://localhost:3000")).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_policy_round_trip() {
        let policy = CorsPolicy::permissive();
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: CorsPolicy = serde_json::from_str(&json).unwrap();
        assert!(parsed.allows_any_origin());
        assert_eq!(parsed.allow_methods, policy.allow_methods);
        assert!(parsed.allow_credentials);
    }

    #[test]
    fn test_empty_policy_json_is_deny_all() {
        let policy: CorsPolicy = serde_json::from_str("{}").unwrap();
        let mut headers = HeaderMap::new();
        policy.apply_to(Some("http://localhost:3000"), &mut headers);
        assert!(headers.is_empty());
    }
}

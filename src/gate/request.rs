//! Transport-neutral view of an incoming request.

use std::collections::HashMap;

/// The parts of a request the gate inspects. Hosts convert their native
/// request type into this.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    /// Request path, matched against the principal's path restriction
    pub path: String,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// Query or route parameters
    pub params: HashMap<String, String>,
    /// Request cookies
    pub cookies: HashMap<String, String>,
}

impl GateRequest {
    /// Create a request for `path` with no credentials.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the `Authorization` header value.
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    /// Add a query or route parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Find the candidate token: the `Authorization` header, then the
    /// `param` parameter, then the `param` cookie. Empty values are skipped.
    pub fn token(&self, param: &str) -> Option<&str> {
        self.authorization
            .as_deref()
            .into_iter()
            .chain(self.params.get(param).map(String::as_str))
            .chain(self.cookies.get(param).map(String::as_str))
            .find(|candidate| !candidate.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_takes_precedence() {
        let request = GateRequest::new("/")
            .with_authorization("from-header")
            .with_param("token", "from-param")
            .with_cookie("token", "from-cookie");
        assert_eq!(request.token("token"), Some("from-header"));
    }

    #[test]
    fn test_param_then_cookie() {
        let request = GateRequest::new("/")
            .with_param("token", "from-param")
            .with_cookie("token", "from-cookie");
        assert_eq!(request.token("token"), Some("from-param"));

        let request = GateRequest::new("/").with_cookie("token", "from-cookie");
        assert_eq!(request.token("token"), Some("from-cookie"));
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let request = GateRequest::new("/")
            .with_authorization("")
            .with_cookie("token", "from-cookie");
        assert_eq!(request.token("token"), Some("from-cookie"));
    }

    #[test]
    fn test_param_name_is_respected() {
        let request = GateRequest::new("/").with_param("token", "ignored");
        assert_eq!(request.token("api_key"), None);
    }
}

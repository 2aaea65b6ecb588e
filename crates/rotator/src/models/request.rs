use serde::{Deserialize, Serialize};

/// HTTP method of an outgoing request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Options,
    Put,
    Delete,
    Trace,
    Post,
    Patch,
    Connect,
}

impl HttpMethod {
    /// Methods that may be replayed without changing the outcome.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Options | Self::Put | Self::Delete | Self::Trace
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to send through an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ProxyRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.method.is_idempotent()
    }
}

/// The endpoint's answer to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Informational, success and redirect statuses all count as delivered.
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_is_not_idempotent() {
        assert!(!ProxyRequest::post("https://example.com", b"{}".to_vec()).is_idempotent());
        assert!(!HttpMethod::Patch.is_idempotent());
        assert!(ProxyRequest::get("https://example.com").is_idempotent());
        assert!(HttpMethod::Delete.is_idempotent());
    }

    #[test]
    fn test_response_success_boundary() {
        assert!(ProxyResponse::new(200).is_success());
        assert!(ProxyResponse::new(302).is_success());
        assert!(!ProxyResponse::new(400).is_success());
        assert!(!ProxyResponse::new(503).is_success());
    }
}

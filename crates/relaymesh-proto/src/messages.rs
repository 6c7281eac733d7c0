//! HTTP messages tunnelled over the RPC stream

use bytes::Bytes;
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hop-by-hop headers, meaningful only for a single transport-level connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Message errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid HTTP message: {0}")]
    InvalidHttp(String),
}

/// An HTTP request as carried by a proxy call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Path and query
    pub uri: String,
    /// Values are raw bytes; HTTP permits non-UTF-8 octets in them
    pub headers: Vec<(String, Vec<u8>)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Build from a received request, dropping hop-by-hop headers
    pub fn from_parts(parts: &http::request::Parts, body: Bytes) -> Self {
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method: parts.method.as_str().to_string(),
            uri,
            headers: collect_headers(&parts.headers),
            body: body.to_vec(),
        }
    }

    /// Convert into an `http::Request`, dropping hop-by-hop headers
    pub fn into_http(self) -> Result<http::Request<Bytes>, MessageError> {
        let mut builder = http::Request::builder()
            .method(self.method.as_str())
            .uri(self.uri.as_str());

        for (name, value) in &self.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), header_value(name, value)?);
        }

        builder
            .body(Bytes::from(self.body))
            .map_err(|e| MessageError::InvalidHttp(e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// An HTTP response as carried by a proxy call reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Build from a received response, dropping hop-by-hop headers
    pub fn from_parts(parts: &http::response::Parts, body: Bytes) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: collect_headers(&parts.headers),
            body: body.to_vec(),
        }
    }

    /// Convert into an `http::Response`, dropping hop-by-hop headers
    pub fn into_http(self) -> Result<http::Response<Bytes>, MessageError> {
        let mut builder = http::Response::builder().status(self.status);

        for (name, value) in &self.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), header_value(name, value)?);
        }

        builder
            .body(Bytes::from(self.body))
            .map_err(|e| MessageError::InvalidHttp(e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Why a node could not produce a response for a forwarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardFailure {
    EndpointNotFound,
    Timeout,
    ConnectionLost(String),
    Upstream(String),
}

/// Outcome of a request forwarded between nodes
pub type ForwardResult = Result<HttpResponse, ForwardFailure>;

pub fn encode_forward_result(result: &ForwardResult) -> Result<Bytes, MessageError> {
    Ok(Bytes::from(bincode::serialize(result)?))
}

pub fn decode_forward_result(data: &[u8]) -> Result<ForwardResult, MessageError> {
    Ok(bincode::deserialize(data)?)
}

fn collect_headers(headers: &http::HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

fn header_value(name: &str, value: &[u8]) -> Result<HeaderValue, MessageError> {
    HeaderValue::from_bytes(value)
        .map_err(|e| MessageError::InvalidHttp(format!("header {}: {}", name, e)))
}

/// Value of the first header named `name`, if it is valid UTF-8
fn find_header<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_parts_strips_hop_by_hop() {
        let request = http::Request::builder()
            .method("POST")
            .uri("http://svc.example.com/items?page=2")
            .header("Connection", "keep-alive")
            .header("Transfer-Encoding", "chunked")
            .header("X-Trace", "abc")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let message = HttpRequest::from_parts(&parts, Bytes::from_static(b"payload"));

        assert_eq!(message.method, "POST");
        assert_eq!(message.uri, "/items?page=2");
        assert_eq!(message.header("x-trace"), Some("abc"));
        assert_eq!(message.header("connection"), None);
        assert_eq!(message.header("transfer-encoding"), None);
        assert_eq!(message.body, b"payload");
    }

    #[test]
    fn test_request_into_http() {
        let request = HttpRequest::new("PUT", "/v1/things")
            .with_header("content-type", "text/plain")
            .with_header("upgrade", "websocket")
            .with_body("hi");

        let request = request.into_http().unwrap();

        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(request.uri(), "/v1/things");
        assert_eq!(request.headers()["content-type"], "text/plain");
        assert!(request.headers().get("upgrade").is_none());
        assert_eq!(request.body(), &Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_non_utf8_header_value_kept_verbatim() {
        let response = http::Response::builder()
            .status(200)
            .header("x-latin1", HeaderValue::from_bytes(b"caf\xe9").unwrap())
            .body(())
            .unwrap();
        let (parts, _) = response.into_parts();

        let message = HttpResponse::from_parts(&parts, Bytes::new());
        assert_eq!(message.header("x-latin1"), None);

        let decoded = HttpResponse::decode(&message.encode().unwrap()).unwrap();
        let response = decoded.into_http().unwrap();
        assert_eq!(response.headers()["x-latin1"].as_bytes(), b"caf\xe9");
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let response = HttpResponse::new(200).with_header("x-bad", b"line\nbreak".to_vec());
        assert!(matches!(
            response.into_http(),
            Err(MessageError::InvalidHttp(_))
        ));
    }

    #[test]
    fn test_response_into_http_rejects_bad_status() {
        let response = HttpResponse::new(42);
        assert!(matches!(
            response.into_http(),
            Err(MessageError::InvalidHttp(_))
        ));
    }

    #[test]
    fn test_request_wire_encoding() {
        let request = HttpRequest::new("GET", "/").with_header("host", "svc.local");
        let decoded = HttpRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_forward_result_carries_failure() {
        let failure: ForwardResult = Err(ForwardFailure::ConnectionLost("reset".into()));
        let decoded = decode_forward_result(&encode_forward_result(&failure).unwrap()).unwrap();
        assert_eq!(decoded, failure);

        let ok: ForwardResult = Ok(HttpResponse::new(201).with_body("made"));
        let decoded = decode_forward_result(&encode_forward_result(&ok).unwrap()).unwrap();
        assert_eq!(decoded, ok);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(HttpResponse::decode(&[0xff, 0x01]).is_err());
    }
}

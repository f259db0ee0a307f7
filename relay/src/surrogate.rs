//! Conversions between live HTTP values and their tunnel surrogates.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use chatops_shared::protocol::{SurrogateRequest, SurrogateResponse, ValueMap};
use chatops_shared::{Error, Result};

/// Largest request or response body carried across the tunnel (10 MB).
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Form values decoded from the query string and urlencoded bodies, attached
/// to rebuilt requests as an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValues(pub ValueMap);

impl FormValues {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }
}

/// Drain `req` and capture everything a handler needs to see.
pub async fn from_request(req: Request<Body>, limit: usize) -> Result<SurrogateRequest> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| Error::Protocol(format!("invalid body: {}", e)))?
        .to_vec();

    let (proto_major, proto_minor) = version_numbers(parts.version);
    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let transfer_encoding = parts
        .headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    let form = form_values(&parts.method, &parts.headers, parts.uri.query(), &body);
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(SurrogateRequest {
        method: parts.method.as_str().to_string(),
        url,
        proto_major,
        proto_minor,
        headers: header_map(&parts.headers),
        body,
        content_length,
        transfer_encoding,
        host,
        form,
    })
}

/// Rebuild a dispatchable request whose body can be read once.
pub fn into_request(surrogate: SurrogateRequest) -> Result<Request<Body>> {
    let method = Method::from_bytes(surrogate.method.as_bytes())
        .map_err(|e| Error::Protocol(format!("invalid method {:?}: {}", surrogate.method, e)))?;
    let mut builder = Request::builder()
        .method(method)
        .uri(surrogate.url.as_str())
        .version(http_version(surrogate.proto_major, surrogate.proto_minor));

    for (name, values) in &surrogate.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if !surrogate.headers.contains_key(HOST.as_str()) && !surrogate.host.is_empty() {
        builder = builder.header(HOST, surrogate.host.as_str());
    }

    builder
        .extension(FormValues(surrogate.form))
        .body(Body::from(surrogate.body))
        .map_err(|e| Error::Protocol(format!("cannot rebuild request: {}", e)))
}

/// Capture a handler's response. Headers do not cross the tunnel.
pub async fn from_response(resp: Response) -> SurrogateResponse {
    let (parts, body) = resp.into_parts();
    match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => SurrogateResponse::with_status(parts.status.as_u16(), bytes.to_vec()),
        Err(e) => SurrogateResponse::with_status(
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            format!("response body error: {}", e),
        ),
    }
}

/// Copy a relayed response into a real one.
pub fn into_response(surrogate: SurrogateResponse) -> Response {
    let status = StatusCode::from_u16(surrogate.status()).unwrap_or(StatusCode::OK);
    (status, surrogate.into_body()).into_response()
}

fn header_map(headers: &HeaderMap) -> ValueMap {
    let mut map = ValueMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn form_values(method: &Method, headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> ValueMap {
    let mut form = ValueMap::new();

    let urlencoded = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if urlencoded && [Method::POST, Method::PUT, Method::PATCH].contains(method) {
        for (k, v) in url::form_urlencoded::parse(body) {
            form.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    if let Some(query) = query {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            form.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    form
}

fn version_numbers(version: Version) -> (u8, u8) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

fn http_version(major: u8, minor: u8) -> Version {
    match (major, minor) {
        (0, 9) => Version::HTTP_09,
        (1, 0) => Version::HTTP_10,
        (2, _) => Version::HTTP_2,
        (3, _) => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

//! Session-init request/response framing (spec.md §4.A, §6).
//!
//! The console's session-init endpoint speaks HTTP/1.1 over a plain TCP
//! socket but this crate doesn't pull in an HTTP client: the request is one
//! fixed POST with a handful of RP-specific headers, and the response is a
//! status line plus headers, so a hand-rolled builder/parser is simpler and
//! keeps the dependency stack aligned with the rest of the wire layer.

use std::collections::HashMap;

use crate::error::Error;

/// Builds the raw bytes of the session-init POST request.
///
/// `rp_key` is the registration key in the console's on-wire form (already
/// canonicalized by the caller; see `credentials::canonicalize_regkey`).
pub fn build_session_init_request(
    host: &str,
    path: &str,
    protocol_version: &str,
    rp_key_type: u8,
    rp_key: &str,
    account_id: &str,
) -> Vec<u8> {
    let headers = [
        format!("Host: {host}"),
        format!("RP-Version: {protocol_version}"),
        format!("RP-KeyType: {rp_key_type}"),
        format!("RP-Key: {rp_key}"),
        format!("RP-AccountId: {account_id}"),
        "Content-Length: 0".to_string(),
        "Connection: close".to_string(),
    ];
    let mut text = format!("POST {path} HTTP/1.1\r\n");
    for header in headers {
        text.push_str(&header);
        text.push_str("\r\n");
    }
    text.push_str("\r\n");
    text.into_bytes()
}

/// A parsed session-init response.
#[derive(Debug, Clone)]
pub struct SessionInitResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl SessionInitResponse {
    pub fn session_id(&self) -> Option<&str> {
        self.headers.get("rp-session-id").map(String::as_str)
    }
}

/// Parses a session-init HTTP response.
///
/// Unlike discovery responses, a non-200 status here is always an error:
/// there is no "standby" analogue once a session-init request has been
/// sent, so 401/403 map to `ErrorKind::AuthFailed` and anything else to
/// `Protocol`.
pub fn parse_session_init_response(raw: &[u8]) -> Result<SessionInitResponse, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::protocol("session-init response is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::protocol("session-init response missing status line"))?;

    let mut parts = status_line.splitn(3, ' ');
    let _http_version = parts
        .next()
        .ok_or_else(|| Error::protocol("session-init response missing HTTP version"))?;
    let status_code: u16 = parts
        .next()
        .ok_or_else(|| Error::protocol("session-init response missing status code"))?
        .parse()
        .map_err(|_| Error::protocol("session-init response status code is not numeric"))?;

    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    match status_code {
        200 => Ok(SessionInitResponse {
            status_code,
            headers,
        }),
        401 | 403 => Err(Error::auth_failed(format!(
            "session-init rejected with status {status_code}"
        ))),
        other => Err(Error::protocol(format!(
            "session-init returned unexpected status {other}"
        ))),
    }
}

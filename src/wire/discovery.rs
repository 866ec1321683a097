//! Discovery request/response wire codec (spec.md §4.A, §6).
//!
//! Requests are ASCII, CRLF-separated lines: an opener line containing
//! `SRCH` or `WAKEUP`, a protocol-version line, and — for `WAKEUP` — a
//! `user-credential:<hex8>` line. Responses are an HTTP-style status line
//! plus header lines.

use std::collections::HashMap;

use crate::error::Error;

/// Whether the outbound datagram is a plain scan or a wake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRequestKind {
    Search,
    Wake,
}

/// A console's advertised power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Ready,
    Standby,
    Unknown,
}

/// One outbound discovery/wake datagram, pre-encode.
#[derive(Debug, Clone)]
pub struct WireDiscoveryRequest {
    pub kind: DiscoveryRequestKind,
    pub protocol_version: String,
    pub wake_credential: Option<String>,
}

impl WireDiscoveryRequest {
    pub fn encode(&self) -> Vec<u8> {
        let opener = match self.kind {
            DiscoveryRequestKind::Search => "SRCH * HTTP/1.1",
            DiscoveryRequestKind::Wake => "WAKEUP * HTTP/1.1",
        };
        let mut lines = vec![opener.to_string(), self.protocol_version.clone()];
        if let DiscoveryRequestKind::Wake = self.kind {
            if let Some(cred) = &self.wake_credential {
                lines.push(format!("user-credential:{cred}"));
            }
        }
        let mut body = lines.join("\r\n");
        body.push_str("\r\n\r\n");
        body.into_bytes()
    }
}

/// A parsed discovery response (advertisement).
#[derive(Debug, Clone)]
pub struct WireDiscoveryResponse {
    pub state: ConsoleState,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl WireDiscoveryResponse {
    pub fn host_request_port(&self) -> Option<u16> {
        self.headers
            .get("host-request-port")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn host_name(&self) -> Option<&str> {
        self.headers.get("host-name").map(String::as_str)
    }

    /// Parses `HTTP/1.1 <code> <reason>\r\n<header: value>\r\n...\r\n\r\n`.
    ///
    /// 200 -> Ready, 620 -> Standby, anything else -> Unknown (not an error:
    /// the caller decides what to do with an unrecognised advertisement).
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::protocol("discovery response is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| Error::protocol("discovery response missing status line"))?;

        let mut parts = status_line.splitn(3, ' ');
        let _http_version = parts
            .next()
            .ok_or_else(|| Error::protocol("discovery response missing HTTP version"))?;
        let status_code: u16 = parts
            .next()
            .ok_or_else(|| Error::protocol("discovery response missing status code"))?
            .parse()
            .map_err(|_| Error::protocol("discovery response status code is not numeric"))?;

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

        let state = match status_code {
            200 => ConsoleState::Ready,
            620 => ConsoleState::Standby,
            _ => ConsoleState::Unknown,
        };

        Ok(Self {
            state,
            status_code,
            headers,
        })
    }
}

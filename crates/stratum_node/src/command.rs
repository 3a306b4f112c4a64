//! Command envelope and execution record.
//!
//! An envelope is a method line, ordered name/value headers, and a body;
//! requests and responses share the shape. A [`Command`] pairs the immutable
//! request with its mutable response and the bookkeeping the executor and
//! scheduler need.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use stratum_cluster::cluster::{Consistency, NodeId};

pub const CRLF: &str = "\r\n";

/// Ordered name/value header map. Lookups are case-insensitive; insertion
/// order is preserved on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .0
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One wire message: `VERB [ARGS]\r\n`, header lines, a blank line, then an
/// optional `Content-Length` body. Responses reuse the frame with a status
/// line such as `200 OK`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub method_line: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(method_line: impl Into<String>) -> Self {
        Self {
            method_line: method_line.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// First whitespace-delimited token of the method line.
    pub fn method(&self) -> &str {
        self.method_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
    }

    /// Leading status code of a response line, when there is one.
    pub fn status_code(&self) -> Option<&str> {
        let code = self.method_line.split_whitespace().next()?;
        (!code.is_empty() && code.bytes().all(|b| b.is_ascii_digit())).then_some(code)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.method_line.len() + self.body.len() + 64);
        out.extend_from_slice(self.method_line.as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF.as_bytes());
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}", self.body.len()).as_bytes());
            out.extend_from_slice(CRLF.as_bytes());
        }
        out.extend_from_slice(CRLF.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a complete serialized envelope, e.g. one carried inside an
    /// `ESCALATE` frame.
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let split = find_header_end(bytes).context("incomplete envelope")?;
        let head = std::str::from_utf8(&bytes[..split]).context("envelope head is not UTF-8")?;
        let mut lines = head.split(CRLF);
        let method_line = lines.next().unwrap_or_default().to_string();
        if method_line.is_empty() {
            bail!("empty method line");
        }
        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("malformed header line: {line:?}"))?;
            headers.set(name.trim(), value.trim().to_string());
        }
        let content_length = headers
            .get("Content-Length")
            .map(|v| v.parse::<usize>().context("bad Content-Length"))
            .transpose()?
            .unwrap_or(0);
        let body_start = split + 4;
        if bytes.len() < body_start + content_length {
            bail!("truncated body");
        }
        let body = bytes[body_start..body_start + content_length].to_vec();
        headers.remove("Content-Length");
        Ok(Self {
            method_line,
            headers,
            body,
        })
    }
}

/// Offset of the `\r\n\r\n` separating headers from body.
pub fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Where a finished command's response goes.
#[derive(Debug)]
pub enum ResponseRoute {
    /// A locally connected client waiting on the socket.
    Client(oneshot::Sender<Envelope>),
    /// A peer that escalated this command to us.
    Peer { node: NodeId, escalation_id: u64 },
    /// `Connection: forget`: the client was already answered `202`.
    Forgotten,
}

/// A client command moving through the peek/process lifecycle.
#[derive(Debug)]
pub struct Command {
    pub id: u64,
    pub request: Envelope,
    pub response: Envelope,
    /// Structured content a plugin built; serialized into the response body
    /// when the command completes.
    pub json_content: Map<String, Value>,
    pub peek_count: u32,
    pub process_count: u32,
    pub complete: bool,
    pub priority: i64,
    /// Microseconds since epoch; the scheduler holds the command until then.
    pub execute_after: u64,
    pub consistency: Consistency,
    pub escalated: bool,
    pub retries: u32,
    /// Times this command was parked for an outstanding HTTP request.
    pub suspend_count: u32,
    pub peek_us: u64,
    pub process_us: u64,
    pub route: ResponseRoute,
}

impl Command {
    pub fn from_request(id: u64, request: Envelope, route: ResponseRoute) -> Self {
        let priority = request
            .headers
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let execute_after = request
            .headers
            .get("commandExecuteTime")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let consistency = request
            .headers
            .get("writeConsistency")
            .and_then(Consistency::parse)
            .unwrap_or_default();
        Self {
            id,
            request,
            response: Envelope::default(),
            json_content: Map::new(),
            peek_count: 0,
            process_count: 0,
            complete: false,
            priority,
            execute_after,
            consistency,
            escalated: false,
            retries: 0,
            suspend_count: 0,
            peek_us: 0,
            process_us: 0,
            route,
        }
    }

    pub fn forget(&self) -> bool {
        self.request
            .headers
            .get("Connection")
            .map(|v| v.eq_ignore_ascii_case("forget"))
            .unwrap_or(false)
    }

    /// Clear the execution record so a transient failure can be re-run from
    /// the top of peek.
    pub fn reset_for_retry(&mut self) {
        self.response = Envelope::default();
        self.json_content = Map::new();
        self.peek_count = 0;
        self.process_count = 0;
        self.complete = false;
        self.suspend_count = 0;
        self.retries += 1;
    }
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("clientID", "7");
        headers.set("content-type", "application/json");
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Content-Type", "clientID"]);
    }

    #[test]
    fn envelope_round_trips_with_body() {
        let mut envelope = Envelope::new("Query #42");
        envelope.headers.set("writeConsistency", "QUORUM");
        envelope.headers.set("clientID", "3");
        envelope.body = b"SELECT 1;".to_vec();
        let parsed = Envelope::parse(&envelope.serialize()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.method(), "Query");
    }

    #[test]
    fn envelope_without_body_omits_content_length() {
        let envelope = Envelope::new("Status");
        let bytes = envelope.serialize();
        assert_eq!(bytes, b"Status\r\n\r\n");
        assert_eq!(Envelope::parse(&bytes).unwrap(), envelope);
    }

    #[test]
    fn status_code_only_matches_numeric_lines() {
        assert_eq!(Envelope::new("200 OK").status_code(), Some("200"));
        assert_eq!(Envelope::new("002 Socket Failed").status_code(), Some("002"));
        assert_eq!(Envelope::new("Query").status_code(), None);
    }

    #[test]
    fn command_reads_scheduling_headers() {
        let mut request = Envelope::new("idcollision");
        request.headers.set("priority", "10");
        request.headers.set("commandExecuteTime", "12345");
        request.headers.set("writeConsistency", "QUORUM");
        let cmd = Command::from_request(1, request, ResponseRoute::Forgotten);
        assert_eq!(cmd.priority, 10);
        assert_eq!(cmd.execute_after, 12345);
        assert_eq!(cmd.consistency, Consistency::Quorum);
        assert!(!cmd.forget());
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(Envelope::parse(b"Query\r\n").is_err());
        assert!(Envelope::parse(b"Query\r\nbadheader\r\n\r\n").is_err());
        let mut envelope = Envelope::new("Query");
        envelope.body = b"abc".to_vec();
        let mut bytes = envelope.serialize();
        bytes.truncate(bytes.len() - 1);
        assert!(Envelope::parse(&bytes).is_err());
    }
}

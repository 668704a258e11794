//! Envelope types carried on the tunnel

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Envelope kinds understood by both ends of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Heartbeat,
    HeartbeatAck,
    WsStart,
    WsData,
    WsClose,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 7] = [
        EnvelopeKind::Request,
        EnvelopeKind::Response,
        EnvelopeKind::Heartbeat,
        EnvelopeKind::HeartbeatAck,
        EnvelopeKind::WsStart,
        EnvelopeKind::WsData,
        EnvelopeKind::WsClose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::HeartbeatAck => "heartbeat_ack",
            EnvelopeKind::WsStart => "ws_start",
            EnvelopeKind::WsData => "ws_data",
            EnvelopeKind::WsClose => "ws_close",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of transmission on the tunnel.
///
/// `id` is a correlation id for `request`/`response` and a stream id for the
/// `ws_*` kinds. The side that originates an operation allocates its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub message: Message,
}

/// Envelope body, one payload shape per kind
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(ProxiedRequest),
    Response(ResponsePayload),
    Heartbeat,
    HeartbeatAck,
    WsStart(WsTarget),
    WsData(WsData),
    WsClose(WsClose),
}

impl Message {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Message::Request(_) => EnvelopeKind::Request,
            Message::Response(_) => EnvelopeKind::Response,
            Message::Heartbeat => EnvelopeKind::Heartbeat,
            Message::HeartbeatAck => EnvelopeKind::HeartbeatAck,
            Message::WsStart(_) => EnvelopeKind::WsStart,
            Message::WsData(_) => EnvelopeKind::WsData,
            Message::WsClose(_) => EnvelopeKind::WsClose,
        }
    }
}

impl Envelope {
    pub fn new(id: impl Into<String>, message: Message) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.message.kind()
    }

    pub fn request(id: impl Into<String>, request: ProxiedRequest) -> Self {
        Self::new(id, Message::Request(request))
    }

    pub fn response(id: impl Into<String>, response: ProxiedResponse) -> Self {
        Self::new(id, Message::Response(ResponsePayload::Success(response)))
    }

    pub fn error_response(id: impl Into<String>, error: RemoteError) -> Self {
        Self::new(id, Message::Response(ResponsePayload::Failure { error }))
    }

    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self::new(id, Message::Heartbeat)
    }

    pub fn heartbeat_ack(id: impl Into<String>) -> Self {
        Self::new(id, Message::HeartbeatAck)
    }

    pub fn ws_start(id: impl Into<String>, target: WsTarget) -> Self {
        Self::new(id, Message::WsStart(target))
    }

    pub fn ws_data(id: impl Into<String>, data: Bytes) -> Self {
        Self::new(id, Message::WsData(WsData { data }))
    }

    pub fn ws_close(id: impl Into<String>, close: WsClose) -> Self {
        Self::new(id, Message::WsClose(close))
    }
}

/// HTTP-like call proxied from the manager to an agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl ProxiedRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Result of a proxied call as executed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxiedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl ProxiedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Error descriptor sent when the agent could not execute a request locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// `response` payload: either the proxied response or an error descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Failure { error: RemoteError },
    Success(ProxiedResponse),
}

/// Local streaming endpoint the agent should open for a `ws_start`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WsTarget {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl WsTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    /// Path and query joined the way they appear in a request line
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsData {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

/// `ws_close` payload; both fields are optional on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WsClose {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WsClose {
    /// Normal closure (WebSocket close code 1000)
    pub fn normal() -> Self {
        Self {
            code: Some(1000),
            reason: None,
        }
    }

    pub fn with_reason(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// Bodies travel as standard base64 strings inside the JSON payload
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

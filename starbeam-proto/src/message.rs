use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header maps are ordered so a message always encodes to the same bytes.
pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Relay-side port assignment handed out in `register_ack`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub http: u16,
    pub https: u16,
    pub rtsp: u16,
    pub video: u16,
    pub audio: u16,
    pub control: u16,
}

/// Streaming capabilities advertised at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<u32>,
    #[serde(default)]
    pub video_codecs: Vec<String>,
    #[serde(default)]
    pub audio_codecs: Vec<String>,
}

impl HostCapabilities {
    /// The codec set the co-located streaming server always offers.
    pub fn streaming_defaults() -> Self {
        Self {
            video_codecs: vec!["H264".into(), "HEVC".into(), "AV1".into()],
            audio_codecs: vec!["opus".into()],
            ..Self::default()
        }
    }
}

/// Media channel identifier used by `udp_channel_setup` / `udp_channel_ack`.
///
/// Unrecognized strings parse as `Video`; the relay has only ever emitted the
/// three known names and the default keeps a drifted peer limping instead of
/// dropping the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChannelType {
    Video,
    Audio,
    Control,
}

impl ChannelType {
    pub fn parse(s: &str) -> Self {
        match s {
            "audio" => ChannelType::Audio,
            "control" => ChannelType::Control,
            _ => ChannelType::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Video => "video",
            ChannelType::Audio => "audio",
            ChannelType::Control => "control",
        }
    }
}

impl From<String> for ChannelType {
    fn from(s: String) -> Self {
        ChannelType::parse(&s)
    }
}

impl From<ChannelType> for String {
    fn from(t: ChannelType) -> Self {
        t.as_str().to_owned()
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration handshake, first frame the agent sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub hostname: String,
    pub unique_id: String,
    pub auth_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub capabilities: HostCapabilities,
}

/// Registration accepted; durable identity and relay-side ports assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub host_id: String,
    pub ports: PortAssignment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_address: Option<String>,
}

/// Server-side diagnostic; carried by both `error` and `register_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// Tunneled HTTP request to replay onto the loopback nvhttp server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub id: u64,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub is_https: bool,
    pub client_addr: String,
}

/// Reply to a tunneled HTTP request, matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub id: u64,
    pub status: u16,
    pub headers: HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Tunneled RTSP request to replay onto the loopback RTSP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtspRequest {
    pub id: u64,
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub client_addr: String,
}

/// Reply to a tunneled RTSP request, matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtspResponse {
    pub id: u64,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Request to open a media forwarding channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpChannelSetup {
    pub session_id: u64,
    pub channel: ChannelType,
    pub client_addr: String,
}

/// Channel setup result. `local_port = 0` signals failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UdpChannelAck {
    pub session_id: u64,
    pub channel: ChannelType,
    pub relay_port: u16,
    pub local_port: u16,
}

/// A streaming session began on the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: u64,
    pub client_id: String,
    pub client_addr: String,
}

/// A streaming session ended; sent by either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub session_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One control-plane frame, tagged by `"type"`. Absent optionals are omitted
/// on the wire and unknown input fields are ignored, so both peers can grow
/// the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register(Register),
    RegisterAck(RegisterAck),
    RegisterError(ErrorInfo),
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    RtspRequest(RtspRequest),
    RtspResponse(RtspResponse),
    UdpChannelSetup(UdpChannelSetup),
    UdpChannelAck(UdpChannelAck),
    /// Reserved.
    UdpChannelClose,
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    Ping { ts: u64 },
    /// Keepalive echo; `ts` is copied from the ping.
    Pong { ts: u64 },
    Error(ErrorInfo),
}

impl ControlMessage {
    pub fn decode(json: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Discriminator tags, including the catch-all for frames this build does not
/// know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Register,
    RegisterAck,
    RegisterError,
    HttpRequest,
    HttpResponse,
    RtspRequest,
    RtspResponse,
    UdpChannelSetup,
    UdpChannelAck,
    UdpChannelClose,
    SessionStart,
    SessionEnd,
    Ping,
    Pong,
    Error,
    Unknown,
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    tag: String,
}

/// Read only the `"type"` discriminator so callers can route (or name an
/// unknown frame in a log line) without decoding the full payload.
pub fn message_type(json: &str) -> MessageType {
    let tag = match serde_json::from_str::<TypeTag>(json) {
        Ok(t) => t.tag,
        Err(_) => return MessageType::Unknown,
    };
    match tag.as_str() {
        "register" => MessageType::Register,
        "register_ack" => MessageType::RegisterAck,
        "register_error" => MessageType::RegisterError,
        "http_request" => MessageType::HttpRequest,
        "http_response" => MessageType::HttpResponse,
        "rtsp_request" => MessageType::RtspRequest,
        "rtsp_response" => MessageType::RtspResponse,
        "udp_channel_setup" => MessageType::UdpChannelSetup,
        "udp_channel_ack" => MessageType::UdpChannelAck,
        "udp_channel_close" => MessageType::UdpChannelClose,
        "session_start" => MessageType::SessionStart,
        "session_end" => MessageType::SessionEnd,
        "ping" => MessageType::Ping,
        "pong" => MessageType::Pong,
        "error" => MessageType::Error,
        _ => MessageType::Unknown,
    }
}

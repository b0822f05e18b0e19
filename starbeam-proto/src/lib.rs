//! Control-plane message family for the Starbeam relay protocol.
//!
//! Every frame on the control WebSocket is one UTF-8 JSON object tagged by a
//! `"type"` field. This crate owns the typed message set and its wire
//! encoding; it performs no I/O.

pub mod message;

pub use message::{
    ChannelType, CodecError, ControlMessage, ErrorInfo, HeaderMap, HostCapabilities, HttpRequest,
    HttpResponse, MessageType, PortAssignment, Register, RegisterAck, RtspRequest, RtspResponse,
    SessionEnd, SessionStart, UdpChannelAck, UdpChannelSetup,
};

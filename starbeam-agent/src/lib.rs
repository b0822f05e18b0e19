//! Relay-tunneled edge agent for a Moonlight-compatible streaming host.
//!
//! The agent keeps one outbound WebSocket to the Starbeam relay, replays
//! tunneled HTTP/RTSP requests onto the co-located Sunshine servers, and
//! shuttles media datagrams over on-demand UDP channels. This module is the
//! process-wide facade: `initialize()` wires everything together and starts
//! the client, `shutdown()` tears it all down.

pub mod bridge;
pub mod client;
pub mod config;
pub mod net;
pub mod udp;

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use log::{error, info, warn};

use starbeam_proto::message::{
    HttpRequest, HttpResponse, PortAssignment, RtspRequest, RtspResponse, SessionEnd,
    SessionStart, UdpChannelAck, UdpChannelSetup,
};

pub use bridge::LoopbackBridge;
pub use client::{Client, ConnectionState, ServerUrl, TunnelHandler};
pub use config::StarbeamConfig;
pub use udp::ChannelManager;

struct Agent {
    client: Arc<Client>,
    channels: Arc<ChannelManager>,
}

static AGENT: Mutex<Option<Agent>> = Mutex::new(None);

/// Production wiring: tunneled requests go to the loopback bridge, UDP setup
/// to the channel manager, and registration arms the manager with the
/// relay-side media ports.
struct AgentHandler {
    bridge: LoopbackBridge,
    channels: Arc<ChannelManager>,
}

impl TunnelHandler for AgentHandler {
    fn handle_http(&self, req: HttpRequest) -> BoxFuture<'_, HttpResponse> {
        let bridge = self.bridge;
        Box::pin(async move { bridge.forward_http(req).await })
    }

    fn handle_rtsp(&self, req: RtspRequest) -> BoxFuture<'_, RtspResponse> {
        let bridge = self.bridge;
        Box::pin(async move { bridge.forward_rtsp(req).await })
    }

    fn handle_udp_setup(&self, setup: UdpChannelSetup) -> UdpChannelAck {
        self.channels.handle_channel_setup(&setup)
    }

    fn registered(&self, relay_host: &str, ports: &PortAssignment) {
        self.channels
            .initialize(relay_host, ports.video, ports.audio, ports.control);
    }

    fn session_started(&self, start: &SessionStart) {
        info!(
            "starbeam: session {} started for client '{}' ({})",
            start.session_id, start.client_id, start.client_addr
        );
    }

    fn session_ended(&self, end: &SessionEnd) {
        info!(
            "starbeam: session {} ended{}",
            end.session_id,
            end.reason
                .as_deref()
                .map(|r| format!(": {r}"))
                .unwrap_or_default()
        );
    }
}

/// Read configuration, build and start the agent. Returns false when the
/// agent is disabled or misconfigured; true when it is running (including
/// when it already was).
pub fn initialize() -> bool {
    let cfg = StarbeamConfig::from_env();
    if !cfg.enabled {
        info!("starbeam: disabled in configuration");
        return false;
    }

    let mut guard = AGENT.lock().unwrap();
    if guard.is_some() {
        warn!("starbeam: already initialized");
        return true;
    }

    if cfg.server_url.is_empty() {
        error!("starbeam: server URL not configured");
        return false;
    }
    if cfg.auth_key.is_empty() {
        error!("starbeam: auth key not configured");
        return false;
    }

    let channels = Arc::new(ChannelManager::new(cfg.sunshine_port));

    let mut client = Client::new(
        cfg.server_url.clone(),
        cfg.auth_key.clone(),
        cfg.host_id.clone(),
    );
    client.set_reconnect_interval(cfg.reconnect_interval);
    client.set_tls_accept_invalid(cfg.tls_accept_invalid);
    if !cfg.sunshine_name.is_empty() {
        client.set_hostname(cfg.sunshine_name.clone());
    }

    let client = Arc::new(client);
    client.set_handler(Arc::new(AgentHandler {
        bridge: LoopbackBridge::new(cfg.sunshine_port),
        channels: Arc::clone(&channels),
    }));

    if !client.start() {
        error!("starbeam: failed to start client");
        return false;
    }

    info!("starbeam: initialized and connecting to {}", cfg.server_url);
    *guard = Some(Agent { client, channels });
    true
}

/// Stop the client, tear down UDP channels, drop the global handle.
pub fn shutdown() {
    let agent = AGENT.lock().unwrap().take();
    if let Some(agent) = agent {
        agent.client.stop();
        agent.channels.shutdown();
    }
    info!("starbeam: shutdown complete");
}

pub fn is_enabled() -> bool {
    StarbeamConfig::from_env().enabled
}

/// True while the agent is registered with the relay.
pub fn is_active() -> bool {
    AGENT
        .lock()
        .unwrap()
        .as_ref()
        .map(|agent| agent.client.is_ready())
        .unwrap_or(false)
}

/// Notify the relay that a streaming session ended. No-op while the agent is
/// not initialized or not connected.
pub fn send_session_end(session_id: u64, reason: &str) {
    if let Some(agent) = AGENT.lock().unwrap().as_ref() {
        agent.client.send_session_end(session_id, reason);
    }
}

//! Control-plane client: one durable outbound WebSocket to the relay.
//!
//! The client owns a dedicated OS thread running a current-thread tokio
//! runtime. A supervisor loop connects, registers, pumps messages until the
//! connection dies, then waits out the reconnect interval and tries again.
//! Tunneled requests are dispatched inline on the read task, so replies stay
//! strictly FIFO with the requests that caused them; every write (including
//! `send_session_end` from foreign threads) funnels through one channel
//! drained by a writer task that owns the sink half of the socket.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use url::Url;

use starbeam_proto::message::{
    message_type, ControlMessage, HostCapabilities, HttpRequest, HttpResponse, PortAssignment,
    Register, RtspRequest, RtspResponse, SessionEnd, SessionStart, UdpChannelAck, UdpChannelSetup,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Registered = 3,
    Error = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Registered,
            4 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Everything the relay forwards to the agent lands here. One implementation
/// is installed before `start()` and serves for the life of the client.
///
/// `handle_http` / `handle_rtsp` run inline on the read task; a slow upstream
/// stalls the control plane for the duration, which is acceptable because the
/// protocol is request-reply on a single connection.
pub trait TunnelHandler: Send + Sync + 'static {
    fn handle_http(&self, req: HttpRequest) -> BoxFuture<'_, HttpResponse>;
    fn handle_rtsp(&self, req: RtspRequest) -> BoxFuture<'_, RtspResponse>;
    fn handle_udp_setup(&self, setup: UdpChannelSetup) -> UdpChannelAck;

    /// Registration completed; `relay_host` is the host from the server URL.
    fn registered(&self, _relay_host: &str, _ports: &PortAssignment) {}
    fn session_started(&self, _start: &SessionStart) {}
    fn session_ended(&self, _end: &SessionEnd) {}
}

pub type StateChangeHandler = Box<dyn Fn(ConnectionState, ConnectionState) + Send + 'static>;

/// Parsed relay endpoint. Scheme is case-insensitive; port defaults to
/// 443/80 by scheme and the path to `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl ServerUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid URL '{raw}'"))?;
        let tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => bail!("unsupported scheme '{other}' (expected ws or wss)"),
        };
        let host = url
            .host_str()
            .with_context(|| format!("URL '{raw}' has no host"))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 443 } else { 80 });
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    fn ws_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            if self.tls { "wss" } else { "ws" },
            self.host,
            self.port,
            self.path
        )
    }
}

#[derive(Default)]
struct Assigned {
    host_id: String,
    ports: Option<PortAssignment>,
    external_address: Option<String>,
}

pub struct Client {
    server_url: String,
    auth_key: String,
    configured_host_id: String,
    hostname: String,
    unique_id: String,
    capabilities: HostCapabilities,
    reconnect_interval: Duration,
    tls_accept_invalid: bool,

    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
    handler: Mutex<Option<Arc<dyn TunnelHandler>>>,
    state_handler: Mutex<Option<StateChangeHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    assigned: Mutex<Assigned>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(server_url: String, auth_key: String, host_id: String) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        // Stable for the life of the process; reconnections reuse it so the
        // relay can correlate sessions from the same boot.
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let unique_id = format!("{hostname}_{nonce}");
        let (stop_tx, _) = watch::channel(false);

        Self {
            server_url,
            auth_key,
            configured_host_id: host_id,
            hostname,
            unique_id,
            capabilities: HostCapabilities::streaming_defaults(),
            reconnect_interval: Duration::from_secs(5),
            tls_accept_invalid: false,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            stop_tx,
            handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            outbound: Mutex::new(None),
            assigned: Mutex::new(Assigned::default()),
            io_thread: Mutex::new(None),
        }
    }

    /// Display name sent at registration. Does not touch `unique_id`, which
    /// keeps the OS hostname it was derived from.
    pub fn set_hostname(&mut self, hostname: String) {
        self.hostname = hostname;
    }

    pub fn set_reconnect_interval(&mut self, interval: Duration) {
        self.reconnect_interval = interval;
    }

    pub fn set_tls_accept_invalid(&mut self, accept: bool) {
        self.tls_accept_invalid = accept;
    }

    pub fn set_capabilities(&mut self, capabilities: HostCapabilities) {
        self.capabilities = capabilities;
    }

    pub fn set_handler(&self, handler: Arc<dyn TunnelHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn set_state_handler(
        &self,
        handler: impl Fn(ConnectionState, ConnectionState) + Send + 'static,
    ) {
        *self.state_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Relay-assigned host id; empty unless registered.
    pub fn host_id(&self) -> String {
        self.assigned.lock().unwrap().host_id.clone()
    }

    pub fn ports(&self) -> Option<PortAssignment> {
        self.assigned.lock().unwrap().ports
    }

    pub fn external_address(&self) -> Option<String> {
        self.assigned.lock().unwrap().external_address.clone()
    }

    /// Spawn the control thread. Returns true if the client is running
    /// afterwards; calling on an already-running client is a no-op.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut guard = self.io_thread.lock().unwrap();
        if guard.is_some() {
            return true;
        }
        // send_replace: the flag must flip even before the supervisor has
        // subscribed a receiver.
        self.stop_tx.send_replace(false);

        let client = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("starbeam-control".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("starbeam: failed to build control runtime: {e}");
                        return;
                    }
                };
                rt.block_on(client.run());
            });

        match spawned {
            Ok(handle) => {
                *guard = Some(handle);
                true
            }
            Err(e) => {
                error!("starbeam: failed to spawn control thread: {e}");
                false
            }
        }
    }

    /// Stop the supervisor loop and join the control thread. Safe to call
    /// more than once.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.io_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("starbeam: control thread panicked");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Tell the relay a streaming session is over. Callable from any thread;
    /// silently dropped while disconnected (the relay notices the teardown on
    /// its own side).
    pub fn send_session_end(&self, session_id: u64, reason: &str) {
        let msg = ControlMessage::SessionEnd(SessionEnd {
            session_id,
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        });
        let tx = self.outbound.lock().unwrap().clone();
        match tx {
            Some(tx) => match msg.encode() {
                Ok(json) => {
                    if tx.send(Message::Text(json)).is_err() {
                        debug!("starbeam: dropping session_end, writer already gone");
                    }
                }
                Err(e) => error!("starbeam: failed to encode session_end: {e}"),
            },
            None => debug!("starbeam: dropping session_end, not connected"),
        }
    }

    fn handler(&self) -> Option<Arc<dyn TunnelHandler>> {
        self.handler.lock().unwrap().clone()
    }

    fn set_state(&self, new: ConnectionState) {
        let old = ConnectionState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        if old != new {
            debug!("starbeam: state {old:?} -> {new:?}");
            let guard = self.state_handler.lock().unwrap();
            if let Some(cb) = guard.as_ref() {
                cb(old, new);
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.run_connection(&mut stop_rx).await;

            // Assigned identity is only valid for the session that granted it.
            *self.assigned.lock().unwrap() = Assigned::default();
            *self.outbound.lock().unwrap() = None;

            if *stop_rx.borrow() {
                break;
            }
            info!(
                "starbeam: reconnecting in {}s...",
                self.reconnect_interval.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn tls_connector(&self) -> Result<Connector> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
        if self.tls_accept_invalid {
            warn!("starbeam: TLS certificate verification disabled by configuration");
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        Ok(Connector::NativeTls(
            builder.build().context("build TLS connector")?,
        ))
    }

    /// One full connection lifetime: connect, register, pump until the
    /// socket dies or stop is requested. State transitions happen here; the
    /// caller only owns the backoff.
    async fn run_connection(&self, stop_rx: &mut watch::Receiver<bool>) {
        self.set_state(ConnectionState::Connecting);

        let target = match ServerUrl::parse(&self.server_url) {
            Ok(target) => target,
            Err(e) => {
                error!("starbeam: {e:#}");
                self.set_state(ConnectionState::Error);
                return;
            }
        };

        info!("starbeam: connecting to {}", self.server_url);

        let connector = if target.tls {
            match self.tls_connector() {
                Ok(connector) => Some(connector),
                Err(e) => {
                    error!("starbeam: {e:#}");
                    self.set_state(ConnectionState::Error);
                    return;
                }
            }
        } else {
            None
        };

        let connect = connect_async_tls_with_config(target.ws_url(), None, false, connector);
        let ws = tokio::select! {
            result = connect => match result {
                Ok((ws, _resp)) => ws,
                Err(e) => {
                    error!("starbeam: connection failed: {e}");
                    self.set_state(ConnectionState::Error);
                    return;
                }
            },
            _ = stop_rx.wait_for(|stopped| *stopped) => return,
        };

        info!(
            "starbeam: connected ({})",
            if target.tls { "wss" } else { "ws" }
        );
        self.set_state(ConnectionState::Connected);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().unwrap() = Some(out_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    debug!("starbeam: write failed: {e}");
                    break;
                }
            }
        });

        self.send_registration(&out_tx);

        loop {
            let next = tokio::select! {
                next = ws_rx.next() => next,
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    if !self.handle_frame(&text, &target.host, &out_tx).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("starbeam: connection closed by relay");
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                Some(Ok(_)) => {
                    // Control plane is text-only; binary and low-level frames
                    // are not ours to interpret.
                }
                Some(Err(e)) => {
                    if !matches!(
                        e,
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    ) {
                        error!("starbeam: read error: {e}");
                    }
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
            }
        }

        *self.outbound.lock().unwrap() = None;
        drop(out_tx);
        let _ = writer.await;
    }

    fn send_registration(&self, out_tx: &mpsc::UnboundedSender<Message>) {
        let register = ControlMessage::Register(Register {
            hostname: self.hostname.clone(),
            unique_id: self.unique_id.clone(),
            auth_key: self.auth_key.clone(),
            host_id: (!self.configured_host_id.is_empty())
                .then(|| self.configured_host_id.clone()),
            capabilities: self.capabilities.clone(),
        });
        self.send_now(out_tx, register);
        info!("starbeam: sent registration as '{}'", self.hostname);
    }

    fn send_now(&self, out_tx: &mpsc::UnboundedSender<Message>, msg: ControlMessage) {
        match msg.encode() {
            Ok(json) => {
                if out_tx.send(Message::Text(json)).is_err() {
                    debug!("starbeam: writer gone, dropping outbound message");
                }
            }
            Err(e) => error!("starbeam: failed to encode outbound message: {e}"),
        }
    }

    /// Dispatch one inbound frame. Returns false when the connection should
    /// be torn down.
    async fn handle_frame(
        &self,
        text: &str,
        relay_host: &str,
        out_tx: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let msg = match ControlMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "starbeam: dropping undecodable control message ({:?}): {e}",
                    message_type(text)
                );
                return true;
            }
        };

        match msg {
            ControlMessage::RegisterAck(ack) => {
                {
                    let mut assigned = self.assigned.lock().unwrap();
                    assigned.host_id = ack.host_id.clone();
                    assigned.ports = Some(ack.ports);
                    assigned.external_address = ack.external_address.clone();
                }
                self.set_state(ConnectionState::Registered);
                info!(
                    "starbeam: registered as '{}' with HTTP port {}",
                    ack.host_id, ack.ports.http
                );
                if let Some(handler) = self.handler() {
                    handler.registered(relay_host, &ack.ports);
                }
            }

            ControlMessage::RegisterError(err) => {
                error!(
                    "starbeam: registration failed: {} - {}",
                    err.code, err.message
                );
                self.set_state(ConnectionState::Error);
                return false;
            }

            ControlMessage::HttpRequest(req) => {
                let id = req.id;
                let response = match self.handler() {
                    Some(handler) => handler.handle_http(req).await,
                    None => {
                        error!("starbeam: no tunnel handler installed for HTTP request {id}");
                        HttpResponse {
                            id,
                            status: 500,
                            headers: Default::default(),
                            body: Some("Internal Server Error".to_string()),
                        }
                    }
                };
                self.send_now(out_tx, ControlMessage::HttpResponse(response));
            }

            ControlMessage::RtspRequest(req) => {
                let id = req.id;
                let response = match self.handler() {
                    Some(handler) => handler.handle_rtsp(req).await,
                    None => {
                        error!("starbeam: no tunnel handler installed for RTSP request {id}");
                        RtspResponse {
                            id,
                            status: 500,
                            reason: "Internal Server Error".to_string(),
                            headers: Default::default(),
                            body: None,
                        }
                    }
                };
                self.send_now(out_tx, ControlMessage::RtspResponse(response));
            }

            ControlMessage::UdpChannelSetup(setup) => {
                let ack = match self.handler() {
                    Some(handler) => handler.handle_udp_setup(setup),
                    None => {
                        error!("starbeam: no tunnel handler installed for UDP channel setup");
                        UdpChannelAck {
                            session_id: setup.session_id,
                            channel: setup.channel,
                            relay_port: 0,
                            local_port: 0,
                        }
                    }
                };
                self.send_now(out_tx, ControlMessage::UdpChannelAck(ack));
            }

            ControlMessage::SessionStart(start) => {
                if let Some(handler) = self.handler() {
                    handler.session_started(&start);
                }
            }

            ControlMessage::SessionEnd(end) => {
                if let Some(handler) = self.handler() {
                    handler.session_ended(&end);
                }
            }

            ControlMessage::Ping { ts } => {
                self.send_now(out_tx, ControlMessage::Pong { ts });
            }

            ControlMessage::Error(err) => {
                error!(
                    "starbeam: error from relay: {} - {}",
                    err.code, err.message
                );
            }

            ControlMessage::UdpChannelClose => {
                debug!("starbeam: ignoring reserved udp_channel_close");
            }

            other => {
                warn!("starbeam: unexpected inbound message: {other:?}");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_defaults_port_and_path() {
        let parsed = ServerUrl::parse("ws://relay.example.com").unwrap();
        assert_eq!(parsed.host, "relay.example.com");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/");
        assert!(!parsed.tls);

        let parsed = ServerUrl::parse("wss://relay.example.com").unwrap();
        assert_eq!(parsed.port, 443);
        assert!(parsed.tls);
    }

    #[test]
    fn server_url_honors_explicit_port_and_path() {
        let parsed = ServerUrl::parse("wss://relay.example.com:9/x").unwrap();
        assert_eq!(parsed.host, "relay.example.com");
        assert_eq!(parsed.port, 9);
        assert_eq!(parsed.path, "/x");
        assert!(parsed.tls);
    }

    #[test]
    fn server_url_scheme_is_case_insensitive() {
        let parsed = ServerUrl::parse("WSS://relay.example.com").unwrap();
        assert!(parsed.tls);
        assert_eq!(parsed.port, 443);
    }

    #[test]
    fn server_url_keeps_query() {
        let parsed = ServerUrl::parse("ws://relay.example.com/agent?token=abc").unwrap();
        assert_eq!(parsed.path, "/agent?token=abc");
    }

    #[test]
    fn server_url_rejects_other_schemes() {
        assert!(ServerUrl::parse("http://relay.example.com").is_err());
        assert!(ServerUrl::parse("not a url").is_err());
    }

    #[test]
    fn unique_id_derives_from_hostname_and_stays_fixed() {
        let client = Client::new("ws://r".into(), "k".into(), String::new());
        let id = client.unique_id().to_string();
        assert!(id.contains('_'));
        assert_eq!(client.unique_id(), id);
    }
}

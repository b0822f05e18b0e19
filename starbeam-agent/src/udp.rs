//! Media-plane UDP relay: one socket per channel type, forwarding datagrams
//! between the relay's media port and the local Sunshine media port.
//!
//! A single socket carries both directions. The worker decides where a
//! datagram goes next by the sender's address: packets from the relay's
//! address go to the local endpoint, everything else goes to the relay.
//! That discrimination requires the relay and the local server to live at
//! distinguishable addresses (relay vs 127.0.0.1). Payloads are forwarded
//! verbatim, in arrival order per channel.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use starbeam_proto::message::{ChannelType, UdpChannelAck, UdpChannelSetup};

/// Largest possible UDP payload.
const RECV_BUFFER_LEN: usize = 65_535;

/// Idle wakeup so workers notice cleared running flags without a
/// cross-thread socket close.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Sunshine derives its media UDP ports from the configured base TCP port.
pub fn sunshine_port(base_port: u16, channel: ChannelType) -> u16 {
    match channel {
        ChannelType::Video => base_port + 9,
        ChannelType::Audio => base_port + 10,
        ChannelType::Control => base_port + 8,
    }
}

struct Channel {
    local_port: u16,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

struct ManagerState {
    relay_host: String,
    relay_video_port: u16,
    relay_audio_port: u16,
    relay_control_port: u16,
    channels: HashMap<ChannelType, Channel>,
}

pub struct ChannelManager {
    base_port: u16,
    running: Arc<AtomicBool>,
    state: Mutex<Option<ManagerState>>,
}

impl ChannelManager {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Arm the manager with the relay's media ports, learned from
    /// `register_ack`. A second call while running is a no-op.
    pub fn initialize(
        &self,
        relay_host: &str,
        relay_video_port: u16,
        relay_audio_port: u16,
        relay_control_port: u16,
    ) -> bool {
        let mut guard = self.state.lock().unwrap();
        if self.running.load(Ordering::Acquire) {
            return true;
        }
        *guard = Some(ManagerState {
            relay_host: relay_host.to_string(),
            relay_video_port,
            relay_audio_port,
            relay_control_port,
            channels: HashMap::new(),
        });
        self.running.store(true, Ordering::Release);
        info!(
            "starbeam::udp: initialized with relay {relay_host} \
             (video:{relay_video_port} audio:{relay_audio_port} control:{relay_control_port})"
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Local port of a live channel, 0 if none.
    pub fn local_port(&self, channel: ChannelType) -> u16 {
        let guard = self.state.lock().unwrap();
        guard
            .as_ref()
            .and_then(|state| state.channels.get(&channel))
            .map(|ch| ch.local_port)
            .unwrap_or(0)
    }

    /// Create (or re-report) the forwarding channel for `setup.channel`.
    /// `local_port = 0` in the ack signals failure; a repeated setup for a
    /// live channel returns the existing port.
    pub fn handle_channel_setup(&self, setup: &UdpChannelSetup) -> UdpChannelAck {
        let mut ack = UdpChannelAck {
            session_id: setup.session_id,
            channel: setup.channel,
            relay_port: 0,
            local_port: 0,
        };

        if !self.running.load(Ordering::Acquire) {
            error!("starbeam::udp: channel manager not running");
            return ack;
        }

        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return ack;
        };

        let relay_port = match setup.channel {
            ChannelType::Video => state.relay_video_port,
            ChannelType::Audio => state.relay_audio_port,
            ChannelType::Control => state.relay_control_port,
        };

        if let Some(existing) = state.channels.get(&setup.channel) {
            ack.relay_port = relay_port;
            ack.local_port = existing.local_port;
            return ack;
        }

        match self.open_channel(state, setup.channel, relay_port) {
            Ok(local_port) => {
                ack.relay_port = relay_port;
                ack.local_port = local_port;
            }
            Err(e) => {
                error!(
                    "starbeam::udp: failed to create {} channel: {e:#}",
                    setup.channel
                );
            }
        }
        ack
    }

    fn open_channel(
        &self,
        state: &mut ManagerState,
        channel: ChannelType,
        relay_port: u16,
    ) -> Result<u16> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).context("bind forwarding socket")?;
        socket
            .set_read_timeout(Some(WORKER_POLL_INTERVAL))
            .context("set read timeout")?;
        let local_port = socket.local_addr().context("query local port")?.port();

        let relay_endpoint = (state.relay_host.as_str(), relay_port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{relay_port}", state.relay_host))?
            .next()
            .context("relay endpoint resolved to nothing")?;
        let local_endpoint: SocketAddr =
            ([127, 0, 0, 1], sunshine_port(self.base_port, channel)).into();

        let channel_running = Arc::new(AtomicBool::new(true));
        let worker = {
            let channel_running = Arc::clone(&channel_running);
            let manager_running = Arc::clone(&self.running);
            std::thread::Builder::new()
                .name(format!("starbeam-udp-{channel}"))
                .spawn(move || {
                    forward_loop(
                        &socket,
                        relay_endpoint,
                        local_endpoint,
                        &channel_running,
                        &manager_running,
                        channel,
                    )
                })
                .context("spawn forwarding worker")?
        };

        info!(
            "starbeam::udp: created {channel} channel (local:{local_port} -> relay:{relay_port})"
        );
        state.channels.insert(
            channel,
            Channel {
                local_port,
                running: channel_running,
                worker: Some(worker),
            },
        );
        Ok(local_port)
    }

    /// Tear everything down and join the workers. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);

        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.take() else {
            return;
        };
        for (channel, mut ch) in state.channels {
            ch.running.store(false, Ordering::Release);
            if let Some(worker) = ch.worker.take() {
                if worker.join().is_err() {
                    error!("starbeam::udp: {channel} worker panicked");
                }
            }
        }
        info!("starbeam::udp: shutdown complete");
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward_loop(
    socket: &UdpSocket,
    relay: SocketAddr,
    local: SocketAddr,
    channel_running: &AtomicBool,
    manager_running: &AtomicBool,
    channel: ChannelType,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    while channel_running.load(Ordering::Acquire) && manager_running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let dest = if from.ip() == relay.ip() { local } else { relay };
                if let Err(e) = socket.send_to(&buf[..len], dest) {
                    warn!("starbeam::udp: {channel} send to {dest} failed: {e}");
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                if channel_running.load(Ordering::Acquire)
                    && manager_running.load(Ordering::Acquire)
                {
                    warn!("starbeam::udp: {channel} receive error: {e}");
                }
                break;
            }
        }
    }
    debug!("starbeam::udp: {channel} worker exiting");
}

use std::net::UdpSocket;
use std::time::Duration;

use k9::assert_equal;

use starbeam_agent::udp::ChannelManager;
use starbeam_proto::message::{ChannelType, UdpChannelSetup};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn setup(session_id: u64, channel: ChannelType) -> UdpChannelSetup {
    UdpChannelSetup {
        session_id,
        channel,
        client_addr: "203.0.113.4".to_string(),
    }
}

/// The worker discriminates directions by sender address, so the fake relay
/// must not share 127.0.0.1 with the fake Sunshine. Linux answers the whole
/// 127/8 block; 127.0.0.2 gives the relay its own address.
const RELAY_ADDR: &str = "127.0.0.2";

#[test]
fn datagrams_forward_both_directions_verbatim() {
    let relay_socket = UdpSocket::bind((RELAY_ADDR, 0)).unwrap();
    relay_socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let relay_port = relay_socket.local_addr().unwrap().port();

    // Bind the fake Sunshine video socket first and derive the base port
    // backwards from it (video = base + 9).
    let sunshine_socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    sunshine_socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let base_port = sunshine_socket.local_addr().unwrap().port() - 9;

    let manager = ChannelManager::new(base_port);
    assert!(manager.initialize(RELAY_ADDR, relay_port, relay_port, relay_port));

    let ack = manager.handle_channel_setup(&setup(42, ChannelType::Video));
    assert_equal!(ack.session_id, 42);
    assert_equal!(ack.channel, ChannelType::Video);
    assert_equal!(ack.relay_port, relay_port);
    assert_equal!(ack.local_port > 0, true);

    // Relay -> channel socket: delivered to the local Sunshine port.
    let payload = b"\x01video frame bytes\xff";
    relay_socket
        .send_to(payload, ("127.0.0.1", ack.local_port))
        .unwrap();
    let mut buf = [0u8; 2048];
    let (len, from) = sunshine_socket.recv_from(&mut buf).unwrap();
    assert_equal!(&buf[..len], payload.as_slice());
    assert_equal!(from.port(), ack.local_port);

    // Sunshine -> channel socket: delivered to the relay endpoint.
    let reply = b"\x02sunshine reply";
    sunshine_socket
        .send_to(reply, ("127.0.0.1", ack.local_port))
        .unwrap();
    let (len, _) = relay_socket.recv_from(&mut buf).unwrap();
    assert_equal!(&buf[..len], reply.as_slice());

    manager.shutdown();
}

#[test]
fn repeated_setup_returns_the_same_port() {
    let manager = ChannelManager::new(40000);
    assert!(manager.initialize(RELAY_ADDR, 48100, 48101, 48102));

    let first = manager.handle_channel_setup(&setup(1, ChannelType::Audio));
    let second = manager.handle_channel_setup(&setup(2, ChannelType::Audio));

    assert_equal!(first.local_port > 0, true);
    assert_equal!(second.local_port, first.local_port);
    assert_equal!(second.relay_port, 48101);
    assert_equal!(second.session_id, 2);

    // A different channel type gets its own socket.
    let control = manager.handle_channel_setup(&setup(3, ChannelType::Control));
    assert_equal!(control.relay_port, 48102);
    assert_equal!(control.local_port > 0, true);
    assert_equal!(control.local_port == first.local_port, false);

    manager.shutdown();
}

#[test]
fn setup_without_initialize_acks_zero_ports() {
    let manager = ChannelManager::new(40000);
    let ack = manager.handle_channel_setup(&setup(7, ChannelType::Video));
    assert_equal!(ack.relay_port, 0);
    assert_equal!(ack.local_port, 0);
}

#[test]
fn shutdown_joins_workers_and_clears_channels() {
    let manager = ChannelManager::new(41000);
    assert!(manager.initialize(RELAY_ADDR, 48100, 48101, 48102));

    let ack = manager.handle_channel_setup(&setup(1, ChannelType::Video));
    assert_equal!(ack.local_port > 0, true);
    assert_equal!(manager.local_port(ChannelType::Video), ack.local_port);

    // Returns only after every worker thread has been joined.
    manager.shutdown();

    assert_equal!(manager.is_running(), false);
    assert_equal!(manager.local_port(ChannelType::Video), 0);
    let after = manager.handle_channel_setup(&setup(2, ChannelType::Video));
    assert_equal!(after.local_port, 0);

    // Idempotent.
    manager.shutdown();
}

#[test]
fn manager_can_rearm_after_shutdown() {
    let manager = ChannelManager::new(42000);
    assert!(manager.initialize(RELAY_ADDR, 48100, 48101, 48102));
    manager.shutdown();

    assert!(manager.initialize(RELAY_ADDR, 48200, 48201, 48202));
    let ack = manager.handle_channel_setup(&setup(1, ChannelType::Video));
    assert_equal!(ack.relay_port, 48200);
    assert_equal!(ack.local_port > 0, true);
    manager.shutdown();
}

use k9::assert_equal;
use starbeam_proto::message::{
    message_type, ChannelType, ControlMessage, HostCapabilities, HttpResponse, MessageType,
    PortAssignment, Register, RegisterAck, RtspResponse, SessionEnd, UdpChannelAck,
    UdpChannelSetup,
};

fn roundtrip(msg: ControlMessage) -> ControlMessage {
    let json = msg.encode().unwrap();
    ControlMessage::decode(&json).unwrap()
}

#[test]
fn register_roundtrips_with_all_fields() {
    let original = ControlMessage::Register(Register {
        hostname: "den-pc".to_string(),
        unique_id: "den-pc_1717171717000".to_string(),
        auth_key: "k-123".to_string(),
        host_id: Some("host-7".to_string()),
        capabilities: HostCapabilities {
            max_width: Some(3840),
            max_height: Some(2160),
            max_fps: Some(120),
            video_codecs: vec!["H264".into(), "HEVC".into(), "AV1".into()],
            audio_codecs: vec!["opus".into()],
        },
    });

    assert_equal!(roundtrip(original.clone()), original);
}

#[test]
fn register_omits_absent_optionals() {
    let msg = ControlMessage::Register(Register {
        hostname: "den-pc".to_string(),
        unique_id: "den-pc_1".to_string(),
        auth_key: "k".to_string(),
        host_id: None,
        capabilities: HostCapabilities::streaming_defaults(),
    });

    let json = msg.encode().unwrap();
    assert_equal!(json.contains("\"host_id\""), false);
    assert_equal!(json.contains("\"max_width\""), false);
    assert_equal!(json.contains("\"type\":\"register\""), true);
}

#[test]
fn register_ack_roundtrips() {
    let original = ControlMessage::RegisterAck(RegisterAck {
        host_id: "host-7".to_string(),
        ports: PortAssignment {
            http: 47989,
            https: 47984,
            rtsp: 48010,
            video: 47998,
            audio: 47999,
            control: 47997,
        },
        external_address: Some("198.51.100.20".to_string()),
    });

    assert_equal!(roundtrip(original.clone()), original);
}

#[test]
fn http_request_decodes_wire_shape() {
    let json = r#"{"type":"http_request","id":7,"method":"GET","path":"/serverinfo","headers":{"Accept":"*/*"},"is_https":true,"client_addr":"203.0.113.4"}"#;

    match ControlMessage::decode(json).unwrap() {
        ControlMessage::HttpRequest(req) => {
            assert_equal!(req.id, 7);
            assert_equal!(req.method, "GET");
            assert_equal!(req.path, "/serverinfo");
            assert_equal!(req.query, None);
            assert_equal!(req.headers.get("Accept").map(String::as_str), Some("*/*"));
            assert_equal!(req.body, None);
            assert_equal!(req.is_https, true);
            assert_equal!(req.client_addr, "203.0.113.4");
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn http_request_defaults_missing_headers_and_scheme() {
    let json =
        r#"{"type":"http_request","id":1,"method":"GET","path":"/","client_addr":"203.0.113.4"}"#;

    match ControlMessage::decode(json).unwrap() {
        ControlMessage::HttpRequest(req) => {
            assert_equal!(req.headers.len(), 0);
            assert_equal!(req.is_https, false);
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn http_response_omits_empty_body() {
    let msg = ControlMessage::HttpResponse(HttpResponse {
        id: 7,
        status: 404,
        headers: Default::default(),
        body: None,
    });

    let json = msg.encode().unwrap();
    assert_equal!(json.contains("\"body\""), false);
    // The headers object itself is always present.
    assert_equal!(json.contains("\"headers\":{}"), true);
}

#[test]
fn rtsp_response_roundtrips() {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("CSeq".to_string(), "2".to_string());
    headers.insert("Session".to_string(), "12345".to_string());

    let original = ControlMessage::RtspResponse(RtspResponse {
        id: 3,
        status: 200,
        reason: "OK".to_string(),
        headers,
        body: Some("v=0\r\n".to_string()),
    });

    assert_equal!(roundtrip(original.clone()), original);
}

#[test]
fn udp_channel_messages_roundtrip() {
    let setup = ControlMessage::UdpChannelSetup(UdpChannelSetup {
        session_id: 42,
        channel: ChannelType::Video,
        client_addr: "203.0.113.4".to_string(),
    });
    let ack = ControlMessage::UdpChannelAck(UdpChannelAck {
        session_id: 42,
        channel: ChannelType::Video,
        relay_port: 47998,
        local_port: 50123,
    });

    assert_equal!(roundtrip(setup.clone()), setup);
    assert_equal!(roundtrip(ack.clone()), ack);

    let json = ack.encode().unwrap();
    assert_equal!(json.contains("\"channel\":\"video\""), true);
}

#[test]
fn ping_pong_echo_ts() {
    let json = r#"{"type":"ping","ts":1717171717}"#;
    match ControlMessage::decode(json).unwrap() {
        ControlMessage::Ping { ts } => {
            let pong = ControlMessage::Pong { ts };
            assert_equal!(pong.encode().unwrap(), r#"{"type":"pong","ts":1717171717}"#);
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn session_end_omits_absent_reason() {
    let msg = ControlMessage::SessionEnd(SessionEnd {
        session_id: 9,
        reason: None,
    });
    let json = msg.encode().unwrap();
    assert_equal!(json, r#"{"type":"session_end","session_id":9}"#);
}

#[test]
fn string_escaping_roundtrips_control_bytes() {
    let mut wild = String::from("quote:\" slash:\\ tab:\t nl:\n cr:\r");
    for b in 0u8..0x20 {
        wild.push(char::from(b));
    }
    wild.push_str("ünïcödé \u{1F600}");

    let original = ControlMessage::SessionEnd(SessionEnd {
        session_id: 1,
        reason: Some(wild.clone()),
    });
    match roundtrip(original) {
        ControlMessage::SessionEnd(end) => {
            assert_equal!(end.reason.as_deref(), Some(wild.as_str()));
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn unknown_fields_are_ignored() {
    let json = r#"{"type":"ping","ts":5,"shiny_new_field":{"nested":true}}"#;
    assert_equal!(
        ControlMessage::decode(json).unwrap(),
        ControlMessage::Ping { ts: 5 }
    );
}

#[test]
fn unknown_type_fails_decode_but_tags_as_unknown() {
    let json = r#"{"type":"unknown_thing","x":1}"#;
    assert_equal!(ControlMessage::decode(json).is_err(), true);
    assert_equal!(message_type(json), MessageType::Unknown);
}

#[test]
fn message_type_reads_only_the_tag() {
    assert_equal!(
        message_type(r#"{"type":"http_request","id":"not even a number"}"#),
        MessageType::HttpRequest
    );
    assert_equal!(message_type("not json at all"), MessageType::Unknown);
    assert_equal!(
        message_type(r#"{"type":"udp_channel_close"}"#),
        MessageType::UdpChannelClose
    );
}

#[test]
fn udp_channel_close_decodes_as_bare_tag() {
    assert_equal!(
        ControlMessage::decode(r#"{"type":"udp_channel_close"}"#).unwrap(),
        ControlMessage::UdpChannelClose
    );
}

#[test]
fn channel_type_parses_known_names_and_defaults_to_video() {
    assert_equal!(ChannelType::parse("video"), ChannelType::Video);
    assert_equal!(ChannelType::parse("audio"), ChannelType::Audio);
    assert_equal!(ChannelType::parse("control"), ChannelType::Control);
    assert_equal!(ChannelType::parse("haptics"), ChannelType::Video);
    assert_equal!(ChannelType::parse(""), ChannelType::Video);
}

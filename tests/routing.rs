mod common;

use common::{event, RawEndpoint, Relay, SILENCE};
use dbg_relay::error::Error;
use dbg_relay::proto::Body;
use dbg_relay::relay::State;
use serde_json::json;

fn goto(line: u32) -> Body {
    Body::Goto {
        filename: "/src/main.c".to_string(),
        line,
    }
}

#[test]
fn test_debugger_to_frontend() {
    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");
    let mut vim = relay.connect("vim");
    assert_eq!(relay.session.state(), State::Running);

    gdb.notify("vim", goto(12)).unwrap();
    let packet = event(&mut vim, "goto");
    assert_eq!(packet.src.as_deref(), Some("gdb"));
    assert_eq!(packet.dst, "vim");
    assert_eq!(packet.get("line"), Some(&json!(12)));

    // front-end goes away, the debugger keeps talking into the void
    vim.close();
    relay.wait_gone("vim");
    gdb.notify("vim", goto(13)).unwrap();
    assert!(gdb.next_event(SILENCE).unwrap().is_none());
    assert_eq!(relay.session.state(), State::Running);
}

#[test]
fn test_src_is_stamped_by_proxy() {
    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");
    let mut vim = RawEndpoint::connect(&relay.address);
    vim.write_json(json!({"dst": "proxy", "op": "name", "name": "vim"}));
    assert!(common::wait_until(|| relay.session.registry().contains("vim")));

    vim.write_json(json!({"dst": "gdb", "op": "go", "src": "impostor"}));
    let packet = event(&mut gdb, "go");
    assert_eq!(packet.src.as_deref(), Some("vim"));
}

#[test]
fn test_unregistered_destination() {
    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");
    let vim = relay.connect("vim");

    vim.notify("emacs", Body::Go).unwrap();
    vim.notify("gdb", Body::Bt).unwrap();

    // the miss is dropped silently, the connection stays usable
    let packet = event(&mut gdb, "bt");
    assert_eq!(packet.src.as_deref(), Some("vim"));
    assert!(relay.session.registry().contains("vim"));
}

#[test]
fn test_debugger_missing() {
    let relay = Relay::start(false);
    let mut vim = relay.connect("vim");

    vim.notify("gdb", Body::Go).unwrap();
    assert!(vim.next_event(SILENCE).unwrap().is_none());
    assert!(!relay.session.is_shutting_down());
}

#[test]
fn test_malformed_frames_are_isolated() {
    struct TestCase {
        payload: &'static [u8],
    }

    let cases = [
        TestCase {
            payload: b"not json at all",
        },
        TestCase {
            payload: br#"["dst", "gdb"]"#,
        },
        TestCase {
            payload: br#"{"op": "go"}"#,
        },
        TestCase {
            payload: br#"{"dst": "proxy", "op": "launch"}"#,
        },
    ];

    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");
    let mut vim = RawEndpoint::connect(&relay.address);
    vim.write_json(json!({"dst": "proxy", "op": "name", "name": "vim"}));
    assert!(common::wait_until(|| relay.session.registry().contains("vim")));

    for tc in cases {
        vim.write_payload(tc.payload);
        let notice = vim.read_packet();
        assert_eq!(notice.op, "error", "{:?}", String::from_utf8_lossy(tc.payload));
        assert_eq!(notice.src.as_deref(), Some("proxy"));
    }

    vim.write_json(json!({"dst": "gdb", "op": "eval", "expr": "argc"}));
    let packet = event(&mut gdb, "eval");
    assert_eq!(packet.get("expr"), Some(&json!("argc")));
}

#[test]
fn test_duplicate_name_is_refused() {
    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");
    let vim = relay.connect("vim");

    let mut twin = RawEndpoint::connect(&relay.address);
    twin.write_json(json!({"dst": "proxy", "op": "name", "name": "vim"}));
    let notice = twin.read_packet();
    assert_eq!(notice.op, "error");
    assert!(twin.is_closed());

    // the first owner of the name is untouched
    vim.notify("gdb", Body::Go).unwrap();
    let packet = event(&mut gdb, "go");
    assert_eq!(packet.src.as_deref(), Some("vim"));
}

#[test]
fn test_handshake_rejects() {
    struct TestCase {
        hello: serde_json::Value,
    }

    let cases = [
        TestCase {
            hello: json!({"dst": "gdb", "op": "go"}),
        },
        TestCase {
            hello: json!({"dst": "proxy", "op": "name", "name": ""}),
        },
        TestCase {
            hello: json!({"dst": "proxy", "op": "name", "name": "proxy"}),
        },
    ];

    let relay = Relay::start(false);
    for tc in cases {
        let mut endpoint = RawEndpoint::connect(&relay.address);
        endpoint.write_json(tc.hello.clone());
        assert_eq!(endpoint.read_packet().op, "error", "{}", tc.hello);
        assert!(endpoint.is_closed(), "{}", tc.hello);
    }
    assert!(relay.session.registry().is_empty());
}

#[test]
fn test_reconnect_under_same_name() {
    let relay = Relay::start(false);
    let mut gdb = relay.connect("gdb");

    let vim = relay.connect("vim");
    vim.close();
    relay.wait_gone("vim");

    let mut vim = relay.connect("vim");
    gdb.notify("vim", goto(1)).unwrap();
    assert_eq!(event(&mut vim, "goto").get("line"), Some(&json!(1)));

    vim.notify("gdb", Body::Go).unwrap();
    event(&mut gdb, "go");
}

#[test]
fn test_closed_client_reports_transport_closed() {
    let relay = Relay::start(false);
    let mut vim = relay.connect("vim");

    let mut twin = dbg_relay::client::Client::connect(&relay.address, "vim").unwrap();
    let notice = twin.next_event(common::WAIT).unwrap().unwrap();
    assert_eq!(notice.op, "error");
    let err = twin.next_event(common::WAIT).unwrap_err();
    assert!(matches!(err, Error::TransportClosed));

    assert!(vim.next_event(SILENCE).unwrap().is_none());
}

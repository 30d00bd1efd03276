mod common;

use common::{event, WAIT};
use dbg_relay::client::Client;
use dbg_relay::proto::{Body, Packet, PROXY};
use dbg_relay::transport::{frame, Address};
use nix::sys::signal::Signal;
use serde_json::json;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const INHERITED_ENV: [&str; 10] = [
    "DBG_RELAY_MODE",
    "DBG_RELAY_LISTEN",
    "DBG_RELAY_ADDRESS_FILE",
    "DBG_RELAY_DEBUGGER",
    "DBG_RELAY_FRONTEND",
    "DBG_RELAY_DEBUGGER_PID",
    "DBG_RELAY_MANAGED",
    "DBG_RELAY_TICK_MS",
    "DBG_RELAY_LOG_FILE",
    "VIM_TMUX_PANE",
];

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dbg-relay-{}-{name}", Uuid::new_v4()))
}

/// `dbg-relay` process with its standard input/output as the debugger pipe.
struct RelayProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: Receiver<Packet>,
    config: PathBuf,
}

impl RelayProcess {
    fn spawn(args: &[&str]) -> Self {
        let config = temp_path("config.toml");
        fs::write(&config, "").unwrap();

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dbg-relay"));
        cmd.arg("--quiet")
            .arg("--config")
            .arg(&config)
            .arg("--tick-ms")
            .arg("10")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for var in INHERITED_ENV {
            cmd.env_remove(var);
        }
        let mut child = cmd.spawn().unwrap();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().unwrap();
        let (tx, frames) = mpsc::channel();
        thread::spawn(move || read_frames(stdout, |packet| tx.send(packet).is_ok()));

        Self {
            child,
            stdin,
            frames,
            config,
        }
    }

    /// Next frame the relay wrote to its standard output.
    fn next_frame(&self) -> Packet {
        self.frames
            .recv_timeout(WAIT)
            .expect("relay wrote no frame")
    }

    fn write_json(&mut self, value: serde_json::Value) {
        let stdin = self.stdin.as_mut().expect("stdin is closed");
        stdin
            .write_all(&frame::encode(value.to_string().as_bytes()).unwrap())
            .unwrap();
        stdin.flush().unwrap();
    }

    fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn wait(&mut self) -> ExitStatus {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "relay does not exit");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        _ = self.child.kill();
        _ = self.child.wait();
        _ = fs::remove_file(&self.config);
    }
}

fn read_frames(mut stdout: ChildStdout, mut deliver: impl FnMut(Packet) -> bool) {
    loop {
        let mut len = [0u8; frame::LEN_PREFIX];
        if stdout.read_exact(&mut len).is_err() {
            return;
        }
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        if stdout.read_exact(&mut payload).is_err() {
            return;
        }
        if !deliver(Packet::decode(&payload).unwrap()) {
            return;
        }
    }
}

fn reported_port(init: &Packet) -> u16 {
    assert_eq!(init.op, "init");
    assert_eq!(init.dst, "gdb");
    assert_eq!(init.src.as_deref(), Some(PROXY));
    assert_eq!(init.get("host"), Some(&json!("127.0.0.1")));
    let port = init.get("port").and_then(|p| p.as_u64()).unwrap() as u16;
    assert_ne!(port, 0);
    port
}

fn read_address_file(path: &Path) -> Address {
    let data = fs::read_to_string(path).unwrap();
    _ = fs::remove_file(path);
    serde_json::from_str(&data).unwrap()
}

#[test]
fn test_listen_mode_over_stdio() {
    let mut debugger = Command::new("sleep").arg("30").spawn().unwrap();
    let address_file = temp_path("address.json");

    let mut relay = RelayProcess::spawn(&[
        "--managed",
        "--debugger-pid",
        &debugger.id().to_string(),
        "--address-file",
        address_file.to_str().unwrap(),
    ]);

    let port = reported_port(&relay.next_frame());
    let address = read_address_file(&address_file);
    assert_eq!(address, Address::Tcp("127.0.0.1".to_string(), port));

    let mut vim = Client::connect(&address, "vim").unwrap();
    vim.notify("gdb", Body::Bt).unwrap();
    let bt = relay.next_frame();
    assert_eq!(bt.op, "bt");
    assert_eq!(bt.src.as_deref(), Some("vim"));

    relay.write_json(json!({"dst": "vim", "op": "goto", "filename": "/src/main.c", "line": 7}));
    let goto = event(&mut vim, "goto");
    assert_eq!(goto.src.as_deref(), Some("gdb"));
    assert_eq!(goto.get("line"), Some(&json!(7)));

    // end of the pipe is the loss of a managed debugger
    relay.close_stdin();
    assert_eq!(event(&mut vim, "quit").src.as_deref(), Some(PROXY));
    assert!(relay.wait().success());
    assert_eq!(
        debugger.wait().unwrap().signal(),
        Some(Signal::SIGTERM as i32)
    );
}

#[test]
fn test_address_file_holds_json() {
    let address_file = temp_path("address.json");
    let relay = RelayProcess::spawn(&["--address-file", address_file.to_str().unwrap()]);

    let port = reported_port(&relay.next_frame());
    let data = fs::read_to_string(&address_file).unwrap();
    _ = fs::remove_file(&address_file);
    let value: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(value, json!(["127.0.0.1", port]));
}

#[test]
fn test_listen_bind_failure_aborts() {
    let busy = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = busy.local_addr().unwrap().port();

    let mut relay = RelayProcess::spawn(&["--listen", &format!("127.0.0.1:{port}")]);

    let abort = relay.next_frame();
    assert_eq!(abort.op, "abort");
    assert_eq!(abort.dst, "gdb");
    assert_eq!(abort.src.as_deref(), Some(PROXY));
    let msg = abort.get("msg").and_then(|m| m.as_str()).unwrap();
    assert!(!msg.is_empty());

    assert_eq!(relay.wait().code(), Some(1));
}

#[test]
fn test_tunnel_mode_init_after_name() {
    let address_file = temp_path("address.json");
    let mut relay = RelayProcess::spawn(&[
        "--mode",
        "tunnel",
        "--address-file",
        address_file.to_str().unwrap(),
    ]);

    // nothing is reported before the tunnel names itself
    assert!(relay.frames.recv_timeout(common::SILENCE).is_err());

    relay.write_json(json!({"dst": "proxy", "op": "name", "name": "gdb"}));
    let port = reported_port(&relay.next_frame());
    let address = read_address_file(&address_file);
    assert_eq!(address, Address::Tcp("127.0.0.1".to_string(), port));

    let mut vim = Client::connect(&address, "vim").unwrap();
    vim.notify("gdb", Body::Go).unwrap();
    let go = relay.next_frame();
    assert_eq!(go.op, "go");
    assert_eq!(go.src.as_deref(), Some("vim"));

    relay.write_json(json!({"dst": "vim", "op": "goto", "filename": "/src/main.c", "line": 1}));
    assert_eq!(event(&mut vim, "goto").src.as_deref(), Some("gdb"));

    vim.quit().unwrap();
    event(&mut vim, "quit");
    assert!(relay.wait().success());
}

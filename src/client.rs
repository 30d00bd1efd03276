//! Endpoint side of the protocol.
//!
//! [`Client`] connects to a proxy, announces its name and correlates requests with responses
//! through `request_id`. Requests are numbered from 1 and ids are never reused by a client.
//! Messages that are not awaited responses are queued as events.

use crate::error::{Error, Result};
use crate::proto::{Body, Message, Packet, PROXY};
use crate::{relay_debug, relay_warn};
use crate::transport::{Address, Connection};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Response wait of [`Client::request`] unless told otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    name: String,
    conn: Connection,
    next_id: u64,
    /// Requests without a response yet, the slot is filled when it arrives.
    pending: HashMap<u64, Option<Packet>>,
    events: VecDeque<Packet>,
    trap_target: Option<String>,
}

impl Client {
    /// Connect to a proxy and announce `name`.
    pub fn connect(addr: &Address, name: impl Into<String>) -> Result<Self> {
        Self::from_connection(Connection::connect(addr)?, name)
    }

    /// Announce `name` over an established connection.
    pub fn from_connection(conn: Connection, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        conn.send_message(&Message::control(Body::Name { name: name.clone() }))?;
        Ok(Self {
            name,
            conn,
            next_id: 1,
            pending: HashMap::new(),
            events: VecDeque::new(),
            trap_target: None,
        })
    }

    /// Interrupt `target` after each request so it looks at its connection.
    pub fn with_trap(self, target: impl Into<String>) -> Self {
        Self {
            trap_target: Some(target.into()),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request, return its id.
    pub fn send(&mut self, dst: &str, body: Body) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.conn
            .send_message(&Message::new(dst, body).with_request_id(id))?;
        self.pending.insert(id, None);
        Ok(id)
    }

    /// Send a message that expects no response.
    pub fn notify(&self, dst: &str, body: Body) -> Result<()> {
        self.conn.send_message(&Message::new(dst, body))
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, dst: &str, body: Body, timeout: Duration) -> Result<Packet> {
        let id = self.send(dst, body)?;
        if let Some(target) = self.trap_target.clone() {
            self.trap(Some(target.as_str()))?;
        }
        self.wait_response(id, timeout)
    }

    /// Wait for the response of request `id`.
    ///
    /// On timeout the request is abandoned, its late response will be discarded.
    pub fn wait_response(&mut self, id: u64, timeout: Duration) -> Result<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.pending.get(&id) {
                Some(Some(_)) => {
                    return self
                        .pending
                        .remove(&id)
                        .flatten()
                        .ok_or(Error::RequestTimeout(id, timeout));
                }
                Some(None) => {}
                // never sent or already abandoned
                None => return Err(Error::RequestTimeout(id, timeout)),
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                self.pending.remove(&id);
                return Err(Error::RequestTimeout(id, timeout));
            }
            self.pull(left)?;
        }
    }

    /// Next message that is not an awaited response.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.pull(left)?;
        }
    }

    /// Wait for an event with operation `op`, events before it are dropped.
    pub fn wait_event(&mut self, op: &str, timeout: Duration) -> Result<Option<Packet>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_event(left)? {
                Some(event) if event.op == op => return Ok(Some(event)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Read one message, if any arrives in `timeout`, and sort it.
    fn pull(&mut self, timeout: Duration) -> Result<()> {
        let packet = match self.conn.receiver().receive_timeout(timeout) {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(e) if !e.is_fatal() => {
                relay_warn!(target: "relay", "`{}`: {e}", self.name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if packet.op != "response" {
            self.events.push_back(packet);
            return Ok(());
        }
        match packet.request_id() {
            Some(id) if self.pending.contains_key(&id) => {
                self.pending.insert(id, Some(packet));
            }
            id => {
                relay_debug!(target: "relay", "`{}`: response to unknown request {id:?} discarded", self.name);
            }
        }
        Ok(())
    }

    /// Answer `request` with `body`, addressed to its sender under the same request id.
    pub fn respond(&self, request: &Packet, body: Body) -> Result<()> {
        let src = request.src.as_deref().ok_or_else(|| {
            Error::MalformedPacket(format!("`{}` request without `src`", request.op))
        })?;
        let mut msg = Message::new(src, body);
        msg.request_id = request.request_id();
        self.conn.send_message(&msg)
    }

    /// Interrupt the debugger (`None`) or refresh a front-end.
    pub fn trap(&self, target: Option<&str>) -> Result<()> {
        self.control(Body::Trap {
            target: target.map(ToString::to_string),
        })
    }

    /// End the session.
    pub fn quit(&self) -> Result<()> {
        self.control(Body::Quit)
    }

    /// Have the proxy log `msg`.
    pub fn print(&self, msg: impl Into<String>) -> Result<()> {
        self.control(Body::Print { msg: msg.into() })
    }

    pub fn set_tmux_pane(&self, pane: impl Into<String>) -> Result<()> {
        self.control(Body::TmuxPane { pane: pane.into() })
    }

    fn control(&self, body: Body) -> Result<()> {
        self.conn.send_message(&Message::new(PROXY, body))
    }

    /// Send a raw packet, e.g. one with operation specific fields unknown to [`Body`].
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.conn.send(packet)
    }

    /// Drop the connection.
    pub fn close(self) {
        self.conn.sender().close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::message::Location;
    use std::os::unix::net::UnixStream;

    /// Client with the other side of its connection.
    fn client() -> (Client, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        let client = Client::from_connection(Connection::from_stream(a).unwrap(), "vim").unwrap();
        let mut peer = Connection::from_stream(b).unwrap();
        let hello = peer.receive().unwrap();
        assert_eq!(hello.op, "name");
        (client, peer)
    }

    fn response(id: Option<u64>) -> Packet {
        let packet = Packet::new("vim", "response").with("expr", "x");
        match id {
            Some(id) => packet.with("request_id", id),
            None => packet,
        }
    }

    #[test]
    fn test_ids_increase() {
        let (mut client, mut peer) = client();
        let ids = (0..3)
            .map(|_| client.send("gdb", Body::Bt).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);

        for id in ids {
            assert_eq!(peer.receive().unwrap().request_id(), Some(id));
        }
    }

    #[test]
    fn test_response_correlation() {
        let (mut client, peer) = client();
        let first = client.send("gdb", Body::Bt).unwrap();
        let second = client
            .send(
                "gdb",
                Body::Toggle {
                    loc: Location("/a.c".to_string(), 1),
                },
            )
            .unwrap();

        peer.send(&Packet::new("vim", "goto").with("filename", "/a.c").with("line", 1))
            .unwrap();
        peer.send(&response(Some(second))).unwrap();
        peer.send(&response(Some(99))).unwrap();
        peer.send(&response(None)).unwrap();
        peer.send(&response(Some(first))).unwrap();

        let resp = client.wait_response(first, Duration::from_secs(1)).unwrap();
        assert_eq!(resp.request_id(), Some(first));
        // already buffered
        let resp = client.wait_response(second, Duration::from_millis(1)).unwrap();
        assert_eq!(resp.request_id(), Some(second));

        let event = client.next_event(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(event.op, "goto");
        assert!(client.next_event(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_timeout_abandons_request() {
        let (mut client, peer) = client();
        let id = client.send("gdb", Body::Bt).unwrap();

        let err = client
            .wait_response(id, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(i, _) if i == id));

        // late response is discarded, not taken as an event
        peer.send(&response(Some(id))).unwrap();
        assert!(client.next_event(Duration::from_millis(30)).unwrap().is_none());
        assert!(client.wait_response(id, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_respond_keeps_request_id() {
        let (client, mut peer) = client();
        let mut request = Packet::new("vim", "eval")
            .with("expr", "argc")
            .with("request_id", 7);
        request.src = Some("gdb".to_string());

        client
            .respond(
                &request,
                Body::Response {
                    expr: Some("argc".to_string()),
                    contents: None,
                    bt: None,
                },
            )
            .unwrap();
        let reply = peer.receive().unwrap();
        assert_eq!(reply.dst, "gdb");
        assert_eq!(reply.request_id(), Some(7));

        request.src = None;
        assert!(client.respond(&request, Body::Go).is_err());
    }

    #[test]
    fn test_request_traps_target() {
        let (client, mut peer) = client();
        let mut client = client.with_trap("gdb");

        let err = client
            .request("gdb", Body::Go, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(1, _)));

        assert_eq!(peer.receive().unwrap().op, "go");
        let trap = peer.receive().unwrap();
        assert_eq!(trap.dst, PROXY);
        assert_eq!(trap.op, "trap");
        assert_eq!(trap.get("target"), Some(&serde_json::json!("gdb")));
    }
}

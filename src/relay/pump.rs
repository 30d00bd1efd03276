use crate::error::Error;
use crate::proto::Packet;
use crate::relay::registry::Role;
use crate::relay::session::Session;
use crate::transport::{FrameReceiver, FrameSender};
use crate::{muted_error, relay_debug, relay_warn};
use std::sync::Arc;
use std::time::Duration;

/// Read loop of a single registered connection.
///
/// Control plane packets go to the session, everything else is stamped with the endpoint name
/// and forwarded to its destination.
pub struct Pump {
    name: String,
    role: Role,
    receiver: FrameReceiver,
    sender: FrameSender,
    session: Arc<Session>,
    tick: Duration,
}

impl Pump {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        receiver: FrameReceiver,
        sender: FrameSender,
        session: Arc<Session>,
        tick: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            receiver,
            sender,
            session,
            tick,
        }
    }

    /// Pump frames until the connection is gone or the session shuts down.
    pub fn run(mut self) {
        relay_debug!(target: "relay", "pump `{}` started", self.name);

        while !self.session.is_shutting_down() {
            match self.receiver.poll(self.tick) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    relay_debug!(target: "relay", "`{}` poll: {e}", self.name);
                    break;
                }
            }

            match self.receiver.receive() {
                Ok(packet) => self.dispatch(packet),
                Err(Error::TransportClosed) => {
                    relay_debug!(target: "relay", "`{}` hung up", self.name);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    relay_warn!(target: "relay", "`{}` connection error: {e}", self.name);
                    break;
                }
                Err(e) => self.report(e),
            }
        }

        self.exit();
    }

    fn dispatch(&self, packet: Packet) {
        if packet.is_control() {
            if let Err(e) = self.session.handle_control(&self.name, &packet) {
                self.report(e);
            }
            return;
        }
        self.route(packet);
    }

    fn route(&self, mut packet: Packet) {
        packet.src = Some(self.name.clone());

        match self.session.registry().lookup(&packet.dst) {
            Ok(destination) => {
                // a dead destination is cleaned up by its own pump
                muted_error!(destination.send(&packet), "forward:");
            }
            Err(Error::RoutingMiss(dst)) if dst == self.session.debugger() => {
                relay_warn!(
                    target: "relay",
                    "routing anomaly: debugger `{dst}` is not connected, `{}` from `{}` dropped",
                    packet.op,
                    self.name
                );
            }
            Err(e) => {
                relay_debug!(target: "relay", "{e}, `{}` from `{}` dropped", packet.op, self.name);
            }
        }
    }

    /// Tell the endpoint its packet was rejected, the connection stays open.
    fn report(&self, e: Error) {
        relay_warn!(target: "relay", "rejected packet from `{}`: {e}", self.name);
        let notice = Packet::violation(&self.name, e.to_string());
        muted_error!(self.sender.send(&notice), "send violation notice:");
    }

    fn exit(self) {
        // a flag raised from outside is turned into a teardown by whoever sees it first
        self.session.observe_external_shutdown();

        let removed = self.session.registry().remove(&self.name, &self.sender);
        self.sender.close();
        relay_debug!(target: "relay", "pump `{}` stopped", self.name);

        // endpoints drained by a shutdown are not lost, the session already ends
        if removed {
            self.session.on_endpoint_lost(&self.name, self.role);
        }
    }
}

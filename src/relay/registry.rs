use crate::error::{Error, Result};
use crate::transport::FrameSender;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Mutex;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Debugger,
    Frontend,
}

/// Named party with a live connection.
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub role: Role,
    pub sender: FrameSender,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, role: Role, sender: FrameSender) -> Self {
        Self {
            name: name.into(),
            role,
            sender,
        }
    }
}

#[derive(Default)]
struct Table {
    endpoints: HashMap<String, Endpoint>,
    sealed: bool,
}

/// Endpoint table shared by every connection of a session.
///
/// Pumps take cloned senders out of it and never keep the table locked while writing.
#[derive(Default)]
pub struct Registry {
    table: Mutex<Table>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint. Fails with [`Error::DuplicateName`] if the name is taken, the present
    /// endpoint stays untouched. After [`Registry::drain`] every registration is refused.
    pub fn register(&self, endpoint: Endpoint) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        if table.sealed {
            return Err(Error::Handshake("session is shutting down".to_string()));
        }
        if table.endpoints.contains_key(&endpoint.name) {
            return Err(Error::DuplicateName(endpoint.name));
        }
        table.endpoints.insert(endpoint.name.clone(), endpoint);
        Ok(())
    }

    /// Sender of the endpoint, [`Error::RoutingMiss`] if nobody has this name.
    pub fn lookup(&self, name: &str) -> Result<FrameSender> {
        self.get(name)
            .map(|endpoint| endpoint.sender)
            .ok_or_else(|| Error::RoutingMiss(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.table.lock().unwrap().endpoints.get(name).cloned()
    }

    /// Remove the endpoint if it is still bound to `sender`.
    ///
    /// A name may be reused by a new connection once the old one is gone, an exiting pump must
    /// not unregister its successor. Return true if something was removed.
    pub fn remove(&self, name: &str, sender: &FrameSender) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.endpoints.get(name) {
            Some(endpoint) if endpoint.sender.same_as(sender) => {
                table.endpoints.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.lock().unwrap().endpoints.contains_key(name)
    }

    /// Sorted endpoint names.
    pub fn names(&self) -> Vec<String> {
        self.table
            .lock()
            .unwrap()
            .endpoints
            .keys()
            .cloned()
            .sorted()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further registrations and take every endpoint out.
    pub fn drain(&self) -> Vec<Endpoint> {
        let mut table = self.table.lock().unwrap();
        table.sealed = true;
        table
            .endpoints
            .drain()
            .map(|(_, endpoint)| endpoint)
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.table.lock().unwrap().sealed
    }
}

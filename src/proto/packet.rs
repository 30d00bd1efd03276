use crate::error::{Error, Result};
use crate::proto::message::Message;
use serde::Serialize;
use serde_json::{Map, Value};

/// Name of the control plane. Packets addressed here are handled by the proxy itself.
pub const PROXY: &str = "proxy";

/// Routing view of a message.
///
/// Only the envelope (`dst`, `op`, `src`) is interpreted, every other key is carried as is, so a
/// packet can be forwarded without knowing its operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    pub dst: String,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Packet {
    pub fn new(dst: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            dst: dst.into(),
            op: op.into(),
            src: None,
            fields: Map::new(),
        }
    }

    /// Add an operation specific field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn request_id(&self) -> Option<u64> {
        self.fields.get("request_id").and_then(Value::as_u64)
    }

    pub fn is_control(&self) -> bool {
        self.dst == PROXY
    }

    /// Notice about a protocol violation, sent by the proxy back to the offending endpoint.
    pub fn violation(dst: impl Into<String>, msg: impl Into<String>) -> Self {
        let mut packet = Packet::new(dst, "error").with("msg", msg.into());
        packet.src = Some(PROXY.to_string());
        packet
    }

    /// Decode a frame payload.
    ///
    /// Anything that is not a JSON object with string `dst` and `op` keys is a
    /// [`Error::MalformedPacket`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::MalformedPacket(format!("invalid payload: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::MalformedPacket(
                "payload is not a mapping".to_string(),
            ));
        };

        let dst = take_string(&mut fields, "dst")?
            .ok_or_else(|| Error::MalformedPacket("missing `dst`".to_string()))?;
        let op = take_string(&mut fields, "op")?
            .ok_or_else(|| Error::MalformedPacket("missing `op`".to_string()))?;
        // the proxy stamps `src`, a non-string value is dropped
        let src = match fields.remove("src") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        Ok(Self {
            dst,
            op,
            src,
            fields,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Interpret packet as a typed message.
    pub fn to_message(&self) -> Result<Message> {
        let value = serde_json::to_value(self)?;
        serde_json::from_value(value)
            .map_err(|e| Error::MalformedPacket(format!("`{}` packet: {e}", self.op)))
    }
}

impl TryFrom<&Message> for Packet {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self> {
        Packet::from_value(serde_json::to_value(msg)?)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(Error::MalformedPacket(format!(
            "`{key}` must be a string, got {other}"
        ))),
    }
}

use crate::error::Result;
use crate::proto::packet::{Packet, PROXY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::IntoStaticStr;

/// Source location as `[filename, line]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location(pub String, pub u32);

/// Backtrace entry as `[filename, line, function]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceFrame(pub String, pub u32, pub String);

/// Sign identifier, `*` addresses every sign at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignNum {
    Id(u64),
    All(String),
}

impl SignNum {
    pub fn all() -> Self {
        SignNum::All("*".to_string())
    }
}

/// Operation with its own fields, discriminated by the `op` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Body {
    // --------------------------------- control plane ---------------------------------------------
    /// Handshake, the first message on a fresh connection.
    Name { name: String },
    /// Interrupt the debugger (no target or the debugger name) or refresh a front-end.
    Trap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Quit,
    Print { msg: String },
    TmuxPane { pane: String },

    // --------------------------------- proxy originated ------------------------------------------
    /// Address report: `host` and `port` for TCP listeners, `path` for unix sockets.
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Abort { msg: String },
    Error { msg: String },

    // --------------------------------- front-end to debugger -------------------------------------
    Exec { comm: String },
    Go,
    Eval { expr: String },
    Bt,
    Disable { loc: Location },
    Toggle { loc: Location },
    /// Run until location is reached.
    Until { loc: Location },
    Track {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },

    // --------------------------------- debugger to front-end -------------------------------------
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bt: Option<Vec<BacktraceFrame>>,
    },
    /// Show location, nothing is executed.
    Goto { filename: String, line: u32 },
    Place {
        num: u64,
        name: String,
        filename: String,
        line: u32,
    },
    Replace {
        num: u64,
        name: String,
        filename: String,
    },
    Unplace { num: SignNum },
    Refresh { expr: String },
    Disp { expr: String, contents: String },
}

impl Body {
    pub fn op(&self) -> &'static str {
        self.into()
    }

    /// True for operations handled by the proxy itself.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Body::Name { .. }
                | Body::Trap { .. }
                | Body::Quit
                | Body::Print { .. }
                | Body::TmuxPane { .. }
        )
    }
}

/// Typed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub body: Body,
}

impl Message {
    pub fn new(dst: impl Into<String>, body: Body) -> Self {
        Self {
            dst: dst.into(),
            src: None,
            request_id: None,
            body,
        }
    }

    /// Message addressed to the control plane.
    pub fn control(body: Body) -> Self {
        Self::new(PROXY, body)
    }

    /// Message sent by the proxy itself.
    pub fn from_proxy(dst: impl Into<String>, body: Body) -> Self {
        Self {
            src: Some(PROXY.to_string()),
            ..Self::new(dst, body)
        }
    }

    pub fn with_request_id(mut self, id: u64) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Build a response to this message, routed back to its sender with the same request id.
    pub fn reply(&self, body: Body) -> Option<Self> {
        let src = self.src.as_ref()?;
        Some(Self {
            dst: src.clone(),
            src: None,
            request_id: self.request_id,
            body,
        })
    }

    pub fn to_packet(&self) -> Result<Packet> {
        Packet::try_from(self)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_packet()?.encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Packet::decode(payload)?.to_message()
    }
}

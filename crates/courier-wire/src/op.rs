// Protocol operations exchanged between clients and the broker.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Ordered header pairs carried by `HPUB`/`HMSG`. Names may repeat.
pub type HeaderList = Vec<(String, String)>;

/// Body of `CONNECT`. Unknown fields are ignored so newer clients still connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub headers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
}

/// Body of `INFO`, sent by the server right after accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub version: String,
    pub proto: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub max_payload: usize,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
}

/// Operations a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    HPub {
        subject: String,
        reply: Option<String>,
        headers: HeaderList,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn name(&self) -> &'static str {
        match self {
            ClientOp::Connect(_) => "CONNECT",
            ClientOp::Pub { .. } => "PUB",
            ClientOp::HPub { .. } => "HPUB",
            ClientOp::Sub { .. } => "SUB",
            ClientOp::Unsub { .. } => "UNSUB",
            ClientOp::Ping => "PING",
            ClientOp::Pong => "PONG",
        }
    }
}

/// Operations the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
        payload: Bytes,
    },
    HMsg {
        subject: String,
        sid: String,
        reply: Option<String>,
        headers: HeaderList,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

impl ServerOp {
    pub fn name(&self) -> &'static str {
        match self {
            ServerOp::Info(_) => "INFO",
            ServerOp::Msg { .. } => "MSG",
            ServerOp::HMsg { .. } => "HMSG",
            ServerOp::Ping => "PING",
            ServerOp::Pong => "PONG",
            ServerOp::Ok => "+OK",
            ServerOp::Err(_) => "-ERR",
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        ServerOp::Err(text.into())
    }
}

//! JSON datagrams exchanged with node agents.
//!
//! One JSON object per UDP datagram:
//!
//! ```text
//! controller → agent   {"seq":7,"cmd":"mac_config","params":{"IEEE802154_macCW":11},"nodes":["2","3"]}
//! agent → controller   {"seq":7,"status":"ok"}
//!                      {"seq":7,"status":"error","code":3,"message":"unknown parameter"}
//! agent → controller   {"event":{"node":"2","name":"RIME_appPerPacket_rxstats","value":[..]}}
//! ```
//!
//! `nodes: null` addresses every node behind the agent.

use cwtune_mac::{RadioProgram, Slotframe};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{NodeId, Params, Status};

/// Largest datagram accepted from an agent.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A command with its correlation number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Commands understood by node agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Liveness check; the reply lists hosted nodes.
    Hello,
    MacConfig {
        params: Params,
        nodes: Option<Vec<NodeId>>,
    },
    AppConfig {
        params: Params,
        nodes: Option<Vec<NodeId>>,
    },
    RadioProgram {
        program: RadioProgram,
    },
    Slotframe {
        slots: Slotframe,
    },
    Subscribe {
        events: Vec<String>,
        mask: u32,
    },
    Unsubscribe,
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::MacConfig { .. } => "mac_config",
            Self::AppConfig { .. } => "app_config",
            Self::RadioProgram { .. } => "radio_program",
            Self::Slotframe { .. } => "slotframe",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyState {
    Ok,
    Error,
}

/// Agent reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    pub status: ReplyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Hosted nodes, present in `hello` replies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeId>,
}

impl Reply {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            status: ReplyState::Ok,
            code: None,
            message: None,
            nodes: Vec::new(),
        }
    }

    pub fn error(seq: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            seq,
            status: ReplyState::Error,
            code: Some(code),
            message: Some(message.into()),
            nodes: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        match self.status {
            ReplyState::Ok => Status::Ok,
            ReplyState::Error => Status::Error {
                code: self.code.unwrap_or(0),
                message: self.message.clone().unwrap_or_default(),
            },
        }
    }
}

/// Event payload pushed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub node: NodeId,
    pub name: String,
    pub value: serde_json::Value,
}

/// Anything an agent can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Event { event: EventBody },
    Reply(Reply),
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_inbound(datagram: &[u8]) -> Result<Inbound> {
    Ok(serde_json::from_slice(datagram)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::param;
    use serde_json::json;

    #[test]
    fn request_layout() {
        let request = Request {
            seq: 7,
            command: Command::MacConfig {
                params: param("IEEE802154_macCW", 11),
                nodes: Some(vec![NodeId::from(2), NodeId::from(3)]),
            },
        };
        let value: serde_json::Value =
            serde_json::from_slice(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "seq": 7,
                "cmd": "mac_config",
                "params": {"IEEE802154_macCW": 11},
                "nodes": ["2", "3"],
            })
        );

        let program = Request {
            seq: 8,
            command: Command::RadioProgram {
                program: RadioProgram::Tdma,
            },
        };
        let value: serde_json::Value =
            serde_json::from_slice(&encode_request(&program).unwrap()).unwrap();
        assert_eq!(value, json!({"seq": 8, "cmd": "radio_program", "program": "TDMA"}));
    }

    #[test]
    fn decode_replies_and_events() {
        let reply = decode_inbound(br#"{"seq":3,"status":"ok","nodes":[1,2]}"#).unwrap();
        match reply {
            Inbound::Reply(r) => {
                assert_eq!(r.seq, 3);
                assert_eq!(r.status(), Status::Ok);
                assert_eq!(r.nodes, vec![NodeId::from(1), NodeId::from(2)]);
            }
            other => panic!("expected reply, got {:?}", other),
        }

        let failed =
            decode_inbound(br#"{"seq":4,"status":"error","code":5,"message":"busy"}"#).unwrap();
        assert_eq!(failed, Inbound::Reply(Reply::error(4, 5, "busy")));

        let event =
            decode_inbound(br#"{"event":{"node":2,"name":"rxstats","value":{"rssi":-70}}}"#)
                .unwrap();
        match event {
            Inbound::Event { event } => {
                assert_eq!(event.node, NodeId::from(2));
                assert_eq!(event.value["rssi"], json!(-70));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_inbound(b"not json").is_err());
        assert!(decode_inbound(br#"{"hello":1}"#).is_err());
    }
}

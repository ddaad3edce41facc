//! Values exchanged with the fleet.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Fleet-unique node address.
///
/// Node agents report numeric short addresses; configuration files may use
/// either numbers or strings. Both compare by their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawNodeId", into = "String")]
pub struct NodeId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNodeId {
    Number(u64),
    Text(String),
}

impl From<RawNodeId> for NodeId {
    fn from(raw: RawNodeId) -> Self {
        match raw {
            RawNodeId::Number(n) => Self(n.to_string()),
            RawNodeId::Text(s) => Self(s),
        }
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for NodeId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which nodes a configuration push is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every node in the fleet.
    All,
    /// An explicit set of nodes.
    Nodes(Vec<NodeId>),
}

impl Targets {
    /// Address a single node.
    pub fn one(node: NodeId) -> Self {
        Self::Nodes(vec![node])
    }
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Nodes(nodes) => {
                write!(f, "[")?;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", node)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Named configuration parameters pushed to node agents.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Build a one-entry parameter map.
pub fn param(name: &str, value: impl Into<serde_json::Value>) -> Params {
    let mut params = Params::new();
    params.insert(name.to_string(), value.into());
    params
}

/// Result reported by a single responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error { code: i32, message: String },
}

/// Error code for a responder that never answered.
pub const CODE_TIMEOUT: i32 = -1;

/// Error code for targets no responsive agent hosts.
pub const CODE_UNREACHABLE: i32 = -2;

/// Error code for a request that could not be sent.
pub const CODE_SEND_FAILED: i32 = -3;

/// One responder's answer to a fleet command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub responder: String,
    pub status: Status,
}

/// Aggregated result of a fleet command.
///
/// Fleet commands never fail with an `Err`; callers inspect the outcome and
/// decide what to do with failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    responses: Vec<Response>,
}

impl Outcome {
    pub fn new(responses: Vec<Response>) -> Self {
        Self { responses }
    }

    /// Single successful response.
    pub fn ok(responder: impl Into<String>) -> Self {
        Self::new(vec![Response {
            responder: responder.into(),
            status: Status::Ok,
        }])
    }

    /// Single failed response.
    pub fn failed(responder: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::new(vec![Response {
            responder: responder.into(),
            status: Status::Error {
                code,
                message: message.into(),
            },
        }])
    }

    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// True when every responder acknowledged the command.
    pub fn is_success(&self) -> bool {
        self.responses.iter().all(|r| r.status == Status::Ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Response> {
        self.responses.iter().filter(|r| r.status != Status::Ok)
    }

    pub fn merge(mut self, other: Outcome) -> Self {
        self.responses.extend(other.responses);
        self
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "ok ({} responders)", self.responses.len());
        }
        let failed: Vec<String> = self
            .failures()
            .map(|r| match &r.status {
                Status::Error { code, message } => {
                    format!("{}: [{}] {}", r.responder, code, message)
                }
                Status::Ok => unreachable!(),
            })
            .collect();
        write!(
            f,
            "{} of {} failed: {}",
            failed.len(),
            self.responses.len(),
            failed.join("; ")
        )
    }
}

/// Runtime sample reported by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEvent {
    /// Milliseconds since the Unix epoch, taken on receipt.
    pub timestamp_ms: u64,
    pub node: NodeId,
    pub name: String,
    pub value: serde_json::Value,
}

impl MeasurementEvent {
    /// Stamp a freshly received sample with the current wall-clock time.
    pub fn received(node: NodeId, name: String, value: serde_json::Value) -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            timestamp_ms,
            node,
            name,
            value,
        }
    }
}

/// Non-blocking delivery path for measurement events.
///
/// Delivery never waits: when the queue is full the sample is dropped and
/// counted.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MeasurementEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and the receiving end of its queue.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<MeasurementEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue an event. Returns false if it was dropped.
    pub fn deliver(&self, event: MeasurementEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    node = %event.node,
                    name = %event.name,
                    dropped,
                    "measurement queue full, dropping sample"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Samples dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//! Cwtune Fleet - Remote control of radio node agents
//!
//! The controller never talks to radios directly. It goes through a
//! [`FleetGateway`], which discovers the nodes, pushes MAC and application
//! parameters, switches radio programs and streams runtime events back.
//!
//! # Outcomes, not errors
//!
//! Every fleet command returns an [`Outcome`] with one entry per responder.
//! A timed-out or rejecting agent is a value to log, never an `Err`; only
//! gateway setup (binding, discovery) can fail.
//!
//! # Events
//!
//! Subscribed events arrive on the gateway's receive task and are pushed into
//! an [`EventSink`], a bounded queue that drops samples rather than block.
//!
//! # Example
//!
//! ```rust,ignore
//! use cwtune_fleet::{param, FleetGateway, Targets, UdpGateway, UdpGatewayConfig};
//!
//! let gateway = UdpGateway::connect(UdpGatewayConfig::default(), agents).await?;
//! gateway.wait_for_agents(agents.len(), Duration::from_secs(60)).await?;
//!
//! let outcome = gateway
//!     .push_mac_config(&param("IEEE802154_macCW", 11), &Targets::All)
//!     .await;
//! tracing::info!(%outcome, "pushed contention window");
//! ```

pub mod error;
pub mod gateway;
pub mod types;
pub mod udp;
pub mod wire;

pub use error::{Error, Result};
pub use gateway::FleetGateway;
pub use types::{
    param, EventSink, MeasurementEvent, NodeId, Outcome, Params, Response, Status, Targets,
    CODE_SEND_FAILED, CODE_TIMEOUT, CODE_UNREACHABLE,
};
pub use udp::{UdpGateway, UdpGatewayConfig};

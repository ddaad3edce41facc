//! Cwtune Control - Contention window tuning experiment controller
//!
//! Drives a fleet of radio nodes through a repeating experiment:
//!
//! 1. activate the receiver
//! 2. admit senders one at a time, re-tuning the CSMA contention window for
//!    the growing active set before each sender starts
//! 3. stop traffic, switch the whole fleet to TDMA, restart traffic
//! 4. observe, stop traffic, switch back to CSMA
//!
//! Measurements subscribed from the nodes stream into a
//! [`MeasurementLogger`](telemetry::MeasurementLogger) alongside the loop.
//!
//! # Running
//!
//! ```text
//! cwtune --config controller.yaml --nodes nodes.yaml --measurements measurements.yaml
//! ```
//!
//! `Ctrl-C` stops the loop at its next wait; the measurement subscription is
//! then stopped and the fleet connection released.

pub mod cli;
pub mod config;
pub mod error;
pub mod experiment;
pub mod pacer;
pub mod phase;
pub mod policy;
pub mod telemetry;

pub use config::{ControllerConfig, Delays, MeasurementConfig, Roster};
pub use error::{Error, Result};
pub use experiment::{run_experiment, ExperimentSummary};
pub use pacer::{Cancelled, Pacer, Shutdown};
pub use phase::{CycleReport, Phase, PhaseController, PhaseSettings, Progress};
pub use policy::{FailurePolicy, FailureTracker};
pub use telemetry::{
    open_logger, EventSubscriptionLog, JsonLinesLogger, MeasurementLogger, TelemetryStats,
    TracingLogger,
};

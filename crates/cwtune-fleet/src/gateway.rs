//! The interface the controller uses to reach the fleet.

use std::future::Future;

use cwtune_mac::{RadioProgram, Slotframe};

use crate::types::{EventSink, NodeId, Outcome, Params, Targets};

/// Discovery and remote configuration of a fleet of radio nodes.
///
/// Every command may wait on a network round-trip and reports an [`Outcome`]
/// instead of failing; callers must inspect and log it.
pub trait FleetGateway: Send + Sync {
    /// Nodes currently known, in discovery order, each listed once.
    ///
    /// Called at the start of every cycle; implementations may use it to
    /// pick up nodes that appeared since the last call.
    fn list_nodes(&self) -> impl Future<Output = Vec<NodeId>> + Send;

    /// Push MAC-layer parameters.
    fn push_mac_config(
        &self,
        params: &Params,
        targets: &Targets,
    ) -> impl Future<Output = Outcome> + Send;

    /// Push application-layer parameters.
    fn push_app_config(
        &self,
        params: &Params,
        targets: &Targets,
    ) -> impl Future<Output = Outcome> + Send;

    /// Load a radio program on every node.
    fn switch_protocol(&self, program: RadioProgram) -> impl Future<Output = Outcome> + Send;

    /// Install the TDMA slotframe on every node.
    fn load_slot_schedule(&self, frame: &Slotframe) -> impl Future<Output = Outcome> + Send;

    /// Start forwarding the named events into `sink`.
    ///
    /// Delivery happens off the caller's task and may interleave with any
    /// other command.
    fn subscribe_events(
        &self,
        events: &[String],
        filter_mask: u32,
        sink: EventSink,
    ) -> impl Future<Output = Outcome> + Send;

    /// Stop event delivery and release the sink.
    fn unsubscribe_events(&self) -> impl Future<Output = Outcome> + Send;

    /// Release the connection to the fleet. Safe to call more than once.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl<T: FleetGateway> FleetGateway for &T {
    fn list_nodes(&self) -> impl Future<Output = Vec<NodeId>> + Send {
        (**self).list_nodes()
    }

    fn push_mac_config(
        &self,
        params: &Params,
        targets: &Targets,
    ) -> impl Future<Output = Outcome> + Send {
        (**self).push_mac_config(params, targets)
    }

    fn push_app_config(
        &self,
        params: &Params,
        targets: &Targets,
    ) -> impl Future<Output = Outcome> + Send {
        (**self).push_app_config(params, targets)
    }

    fn switch_protocol(&self, program: RadioProgram) -> impl Future<Output = Outcome> + Send {
        (**self).switch_protocol(program)
    }

    fn load_slot_schedule(&self, frame: &Slotframe) -> impl Future<Output = Outcome> + Send {
        (**self).load_slot_schedule(frame)
    }

    fn subscribe_events(
        &self,
        events: &[String],
        filter_mask: u32,
        sink: EventSink,
    ) -> impl Future<Output = Outcome> + Send {
        (**self).subscribe_events(events, filter_mask, sink)
    }

    fn unsubscribe_events(&self) -> impl Future<Output = Outcome> + Send {
        (**self).unsubscribe_events()
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        (**self).close()
    }
}

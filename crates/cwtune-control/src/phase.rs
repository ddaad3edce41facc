//! Experiment phase state machine.
//!
//! One cycle:
//!
//! ```text
//! Idle
//!  └─► ActivatingReceiver   activate app on the receiver, settle
//!       └─► AdmittingSenders   per sender: CW(|active|) → active set, start sender, settle
//!            └─► SwitchingToTdma   stop app everywhere, load TDMA, settle
//!                 └─► TdmaActive     start app everywhere, observe
//!                      └─► SwitchingToCsma   stop app everywhere, load CSMA, settle
//!                           └─► Idle
//! ```
//!
//! Ordering guarantees within a cycle:
//! - a sender's CW push reaches the whole active set before the sender starts
//! - the fleet-wide stop precedes every program switch
//! - a program switch precedes the next fleet-wide start
//!
//! Cancellation is checked before every fleet command, before every retry and
//! during every wait, so no command leaves the controller once a stop is
//! requested.

use cwtune_fleet::{param, FleetGateway, NodeId, Outcome, Params, Targets};
use cwtune_mac::{contention_window, RadioProgram, Slotframe};
use tracing::{debug, info, warn};

use crate::config::{AppSection, ControllerConfig, Delays, MacSection};
use crate::error::Error;
use crate::pacer::{Cancelled, Pacer};
use crate::policy::{FailurePolicy, FailureTracker};

/// Current stage of the experiment cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ActivatingReceiver,
    AdmittingSenders,
    SwitchingToTdma,
    TdmaActive,
    SwitchingToCsma,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ActivatingReceiver => write!(f, "ActivatingReceiver"),
            Self::AdmittingSenders => write!(f, "AdmittingSenders"),
            Self::SwitchingToTdma => write!(f, "SwitchingToTDMA"),
            Self::TdmaActive => write!(f, "TDMAActive"),
            Self::SwitchingToCsma => write!(f, "SwitchingToCSMA"),
        }
    }
}

/// Whether a run finished its work or was stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Completed,
    Cancelled,
}

/// Why a controller step stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Cancelled,
    Failed(Error),
}

impl From<Cancelled> for Halt {
    fn from(_: Cancelled) -> Self {
        Halt::Cancelled
    }
}

pub(crate) fn settle(result: Result<(), Halt>) -> crate::Result<Progress> {
    match result {
        Ok(()) => Ok(Progress::Completed),
        Err(Halt::Cancelled) => Ok(Progress::Cancelled),
        Err(Halt::Failed(e)) => Err(e),
    }
}

/// Everything the controller needs besides the gateway and the pacer.
#[derive(Debug, Clone, Default)]
pub struct PhaseSettings {
    pub delays: Delays,
    /// Fixed receiver; the first discovered node when unset
    pub receiver: Option<NodeId>,
    pub failure_policy: FailurePolicy,
    pub mac: MacSection,
    pub app: AppSection,
    /// Schedule pushed during setup
    pub slotframe: Option<Slotframe>,
}

impl PhaseSettings {
    pub fn from_config(config: &ControllerConfig, slotframe: Option<Slotframe>) -> Self {
        Self {
            delays: config.controller.delays,
            receiver: config.controller.receiver.clone(),
            failure_policy: config.controller.failure_policy,
            mac: config.mac.clone(),
            app: config.app.clone(),
            slotframe,
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub receiver: Option<NodeId>,
    pub senders: usize,
    pub final_cw: u16,
    pub failed_commands: u64,
}

/// Drives the fleet through the experiment phases.
///
/// The fleet roster and the active sender set live here and are only touched
/// by the task running the controller.
pub struct PhaseController<'g, G: FleetGateway> {
    gateway: &'g G,
    settings: PhaseSettings,
    pacer: Pacer,
    failures: FailureTracker,
    phase: Phase,
    fleet: Vec<NodeId>,
    receiver: Option<NodeId>,
    active: Vec<NodeId>,
    cw: u16,
    cycles: u64,
    last_report: Option<CycleReport>,
}

impl<'g, G: FleetGateway> PhaseController<'g, G> {
    pub fn new(gateway: &'g G, settings: PhaseSettings, pacer: Pacer) -> Self {
        let failures = FailureTracker::new(settings.failure_policy);
        Self {
            gateway,
            settings,
            pacer,
            failures,
            phase: Phase::Idle,
            fleet: Vec::new(),
            receiver: None,
            active: Vec::new(),
            cw: contention_window(1),
            cycles: 0,
            last_report: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &PhaseSettings {
        &self.settings
    }

    /// Senders admitted so far in the current cycle, in admission order.
    pub fn active_senders(&self) -> &[NodeId] {
        &self.active
    }

    /// Roster read at the start of the current cycle.
    pub fn fleet(&self) -> &[NodeId] {
        &self.fleet
    }

    /// Contention window last pushed to the active set.
    pub fn contention_window(&self) -> u16 {
        self.cw
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles
    }

    pub fn failed_commands(&self) -> u64 {
        self.failures.total_failures()
    }

    /// Report of the most recently completed cycle.
    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    /// Run exactly one cycle.
    pub async fn run_cycle(&mut self) -> crate::Result<Progress> {
        settle(self.cycle().await)
    }

    pub(crate) async fn run_cycles(&mut self) -> Result<(), Halt> {
        loop {
            self.cycle().await?;
        }
    }

    /// Push the baseline schedule and slotframe size, then settle.
    pub(crate) async fn prepare(&mut self) -> Result<(), Halt> {
        self.fleet = self.gateway.list_nodes().await;
        info!(
            nodes = %Targets::Nodes(self.fleet.clone()),
            "connected nodes"
        );

        if let Some(frame) = self.settings.slotframe.clone() {
            let gateway = self.gateway;
            let outcome = self
                .command("load slotframe", || gateway.load_slot_schedule(&frame))
                .await?;
            info!(slots = frame.len(), %outcome, "loaded slotframe");
        }

        let params = param(&self.settings.mac.slotframe_size_param, self.fleet.len());
        let outcome = self.push_mac(&params, &Targets::All).await?;
        info!(size = self.fleet.len(), %outcome, "set slotframe size");

        self.pause(self.settings.delays.baseline_settle).await
    }

    /// Baseline settle delay, used around the telemetry subscription.
    pub(crate) async fn pause(&mut self, units: u32) -> Result<(), Halt> {
        self.pacer.wait(units).await?;
        Ok(())
    }

    async fn cycle(&mut self) -> Result<(), Halt> {
        self.begin_cycle().await;

        self.enter(Phase::ActivatingReceiver);
        match self.receiver.clone() {
            Some(receiver) => {
                let outcome = self.set_app(true, &Targets::one(receiver.clone())).await?;
                info!(node = %receiver, %outcome, "activated receiver");
            }
            None => warn!("fleet is empty, no receiver to activate"),
        }
        self.pacer.wait(self.settings.delays.receiver_settle).await?;

        self.enter(Phase::AdmittingSenders);
        self.cw = contention_window(1);
        let mut senders: Vec<NodeId> = Vec::with_capacity(self.fleet.len());
        for node in &self.fleet {
            if Some(node) != self.receiver.as_ref() && !senders.contains(node) {
                senders.push(node.clone());
            }
        }
        for sender in senders {
            self.admit(sender).await?;
            self.pacer.wait(self.settings.delays.admission).await?;
        }

        self.enter(Phase::SwitchingToTdma);
        info!(senders = self.active.len(), "switching all nodes to TDMA");
        self.switch_program(RadioProgram::Tdma).await?;

        self.enter(Phase::TdmaActive);
        let outcome = self.set_app(true, &Targets::All).await?;
        info!(%outcome, "started application on all nodes");
        self.pacer.wait(self.settings.delays.observation).await?;

        self.enter(Phase::SwitchingToCsma);
        self.switch_program(RadioProgram::Csma).await?;

        self.enter(Phase::Idle);
        self.cycles += 1;
        let report = CycleReport {
            cycle: self.cycles,
            receiver: self.receiver.clone(),
            senders: self.active.len(),
            final_cw: self.cw,
            failed_commands: self.failures.total_failures(),
        };
        info!(
            cycle = report.cycle,
            senders = report.senders,
            final_cw = report.final_cw,
            failed_commands = report.failed_commands,
            "cycle complete"
        );
        self.last_report = Some(report);
        Ok(())
    }

    /// Re-read the roster and reset the active set.
    async fn begin_cycle(&mut self) {
        self.fleet = self.gateway.list_nodes().await;
        self.active.clear();
        self.receiver = match &self.settings.receiver {
            Some(fixed) => {
                if !self.fleet.contains(fixed) {
                    warn!(node = %fixed, "configured receiver is not in the fleet");
                }
                Some(fixed.clone())
            }
            None => self.fleet.first().cloned(),
        };
        debug!(
            cycle = self.cycles + 1,
            fleet = self.fleet.len(),
            receiver = ?self.receiver,
            "starting cycle"
        );
    }

    /// Admit one sender: grow the active set, push the new window to all of
    /// it, then start the sender's application.
    async fn admit(&mut self, sender: NodeId) -> Result<(), Halt> {
        info!(node = %sender, "adding sender");
        self.active.push(sender.clone());

        let old = self.cw;
        self.cw = contention_window(self.active.len());
        let params = param(&self.settings.mac.cw_param, self.cw);
        let targets = Targets::Nodes(self.active.clone());
        let outcome = self.push_mac(&params, &targets).await?;
        info!(from = old, to = self.cw, targets = %targets, %outcome, "changed contention window");

        let outcome = self.set_app(true, &Targets::one(sender.clone())).await?;
        info!(node = %sender, %outcome, "activated application");
        Ok(())
    }

    /// Stop the application everywhere, load `program`, let it settle.
    async fn switch_program(&mut self, program: RadioProgram) -> Result<(), Halt> {
        let outcome = self.set_app(false, &Targets::All).await?;
        info!(%outcome, "stopped application on all nodes");
        self.pacer.wait(self.settings.delays.stop_settle).await?;

        let gateway = self.gateway;
        let label = format!("switch to {}", program);
        let outcome = self
            .command(&label, || gateway.switch_protocol(program))
            .await?;
        info!(program = %program, scheme = program.scheme(), %outcome, "activated radio program");
        self.pacer.wait(self.settings.delays.switch_settle).await?;
        Ok(())
    }

    async fn set_app(&mut self, active: bool, targets: &Targets) -> Result<Outcome, Halt> {
        let params = param(&self.settings.app.activate_param, u8::from(active));
        let gateway = self.gateway;
        let label = if active {
            format!("activate application on {}", targets)
        } else {
            format!("deactivate application on {}", targets)
        };
        self.command(&label, || gateway.push_app_config(&params, targets))
            .await
    }

    async fn push_mac(&mut self, params: &Params, targets: &Targets) -> Result<Outcome, Halt> {
        let gateway = self.gateway;
        let label = format!("mac config on {}", targets);
        self.command(&label, || gateway.push_mac_config(params, targets))
            .await
    }

    /// Issue one fleet command through the failure policy.
    async fn command<F, Fut>(&mut self, operation: &str, send: F) -> Result<Outcome, Halt>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Outcome>,
    {
        self.failures.issue(operation, &mut self.pacer, send).await
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer;
    use cwtune_fleet::EventSink;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Mac(Params, Targets),
        App(Params, Targets),
        Switch(RadioProgram),
    }

    #[derive(Default)]
    struct Recorder {
        nodes: Vec<NodeId>,
        calls: Mutex<Vec<Call>>,
        fail_switch: bool,
    }

    impl Recorder {
        fn with_nodes(ids: &[u64]) -> Self {
            Self {
                nodes: ids.iter().map(|&n| NodeId::from(n)).collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FleetGateway for Recorder {
        async fn list_nodes(&self) -> Vec<NodeId> {
            self.nodes.clone()
        }

        async fn push_mac_config(&self, params: &Params, targets: &Targets) -> Outcome {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Mac(params.clone(), targets.clone()));
            Outcome::ok("recorder")
        }

        async fn push_app_config(&self, params: &Params, targets: &Targets) -> Outcome {
            self.calls
                .lock()
                .unwrap()
                .push(Call::App(params.clone(), targets.clone()));
            Outcome::ok("recorder")
        }

        async fn switch_protocol(&self, program: RadioProgram) -> Outcome {
            self.calls.lock().unwrap().push(Call::Switch(program));
            if self.fail_switch {
                Outcome::failed("recorder", 1, "radio busy")
            } else {
                Outcome::ok("recorder")
            }
        }

        async fn load_slot_schedule(&self, _frame: &Slotframe) -> Outcome {
            Outcome::ok("recorder")
        }

        async fn subscribe_events(
            &self,
            _events: &[String],
            _mask: u32,
            _sink: EventSink,
        ) -> Outcome {
            Outcome::ok("recorder")
        }

        async fn unsubscribe_events(&self) -> Outcome {
            Outcome::ok("recorder")
        }

        async fn close(&self) {}
    }

    fn fast_settings() -> PhaseSettings {
        PhaseSettings {
            delays: Delays {
                receiver_settle: 0,
                admission: 0,
                stop_settle: 0,
                switch_settle: 0,
                observation: 0,
                baseline_settle: 0,
            },
            ..Default::default()
        }
    }

    fn cw_of(call: &Call) -> Option<u64> {
        match call {
            Call::Mac(params, _) => params.get("IEEE802154_macCW").and_then(|v| v.as_u64()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn admission_grows_active_set_one_by_one() {
        let gateway = Recorder::with_nodes(&[1, 2, 3, 4, 5]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);

        assert_eq!(controller.run_cycle().await.unwrap(), Progress::Completed);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.cycles_completed(), 1);
        assert_eq!(controller.active_senders().len(), 4);

        let pushes: Vec<(u64, usize)> = gateway
            .calls()
            .iter()
            .filter_map(|call| match call {
                Call::Mac(_, Targets::Nodes(nodes)) => cw_of(call).map(|cw| (cw, nodes.len())),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, vec![(7, 1), (11, 2), (17, 3), (23, 4)]);
        assert_eq!(controller.contention_window(), 23);

        let report = controller.last_report().unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.receiver, Some(NodeId::from(1)));
        assert_eq!(report.senders, 4);
        assert_eq!(report.final_cw, 23);
    }

    #[tokio::test]
    async fn scheduled_switch_waits_for_full_admission() {
        let gateway = Recorder::with_nodes(&[1, 2, 3, 4]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);
        controller.run_cycle().await.unwrap();

        let calls = gateway.calls();
        let tdma = calls
            .iter()
            .position(|c| *c == Call::Switch(RadioProgram::Tdma))
            .unwrap();
        let on = serde_json::json!(1);
        let activations_before = calls[..tdma]
            .iter()
            .filter(|c| {
                matches!(c, Call::App(p, Targets::Nodes(_)) if p.values().next() == Some(&on))
            })
            .count();
        // Receiver plus three senders.
        assert_eq!(activations_before, 4);

        // Every switch is directly preceded by a fleet-wide stop.
        for (i, call) in calls.iter().enumerate() {
            if let Call::Switch(_) = call {
                match &calls[i - 1] {
                    Call::App(params, Targets::All) => {
                        assert_eq!(params.values().next(), Some(&serde_json::json!(0)));
                    }
                    other => panic!("switch preceded by {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn fixed_receiver_is_excluded_from_senders() {
        let gateway = Recorder::with_nodes(&[1, 2, 3]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let settings = PhaseSettings {
            receiver: Some(NodeId::from(2)),
            ..fast_settings()
        };
        let mut controller = PhaseController::new(&gateway, settings, pacer);
        controller.run_cycle().await.unwrap();

        assert_eq!(
            controller.active_senders(),
            &[NodeId::from(1), NodeId::from(3)]
        );
        match &gateway.calls()[0] {
            Call::App(_, targets) => assert_eq!(*targets, Targets::one(NodeId::from(2))),
            other => panic!("first call was {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_roster_entries_are_admitted_once() {
        let gateway = Recorder::with_nodes(&[1, 2, 2, 3, 3]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);
        controller.run_cycle().await.unwrap();

        assert_eq!(
            controller.active_senders(),
            &[NodeId::from(2), NodeId::from(3)]
        );
        assert_eq!(controller.contention_window(), 11);
    }

    #[tokio::test]
    async fn failed_switch_does_not_stop_the_cycle() {
        let gateway = Recorder {
            fail_switch: true,
            ..Recorder::with_nodes(&[1, 2])
        };
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);

        assert_eq!(controller.run_cycle().await.unwrap(), Progress::Completed);
        assert_eq!(controller.failed_commands(), 2);
    }

    #[tokio::test]
    async fn escalation_aborts_the_cycle() {
        let gateway = Recorder {
            fail_switch: true,
            ..Recorder::with_nodes(&[1, 2])
        };
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let settings = PhaseSettings {
            failure_policy: FailurePolicy::Escalate {
                max_consecutive_failures: 1,
            },
            ..fast_settings()
        };
        let mut controller = PhaseController::new(&gateway, settings, pacer);

        let err = controller.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Escalated { .. }));
        assert_eq!(controller.phase(), Phase::SwitchingToTdma);
        assert_eq!(gateway.calls().last(), Some(&Call::Switch(RadioProgram::Tdma)));
    }

    #[tokio::test]
    async fn cancelled_controller_sends_nothing() {
        let gateway = Recorder::with_nodes(&[1, 2]);
        let (shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        shutdown.trigger();
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);

        assert_eq!(controller.run_cycle().await.unwrap(), Progress::Cancelled);
        assert!(gateway.calls().is_empty());
        assert!(controller.last_report().is_none());
    }

    #[tokio::test]
    async fn prepare_sets_slotframe_size() {
        let gateway = Recorder::with_nodes(&[1, 2, 3]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);

        assert!(controller.prepare().await.is_ok());
        assert_eq!(controller.fleet().len(), 3);
        assert_eq!(
            gateway.calls(),
            vec![Call::Mac(
                param("IEEE802154e_macSlotframeSize", 3),
                Targets::All
            )]
        );
    }

    #[tokio::test]
    async fn empty_fleet_still_cycles() {
        let gateway = Recorder::with_nodes(&[]);
        let (_shutdown, pacer) = pacer::channel(Duration::from_millis(1));
        let mut controller = PhaseController::new(&gateway, fast_settings(), pacer);

        assert_eq!(controller.run_cycle().await.unwrap(), Progress::Completed);
        assert!(controller.active_senders().is_empty());
        assert_eq!(controller.contention_window(), 7);
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::SwitchingToTdma.to_string(), "SwitchingToTDMA");
        assert_eq!(Phase::TdmaActive.to_string(), "TDMAActive");
    }
}

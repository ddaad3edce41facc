//! One experiment run: baseline setup, telemetry, the cycle loop, teardown.

use cwtune_fleet::FleetGateway;
use tracing::{error, info};

use crate::config::MeasurementConfig;
use crate::error::Result;
use crate::pacer::Pacer;
use crate::phase::{settle, CycleReport, Halt, PhaseController, PhaseSettings, Progress};
use crate::telemetry::{EventSubscriptionLog, MeasurementLogger, TelemetryStats};

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentSummary {
    pub cycles: u64,
    pub failed_commands: u64,
    /// Report of the last cycle that ran to completion
    pub last_cycle: Option<CycleReport>,
    /// Absent when the run stopped before telemetry was started
    pub telemetry: Option<TelemetryStats>,
}

/// Run the experiment until cancelled.
///
/// Takes ownership of the gateway, or of a reference to it. On every exit
/// path the telemetry subscription, if started, is stopped first and the
/// gateway is closed exactly once afterwards. Cancellation is a normal return; only an
/// escalated failure policy produces an error.
pub async fn run_experiment<G: FleetGateway>(
    gateway: G,
    settings: PhaseSettings,
    measurements: &MeasurementConfig,
    logger: Box<dyn MeasurementLogger>,
    pacer: Pacer,
) -> Result<ExperimentSummary> {
    let mut controller = PhaseController::new(&gateway, settings, pacer);
    let mut telemetry = None;

    let result = drive(
        &mut controller,
        &gateway,
        measurements,
        logger,
        &mut telemetry,
    )
    .await;

    let stats = match telemetry {
        Some(log) => Some(log.stop(&gateway).await),
        None => None,
    };
    gateway.close().await;
    info!("fleet gateway closed");

    let summary = ExperimentSummary {
        cycles: controller.cycles_completed(),
        failed_commands: controller.failed_commands(),
        last_cycle: controller.last_report().cloned(),
        telemetry: stats,
    };

    match settle(result) {
        Ok(Progress::Cancelled) => {
            info!(
                cycles = summary.cycles,
                failed_commands = summary.failed_commands,
                phase = %controller.phase(),
                "experiment stopped"
            );
            Ok(summary)
        }
        Ok(Progress::Completed) => Ok(summary),
        Err(e) => {
            error!(error = %e, phase = %controller.phase(), "experiment aborted");
            Err(e)
        }
    }
}

async fn drive<G: FleetGateway>(
    controller: &mut PhaseController<'_, G>,
    gateway: &G,
    measurements: &MeasurementConfig,
    logger: Box<dyn MeasurementLogger>,
    telemetry: &mut Option<EventSubscriptionLog>,
) -> std::result::Result<(), Halt> {
    controller.prepare().await?;

    *telemetry = Some(EventSubscriptionLog::start(gateway, measurements, logger).await);
    let settle_units = controller.settings().delays.baseline_settle;
    controller.pause(settle_units).await?;

    controller.run_cycles().await
}

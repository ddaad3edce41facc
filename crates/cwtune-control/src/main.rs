//! cwtune binary
//!
//! Loads the configuration, connects to the node agents and runs the
//! experiment until interrupted.

use std::fs::OpenOptions;
use std::sync::Mutex;

use cwtune_control::cli::{self, Args, Command};
use cwtune_control::{
    open_logger, pacer, run_experiment, ControllerConfig, MeasurementConfig, PhaseSettings, Roster,
};
use cwtune_fleet::{FleetGateway, UdpGateway};
use cwtune_mac::Slotframe;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(args: &Args) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.verbosity.directive().into());
    let registry = tracing_subscriber::registry().with(filter);

    match &args.logfile {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => registry.with(fmt::layer()).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match cli::parse(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print!("{}", cli::usage());
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("cwtune {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            eprint!("{}", cli::usage());
            std::process::exit(2);
        }
    };

    init_tracing(&args)?;
    tracing::info!("Starting cwtune");

    let config = ControllerConfig::load(&args.config)?;
    let roster = Roster::load(&args.nodes)?;
    let measurements = MeasurementConfig::load(&args.measurements)?;
    let slotframe = match &config.controller.slotframe {
        Some(path) => Some(Slotframe::load(path)?),
        None => None,
    };

    let agents = roster.agents(config.gateway.agent_port)?;
    let required = roster
        .min_agents
        .or(config.gateway.min_agents)
        .unwrap_or(agents.len())
        .min(agents.len());
    let logger = open_logger(&measurements)?;

    let gateway = UdpGateway::connect(config.gateway.udp_config(), agents).await?;

    let (shutdown, mut pacer) = pacer::channel(config.controller.time_unit());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping");
            shutdown.trigger();
        }
    });

    tracing::info!(required, "Waiting for node agents");
    let deadline = config.gateway.discovery_timeout();
    let discovered = tokio::select! {
        result = gateway.wait_for_agents(required, deadline) => Some(result),
        _ = pacer.cancelled() => None,
    };
    match discovered {
        Some(Ok(responded)) => tracing::info!(responded, "Node agents ready"),
        Some(Err(e)) => {
            gateway.close().await;
            return Err(e.into());
        }
        None => {
            gateway.close().await;
            return Ok(());
        }
    }

    let settings = PhaseSettings::from_config(&config, slotframe);
    let summary = run_experiment(gateway, settings, &measurements, logger, pacer).await?;
    tracing::info!(
        cycles = summary.cycles,
        failed_commands = summary.failed_commands,
        "Experiment finished"
    );

    Ok(())
}

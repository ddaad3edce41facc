//! YAML configuration files.
//!
//! Three files feed the control program:
//! - controller config (`--config`): gateway, timing, parameter names
//! - roster (`--nodes`): agent addresses
//! - measurements (`--measurements`): subscribed events and output

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cwtune_fleet::{NodeId, UdpGatewayConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::policy::FailurePolicy;

/// Longest accepted time unit: one hour.
pub const MAX_TIME_UNIT_MS: u64 = 3_600_000;

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&text).map_err(|source| Error::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Controller configuration (`--config`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub gateway: GatewaySection,
    pub controller: ControllerSection,
    pub mac: MacSection,
    pub app: AppSection,
}

impl ControllerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.time_unit_ms == 0 {
            return Err(Error::Config("controller.time_unit_ms must be positive".into()));
        }
        if self.controller.time_unit_ms > MAX_TIME_UNIT_MS {
            return Err(Error::Config(format!(
                "controller.time_unit_ms must not exceed {}",
                MAX_TIME_UNIT_MS
            )));
        }
        if self.gateway.request_timeout_ms == 0 {
            return Err(Error::Config("gateway.request_timeout_ms must be positive".into()));
        }
        if let FailurePolicy::Escalate {
            max_consecutive_failures: 0,
        } = self.controller.failure_policy
        {
            return Err(Error::Config(
                "failure_policy.max_consecutive_failures must be positive".into(),
            ));
        }
        for (name, value) in [
            ("mac.cw_param", &self.mac.cw_param),
            ("mac.slotframe_size_param", &self.mac.slotframe_size_param),
            ("app.activate_param", &self.app.activate_param),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

/// How the controller reaches the node agents.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Local control socket address
    pub bind: SocketAddr,
    /// Port used for roster entries that carry none
    pub agent_port: u16,
    pub request_timeout_ms: u64,
    pub wait_for_agents_timeout_s: u64,
    /// Agents that must answer before the experiment starts
    pub min_agents: Option<usize>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            agent_port: 8989,
            request_timeout_ms: 2000,
            wait_for_agents_timeout_s: 60,
            min_agents: None,
        }
    }
}

impl GatewaySection {
    pub fn udp_config(&self) -> UdpGatewayConfig {
        UdpGatewayConfig {
            bind: self.bind,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..Default::default()
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_agents_timeout_s)
    }
}

/// Experiment sequencing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Length of one time unit; all delays are multiples of it
    pub time_unit_ms: u64,
    /// Node running the receiving application (default: first node)
    pub receiver: Option<NodeId>,
    /// Slotframe CSV loaded before the first cycle
    pub slotframe: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
    pub delays: Delays,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            time_unit_ms: 1000,
            receiver: None,
            slotframe: None,
            failure_policy: FailurePolicy::default(),
            delays: Delays::default(),
        }
    }
}

impl ControllerSection {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }
}

/// Settle delays, in time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Delays {
    /// After activating the receiver
    pub receiver_settle: u32,
    /// Between two sender admissions
    pub admission: u32,
    /// After stopping the application
    pub stop_settle: u32,
    /// After switching radio program
    pub switch_settle: u32,
    /// TDMA observation window
    pub observation: u32,
    /// Around the telemetry subscription during setup
    pub baseline_settle: u32,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            receiver_settle: 1,
            admission: 10,
            stop_settle: 1,
            switch_settle: 5,
            observation: 30,
            baseline_settle: 5,
        }
    }
}

/// MAC parameter names understood by the nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MacSection {
    pub cw_param: String,
    pub slotframe_size_param: String,
}

impl Default for MacSection {
    fn default() -> Self {
        Self {
            cw_param: "IEEE802154_macCW".to_string(),
            slotframe_size_param: "IEEE802154e_macSlotframeSize".to_string(),
        }
    }
}

/// Application parameter names understood by the nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub activate_param: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            activate_param: "RIME_exampleUnicastActivateApplication".to_string(),
        }
    }
}

/// Node agent roster (`--nodes`).
#[derive(Debug, Clone, Deserialize)]
pub struct Roster {
    /// Agent addresses in discovery order, `ip` or `host:port`
    pub ip_address_list: Vec<String>,
    #[serde(default)]
    pub min_agents: Option<usize>,
}

impl Roster {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let roster: Self = load_yaml(path.as_ref())?;
        if roster.ip_address_list.is_empty() {
            return Err(Error::Config(format!(
                "{}: ip_address_list is empty",
                path.as_ref().display()
            )));
        }
        Ok(roster)
    }

    /// Resolve every entry to a socket address.
    pub fn agents(&self, default_port: u16) -> Result<Vec<SocketAddr>> {
        self.ip_address_list
            .iter()
            .map(|entry| resolve_agent(entry.trim(), default_port))
            .collect()
    }
}

fn resolve_agent(entry: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved = if entry.contains(':') {
        entry.to_socket_addrs()
    } else {
        (entry, default_port).to_socket_addrs()
    };
    resolved
        .map_err(|e| Error::Config(format!("cannot resolve agent '{}': {}", entry, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("agent '{}' resolved to no address", entry)))
}

/// Telemetry subscription (`--measurements`).
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementConfig {
    /// Event names to subscribe to
    pub events: Vec<String>,
    #[serde(default)]
    pub filter_mask: u32,
    /// JSON Lines output file; samples go to the log when absent
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    1024
}

impl MeasurementConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(Error::Config("measurements: events list is empty".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::Config("measurements: queue_depth must be positive".into()));
        }
        Ok(())
    }
}

//! UDP client for node agents.
//!
//! Each agent runs next to one or more radio nodes and answers JSON
//! datagrams (see [`crate::wire`]). The gateway:
//! - discovers which nodes each agent hosts (`hello`), repeating `hello` for
//!   silent agents whenever the node list is read
//! - routes targeted commands to the agents hosting the targets
//! - fans `all` commands out to every responsive agent
//! - forwards pushed events into the subscriber's [`EventSink`]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cwtune_mac::{RadioProgram, Slotframe};
use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::gateway::FleetGateway;
use crate::types::{
    EventSink, MeasurementEvent, NodeId, Outcome, Params, Response, Status, Targets,
    CODE_SEND_FAILED, CODE_TIMEOUT, CODE_UNREACHABLE,
};
use crate::wire::{self, Command, Inbound, Reply, ReplyState, Request, MAX_DATAGRAM};

/// Pause between discovery rounds.
const DISCOVERY_RETRY: Duration = Duration::from_millis(500);

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct UdpGatewayConfig {
    /// Local address to bind to
    pub bind: SocketAddr,
    /// How long to wait for an agent's reply
    pub request_timeout: Duration,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for UdpGatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            request_timeout: Duration::from_secs(2),
            sndbuf: 1024 * 1024,
            rcvbuf: 1024 * 1024,
        }
    }
}

/// An agent that answered discovery.
#[derive(Debug, Clone)]
struct Agent {
    addr: SocketAddr,
    nodes: Vec<NodeId>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type SharedSink = Arc<Mutex<Option<EventSink>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fleet gateway speaking JSON over UDP to node agents.
pub struct UdpGateway {
    socket: Arc<UdpSocket>,
    /// Roster order.
    agents: Vec<SocketAddr>,
    /// Agents that answered discovery, kept in roster order.
    live: Mutex<Vec<Agent>>,
    pending: Pending,
    sink: SharedSink,
    /// Active `subscribe` command, replayed to agents that join late.
    subscription: Mutex<Option<Command>>,
    seq: AtomicU64,
    request_timeout: Duration,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpGateway {
    /// Bind the control socket and start receiving agent traffic.
    pub async fn connect(config: UdpGatewayConfig, agents: Vec<SocketAddr>) -> Result<Self> {
        if agents.is_empty() {
            return Err(Error::NoAgents);
        }

        let socket = Arc::new(bind(config.bind, config.sndbuf, config.rcvbuf)?);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let sink: SharedSink = Arc::new(Mutex::new(None));

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
            Arc::clone(&sink),
        ));

        info!(
            local = %socket.local_addr()?,
            agents = agents.len(),
            "fleet gateway bound"
        );

        Ok(Self {
            socket,
            agents,
            live: Mutex::new(Vec::new()),
            pending,
            sink,
            subscription: Mutex::new(None),
            seq: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        })
    }

    /// Local address of the control socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Greet agents until at least `required` of them answered.
    ///
    /// Returns the number of responsive agents.
    pub async fn wait_for_agents(&self, required: usize, deadline: Duration) -> Result<usize> {
        let required = required.clamp(1, self.agents.len());
        let started = Instant::now();

        loop {
            let responded = self.greet_silent().await;
            if responded >= required {
                return Ok(responded);
            }
            if started.elapsed() >= deadline {
                return Err(Error::AgentsUnavailable {
                    responded,
                    required,
                });
            }

            info!(responded, required, "waiting for node agents");
            tokio::time::sleep(DISCOVERY_RETRY).await;
        }
    }

    /// Send one `hello` to every roster agent that has not answered yet and
    /// register those that reply. Agents joining while a subscription is
    /// active are subscribed as well.
    ///
    /// Returns the number of responsive agents.
    async fn greet_silent(&self) -> usize {
        let silent: Vec<SocketAddr> = {
            let live = lock(&self.live);
            self.agents
                .iter()
                .filter(|addr| !live.iter().any(|a| a.addr == **addr))
                .copied()
                .collect()
        };
        if silent.is_empty() {
            return lock(&self.live).len();
        }

        let replies = join_all(silent.iter().map(|&addr| async move {
            (addr, self.exchange(addr, &Command::Hello).await)
        }))
        .await;

        let mut joined = Vec::new();
        for (addr, reply) in replies {
            match reply {
                Ok(reply) if reply.status == ReplyState::Ok => {
                    info!(agent = %addr, nodes = reply.nodes.len(), "agent responded");
                    self.register(addr, reply.nodes);
                    joined.push(addr);
                }
                Ok(reply) => {
                    warn!(agent = %addr, status = ?reply.status(), "agent refused hello");
                }
                Err(status) => {
                    debug!(agent = %addr, ?status, "agent silent");
                }
            }
        }

        let subscription = lock(&self.subscription).clone();
        if let Some(command) = subscription.as_ref() {
            let replies = join_all(joined.iter().map(|&addr| async move {
                (addr, self.exchange(addr, command).await)
            }))
            .await;
            for (addr, reply) in replies {
                let status = match reply {
                    Ok(reply) => reply.status(),
                    Err(status) => status,
                };
                match status {
                    Status::Ok => debug!(agent = %addr, "subscribed late agent"),
                    status => warn!(agent = %addr, ?status, "late agent refused subscription"),
                }
            }
        }

        lock(&self.live).len()
    }

    fn register(&self, addr: SocketAddr, nodes: Vec<NodeId>) {
        let mut live = lock(&self.live);
        live.retain(|a| a.addr != addr);
        live.push(Agent { addr, nodes });
        let order = |addr: &SocketAddr| self.agents.iter().position(|a| a == addr);
        live.sort_by_key(|a| order(&a.addr));
    }

    /// Send one command to one agent and wait for its reply.
    async fn exchange(
        &self,
        agent: SocketAddr,
        command: &Command,
    ) -> std::result::Result<Reply, Status> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            seq,
            command: command.clone(),
        };
        let bytes = wire::encode_request(&request).map_err(|e| Status::Error {
            code: CODE_SEND_FAILED,
            message: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(seq, tx);

        trace!(agent = %agent, seq, cmd = command.name(), "sending request");
        if let Err(e) = self.socket.send_to(&bytes, agent).await {
            lock(&self.pending).remove(&seq);
            return Err(Status::Error {
                code: CODE_SEND_FAILED,
                message: e.to_string(),
            });
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Status::Error {
                code: CODE_TIMEOUT,
                message: "gateway closed while waiting".to_string(),
            }),
            Err(_) => {
                lock(&self.pending).remove(&seq);
                Err(Status::Error {
                    code: CODE_TIMEOUT,
                    message: format!("no reply within {:?}", self.request_timeout),
                })
            }
        }
    }

    /// Split targets into per-agent node lists plus nodes nobody hosts.
    fn route(&self, targets: &Targets) -> (Vec<(SocketAddr, Option<Vec<NodeId>>)>, Vec<NodeId>) {
        let live = lock(&self.live);
        match targets {
            Targets::All => (live.iter().map(|a| (a.addr, None)).collect(), Vec::new()),
            Targets::Nodes(nodes) => {
                let routes = live
                    .iter()
                    .filter_map(|agent| {
                        let hosted: Vec<NodeId> = nodes
                            .iter()
                            .filter(|n| agent.nodes.contains(n))
                            .cloned()
                            .collect();
                        (!hosted.is_empty()).then_some((agent.addr, Some(hosted)))
                    })
                    .collect();
                let unrouted = nodes
                    .iter()
                    .filter(|n| !live.iter().any(|a| a.nodes.contains(n)))
                    .cloned()
                    .collect();
                (routes, unrouted)
            }
        }
    }

    /// Send a command to every agent the targets resolve to.
    async fn dispatch<F>(&self, targets: &Targets, build: F) -> Outcome
    where
        F: Fn(Option<Vec<NodeId>>) -> Command,
    {
        if self.closed.load(Ordering::Acquire) {
            return Outcome::failed("fleet", CODE_SEND_FAILED, Error::Closed.to_string());
        }
        if matches!(targets, Targets::Nodes(nodes) if nodes.is_empty()) {
            return Outcome::default();
        }

        let (routes, unrouted) = self.route(targets);
        if routes.is_empty() && unrouted.is_empty() {
            return Outcome::failed("fleet", CODE_UNREACHABLE, "no responsive agents");
        }

        let mut responses: Vec<Response> = unrouted
            .into_iter()
            .map(|node| Response {
                responder: format!("node {}", node),
                status: Status::Error {
                    code: CODE_UNREACHABLE,
                    message: "no responsive agent hosts this node".to_string(),
                },
            })
            .collect();

        let replies = join_all(routes.into_iter().map(|(addr, nodes)| {
            let command = build(nodes);
            async move { (addr, self.exchange(addr, &command).await) }
        }))
        .await;

        responses.extend(replies.into_iter().map(|(addr, reply)| Response {
            responder: addr.to_string(),
            status: match reply {
                Ok(reply) => reply.status(),
                Err(status) => status,
            },
        }));

        Outcome::new(responses)
    }
}

impl FleetGateway for UdpGateway {
    async fn list_nodes(&self) -> Vec<NodeId> {
        if !self.closed.load(Ordering::Acquire) {
            self.greet_silent().await;
        }

        let live = lock(&self.live);
        let mut nodes: Vec<NodeId> = Vec::new();
        for node in live.iter().flat_map(|a| a.nodes.iter()) {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        nodes
    }

    async fn push_mac_config(&self, params: &Params, targets: &Targets) -> Outcome {
        self.dispatch(targets, |nodes| Command::MacConfig {
            params: params.clone(),
            nodes,
        })
        .await
    }

    async fn push_app_config(&self, params: &Params, targets: &Targets) -> Outcome {
        self.dispatch(targets, |nodes| Command::AppConfig {
            params: params.clone(),
            nodes,
        })
        .await
    }

    async fn switch_protocol(&self, program: RadioProgram) -> Outcome {
        self.dispatch(&Targets::All, |_| Command::RadioProgram { program })
            .await
    }

    async fn load_slot_schedule(&self, frame: &Slotframe) -> Outcome {
        self.dispatch(&Targets::All, |_| Command::Slotframe {
            slots: frame.clone(),
        })
        .await
    }

    async fn subscribe_events(
        &self,
        events: &[String],
        filter_mask: u32,
        sink: EventSink,
    ) -> Outcome {
        let command = Command::Subscribe {
            events: events.to_vec(),
            mask: filter_mask,
        };
        *lock(&self.sink) = Some(sink);
        *lock(&self.subscription) = Some(command.clone());
        self.dispatch(&Targets::All, |_| command.clone()).await
    }

    async fn unsubscribe_events(&self) -> Outcome {
        let outcome = self
            .dispatch(&Targets::All, |_| Command::Unsubscribe)
            .await;
        lock(&self.subscription).take();
        lock(&self.sink).take();
        outcome
    }

    async fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        lock(&self.subscription).take();
        let subscribed = lock(&self.sink).take().is_some();
        if subscribed {
            let outcome = self
                .dispatch(&Targets::All, |_| Command::Unsubscribe)
                .await;
            debug!(%outcome, "unsubscribed on close");
        }

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(receiver) = lock(&self.receiver).take() {
            receiver.abort();
        }
        lock(&self.pending).clear();
        info!("fleet gateway closed");
    }
}

impl Drop for UdpGateway {
    fn drop(&mut self) {
        if let Some(receiver) = lock(&self.receiver).take() {
            receiver.abort();
        }
    }
}

/// Bind a UDP socket with the given buffer sizes.
fn bind(addr: SocketAddr, sndbuf: usize, rcvbuf: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(sndbuf)?;
    socket.set_recv_buffer_size(rcvbuf)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn receive_loop(socket: Arc<UdpSocket>, pending: Pending, sink: SharedSink) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "agent socket receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        match wire::decode_inbound(&buf[..len]) {
            Ok(Inbound::Reply(reply)) => {
                let waiter = lock(&pending).remove(&reply.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(agent = %from, seq = reply.seq, "late or unknown reply"),
                }
            }
            Ok(Inbound::Event { event }) => {
                let current = lock(&sink).clone();
                match current {
                    Some(sink) => {
                        sink.deliver(MeasurementEvent::received(
                            event.node,
                            event.name,
                            event.value,
                        ));
                    }
                    None => trace!(agent = %from, name = %event.name, "event without subscriber"),
                }
            }
            Err(e) => debug!(agent = %from, error = %e, "discarding malformed datagram"),
        }
    }
}

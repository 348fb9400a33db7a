//! Network router.
//!
//! [`NetworkRouter`] decides what happens to every NPDU that arrives on one of
//! the attached ports and to every NPDU the local application sends. With a
//! single port it behaves as a plain device: it delivers local traffic and
//! remembers which router reaches which remote network. With two or more ports
//! it forwards between them as described in Clause 6.
//!
//! The router never touches a socket. Each call returns [`RouterOutput`]s for
//! the caller to carry out, and timeouts are scheduled on the caller's
//! [`TimerQueue`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};

use super::{
    Address, NetworkError, NetworkMessage, NetworkPriority, Npdu, NpduBody, RejectMessageReason,
    Result, RoutingTablePort, GLOBAL_BROADCAST_NETWORK,
};
use crate::config::{PortConfig, RouterConfig};
use crate::datalink::LinkDestination;
use crate::timer::{TimerEvent, TimerHandle, TimerQueue};

/// Index of an attached port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// The port the local application lives on
pub const PRIMARY_PORT: PortId = PortId(0);

/// An attached network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub id: PortId,
    /// `None` until configured or learned
    pub network: Option<u16>,
    /// Our link address on this port, when known
    pub mac: Option<Vec<u8>>,
    /// Whether the network number came from configuration
    pub configured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStatus {
    Reachable,
    /// The next router reported itself busy for this network
    Busy,
    /// Older than the stale limit or rejected; still used but refreshed
    Stale,
}

/// How to reach a network that is not directly connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: u16,
    pub port: PortId,
    /// MAC of the next router on `port`
    pub next_hop: Vec<u8>,
    pub status: RouteStatus,
    pub updated_at: Instant,
}

/// One entry per remote network
#[derive(Debug, Clone, Default)]
pub struct RouterTable {
    entries: BTreeMap<u16, RouteEntry>,
}

impl RouterTable {
    pub fn get(&self, network: u16) -> Option<&RouteEntry> {
        self.entries.get(&network)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set_status(&mut self, network: u16, status: RouteStatus) -> bool {
        match self.entries.get_mut(&network) {
            Some(entry) if entry.status != status => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    /// Networks reached through the router at `next_hop` on `port`
    fn networks_via(&self, port: PortId, next_hop: &[u8]) -> Vec<u16> {
        self.entries
            .values()
            .filter(|entry| entry.port == port && entry.next_hop == next_hop)
            .map(|entry| entry.network)
            .collect()
    }
}

/// An NPDU handed to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub port: PortId,
    pub destination: LinkDestination,
    pub npdu: Npdu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutput {
    Transmit(Transmission),
    /// An APDU for the local application
    Deliver {
        source: Address,
        apdu: Bytes,
        expecting_reply: bool,
        priority: NetworkPriority,
    },
    Failure(NetworkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Delivered to the application or consumed by the network layer
    Local,
    Forward,
    /// Global broadcast, delivered and re-broadcast
    Broadcast,
    /// Queued until the destination network is resolved
    Pending,
    Drop(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub decision: RoutingDecision,
    pub outputs: Vec<RouterOutput>,
}

/// Where a forwarded NPDU came from, for Reject-Message-To-Network
#[derive(Debug, Clone)]
struct ReturnPath {
    port: PortId,
    mac: Vec<u8>,
}

#[derive(Debug)]
struct PendingNpdu {
    npdu: Npdu,
    /// `None` for traffic the local application originated
    return_path: Option<ReturnPath>,
}

#[derive(Debug, Default)]
struct PendingQueue {
    entries: VecDeque<PendingNpdu>,
    timer: Option<TimerHandle>,
}

#[derive(Debug)]
pub struct NetworkRouter {
    ports: Vec<Port>,
    table: RouterTable,
    pending: HashMap<u16, PendingQueue>,
    config: RouterConfig,
}

impl NetworkRouter {
    pub fn new(ports: &[PortConfig], config: RouterConfig) -> Self {
        let ports = ports
            .iter()
            .enumerate()
            .map(|(index, port)| Port {
                id: PortId(index as u16),
                network: port.network,
                mac: port.mac.clone(),
                configured: port.network.is_some(),
            })
            .collect();
        Self {
            ports,
            table: RouterTable::default(),
            pending: HashMap::new(),
            config,
        }
    }

    pub fn is_router(&self) -> bool {
        self.ports.len() > 1
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(id.0 as usize)
    }

    pub fn table(&self) -> &RouterTable {
        &self.table
    }

    /// NPDUs waiting for `network` to be resolved
    pub fn pending_count(&self, network: u16) -> usize {
        self.pending
            .get(&network)
            .map_or(0, |queue| queue.entries.len())
    }

    fn port_network(&self, id: PortId) -> Option<u16> {
        self.port(id).and_then(|port| port.network)
    }

    fn directly_connected(&self, network: u16) -> Option<PortId> {
        self.ports
            .iter()
            .find(|port| port.network == Some(network))
            .map(|port| port.id)
    }

    fn other_ports(&self, except: Option<PortId>) -> Vec<PortId> {
        self.ports
            .iter()
            .map(|port| port.id)
            .filter(|id| Some(*id) != except)
            .collect()
    }

    /// Whether a DADR on the primary network addresses the local device
    fn is_for_local(&self, mac: &[u8]) -> bool {
        mac.is_empty()
            || self
                .port(PRIMARY_PORT)
                .and_then(|port| port.mac.as_deref())
                .map_or(true, |ours| ours == mac)
    }

    /// The address the application sees as the sender
    fn delivery_source(&self, port: PortId, source_mac: &[u8], npdu: &Npdu) -> Address {
        if let Some(source) = &npdu.source {
            return source.clone();
        }
        match self.port_network(port) {
            Some(network) if port != PRIMARY_PORT => Address::remote(network, source_mac),
            _ => Address::local(source_mac),
        }
    }

    /// Wrap an NPDU for a link, naming the local device as SNET/SADR when an
    /// application PDU leaves on a port other than the primary one
    fn transmission(&self, port: PortId, destination: LinkDestination, mut npdu: Npdu) -> RouterOutput {
        if port != PRIMARY_PORT && npdu.source.is_none() && !npdu.is_network_message() {
            if let Some(primary) = self.port(PRIMARY_PORT) {
                if let (Some(network), Some(mac)) = (primary.network, primary.mac.as_ref()) {
                    npdu.source = Some(Address::remote(network, mac.clone()));
                }
            }
        }
        RouterOutput::Transmit(Transmission {
            port,
            destination,
            npdu,
        })
    }

    fn who_is_router(&self, network: u16, except: Option<PortId>) -> Vec<RouterOutput> {
        debug!("looking for a router to network {}", network);
        let query = Npdu::network_message(NetworkMessage::WhoIsRouterToNetwork(Some(network)));
        self.other_ports(except)
            .into_iter()
            .map(|port| self.transmission(port, LinkDestination::Broadcast, query.clone()))
            .collect()
    }

    /// Record that `network` is reached through `next_hop` on `port`;
    /// directly connected networks are never overwritten
    fn learn_route(&mut self, network: u16, port: PortId, next_hop: &[u8], now: Instant) -> bool {
        if next_hop.is_empty()
            || network == GLOBAL_BROADCAST_NETWORK
            || self.directly_connected(network).is_some()
        {
            return false;
        }
        let entry = RouteEntry {
            network,
            port,
            next_hop: next_hop.to_vec(),
            status: RouteStatus::Reachable,
            updated_at: now,
        };
        match self.table.entries.insert(network, entry) {
            Some(previous) if previous.port == port && previous.next_hop == next_hop => {}
            _ => info!(
                "network {} reachable on {} via {}",
                network,
                port,
                hex::encode(next_hop)
            ),
        }
        true
    }

    /// SNET/SADR of a routed NPDU tell us which router sits in front of SNET
    fn learn_from_source(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        npdu: &Npdu,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) {
        let Some(network) = npdu.source.as_ref().map(Address::network) else {
            return;
        };
        let known = self
            .table
            .get(network)
            .is_some_and(|entry| entry.status != RouteStatus::Stale);
        if !known && self.learn_route(network, port, source_mac, now) {
            self.flush_pending(network, timers, now, outputs);
        }
    }

    /// Hop count check and SNET/SADR stamping before an NPDU leaves again
    fn prepare_forward(
        &self,
        port: PortId,
        source_mac: &[u8],
        mut npdu: Npdu,
        network: u16,
        outputs: &mut Vec<RouterOutput>,
    ) -> Option<Npdu> {
        if npdu.hop_count == 0 {
            warn!("hop count exhausted for NPDU to network {}", network);
            if network != GLOBAL_BROADCAST_NETWORK && self.config.send_reject_on_unreachable {
                let path = ReturnPath {
                    port,
                    mac: source_mac.to_vec(),
                };
                outputs.push(self.reject_to_source(
                    &path,
                    &npdu,
                    network,
                    RejectMessageReason::Other,
                ));
            }
            outputs.push(RouterOutput::Failure(NetworkError::HopCountExhausted(
                network,
            )));
            return None;
        }
        npdu.hop_count -= 1;
        if npdu.source.is_none() {
            match self.port_network(port) {
                Some(arrival) if !source_mac.is_empty() => {
                    npdu.source = Some(Address::remote(arrival, source_mac));
                }
                _ => {
                    debug!("cannot forward from {}: network number unknown", port);
                    return None;
                }
            }
        }
        Some(npdu)
    }

    /// Send an NPDU with a DNET toward its network, queueing it when the
    /// network is busy or unknown
    fn forward(
        &mut self,
        npdu: Npdu,
        network: u16,
        return_path: Option<ReturnPath>,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) -> RoutingDecision {
        let except = return_path.as_ref().map(|path| path.port);

        if let Some(port) = self.directly_connected(network) {
            let mut npdu = npdu;
            let destination = npdu
                .destination
                .take()
                .map_or(LinkDestination::Broadcast, |dest| {
                    LinkDestination::from_mac(dest.mac())
                });
            outputs.push(self.transmission(port, destination, npdu));
            return RoutingDecision::Forward;
        }

        let route = self
            .table
            .get(network)
            .map(|entry| (entry.port, entry.next_hop.clone(), entry.status));
        match route {
            Some((port, next_hop, RouteStatus::Reachable)) => {
                outputs.push(self.transmission(port, LinkDestination::Unicast(next_hop), npdu));
                RoutingDecision::Forward
            }
            Some((port, next_hop, RouteStatus::Stale)) => {
                outputs.push(self.transmission(port, LinkDestination::Unicast(next_hop), npdu));
                outputs.extend(self.who_is_router(network, except));
                RoutingDecision::Forward
            }
            Some((_, _, RouteStatus::Busy)) => {
                let pending = PendingNpdu { npdu, return_path };
                self.enqueue(network, pending, false, timers, now, outputs)
            }
            None => {
                let pending = PendingNpdu { npdu, return_path };
                self.enqueue(network, pending, true, timers, now, outputs)
            }
        }
    }

    fn enqueue(
        &mut self,
        network: u16,
        pending: PendingNpdu,
        resolve: bool,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) -> RoutingDecision {
        let limit = self.config.pending_queue_limit;
        let timeout = self.config.resolution_timeout();
        let except = pending.return_path.as_ref().map(|path| path.port);

        let queue = self.pending.entry(network).or_default();
        if queue.entries.len() >= limit {
            warn!("pending queue for network {} is full", network);
            outputs.push(RouterOutput::Failure(NetworkError::PendingQueueFull(
                network,
            )));
            return RoutingDecision::Drop("pending queue full");
        }
        let first = queue.timer.is_none();
        if first {
            queue.timer = Some(timers.schedule(now + timeout, TimerEvent::RouteResolution(network)));
        }
        queue.entries.push_back(pending);

        if first && resolve {
            outputs.extend(self.who_is_router(network, except));
        }
        RoutingDecision::Pending
    }

    fn flush_pending(
        &mut self,
        network: u16,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) {
        let Some(queue) = self.pending.remove(&network) else {
            return;
        };
        if let Some(timer) = queue.timer {
            timers.cancel(timer);
        }
        debug!(
            "releasing {} pending NPDUs for network {}",
            queue.entries.len(),
            network
        );
        for pending in queue.entries {
            self.forward(pending.npdu, network, pending.return_path, timers, now, outputs);
        }
    }

    fn process_locally(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        npdu: &Npdu,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) {
        match &npdu.body {
            NpduBody::Apdu(apdu) => outputs.push(RouterOutput::Deliver {
                source: self.delivery_source(port, source_mac, npdu),
                apdu: apdu.clone(),
                expecting_reply: npdu.expecting_reply,
                priority: npdu.priority,
            }),
            NpduBody::Network(message) => {
                self.handle_network_message(port, source_mac, npdu, message, timers, now, outputs)
            }
        }
    }

    /// Route one NPDU received on `port` from the link address `source_mac`
    pub fn route_inbound(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        npdu: Npdu,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> RouteOutcome {
        let mut outputs = Vec::new();
        if self.port(port).is_none() {
            outputs.push(RouterOutput::Failure(NetworkError::UnknownPort(port)));
            return RouteOutcome {
                decision: RoutingDecision::Drop("unknown port"),
                outputs,
            };
        }

        self.learn_from_source(port, source_mac, &npdu, timers, now, &mut outputs);

        let decision = match npdu.destination.clone() {
            None => {
                if port == PRIMARY_PORT || npdu.is_network_message() {
                    self.process_locally(port, source_mac, &npdu, timers, now, &mut outputs);
                    RoutingDecision::Local
                } else {
                    RoutingDecision::Drop("local traffic on a secondary port")
                }
            }
            Some(destination) if destination.is_global_broadcast() => {
                self.process_locally(port, source_mac, &npdu, timers, now, &mut outputs);
                if self.is_router() {
                    if let Some(forwarded) = self.prepare_forward(
                        port,
                        source_mac,
                        npdu,
                        GLOBAL_BROADCAST_NETWORK,
                        &mut outputs,
                    ) {
                        for other in self.other_ports(Some(port)) {
                            outputs.push(self.transmission(
                                other,
                                LinkDestination::Broadcast,
                                forwarded.clone(),
                            ));
                        }
                    }
                    RoutingDecision::Broadcast
                } else {
                    RoutingDecision::Local
                }
            }
            Some(destination) => {
                let network = destination.network();
                match self.directly_connected(network) {
                    Some(target) if target == port => {
                        if port == PRIMARY_PORT && self.is_for_local(destination.mac()) {
                            self.process_locally(port, source_mac, &npdu, timers, now, &mut outputs);
                            RoutingDecision::Local
                        } else {
                            RoutingDecision::Drop("addressed to the arrival network")
                        }
                    }
                    Some(target) => {
                        let local = target == PRIMARY_PORT && self.is_for_local(destination.mac());
                        if local {
                            self.process_locally(port, source_mac, &npdu, timers, now, &mut outputs);
                        }
                        if local && !destination.is_broadcast() {
                            RoutingDecision::Local
                        } else {
                            self.forward_inbound(port, source_mac, npdu, network, timers, now, &mut outputs)
                        }
                    }
                    None if !self.is_router() => RoutingDecision::Drop("not a router"),
                    None => {
                        self.forward_inbound(port, source_mac, npdu, network, timers, now, &mut outputs)
                    }
                }
            }
        };

        RouteOutcome { decision, outputs }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_inbound(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        npdu: Npdu,
        network: u16,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) -> RoutingDecision {
        match self.prepare_forward(port, source_mac, npdu, network, outputs) {
            Some(forwarded) => {
                let return_path = ReturnPath {
                    port,
                    mac: source_mac.to_vec(),
                };
                self.forward(forwarded, network, Some(return_path), timers, now, outputs)
            }
            None => RoutingDecision::Drop("not forwardable"),
        }
    }

    /// Route an NPDU the local application originates
    pub fn route_outbound(
        &mut self,
        destination: &Address,
        body: NpduBody,
        expecting_reply: bool,
        priority: NetworkPriority,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Result<Vec<Transmission>> {
        let mut npdu = Npdu::new(body)
            .with_priority(priority)
            .expecting_reply(expecting_reply);
        npdu.hop_count = self.config.initial_hop_count;

        let mut outputs = Vec::new();
        if destination.is_local()
            || Some(destination.network()) == self.port_network(PRIMARY_PORT)
        {
            outputs.push(self.transmission(
                PRIMARY_PORT,
                LinkDestination::from_mac(destination.mac()),
                npdu,
            ));
        } else if destination.is_global_broadcast() {
            npdu.destination = Some(destination.clone());
            for port in self.other_ports(None) {
                outputs.push(self.transmission(port, LinkDestination::Broadcast, npdu.clone()));
            }
        } else {
            npdu.destination = Some(destination.clone());
            self.forward(npdu, destination.network(), None, timers, now, &mut outputs);
        }

        let mut transmissions = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                RouterOutput::Transmit(transmission) => transmissions.push(transmission),
                RouterOutput::Failure(err) => return Err(err),
                RouterOutput::Deliver { .. } => {}
            }
        }
        Ok(transmissions)
    }

    /// Networks this router reaches through ports other than `arrival`
    fn reachable_networks(&self, arrival: PortId) -> Vec<u16> {
        let direct = self
            .ports
            .iter()
            .filter(|port| port.id != arrival)
            .filter_map(|port| port.network);
        let learned = self
            .table
            .iter()
            .filter(|entry| entry.port != arrival)
            .map(|entry| entry.network);
        direct.chain(learned).collect::<BTreeSet<_>>().into_iter().collect()
    }

    fn routing_table_ports(&self) -> Vec<RoutingTablePort> {
        let direct = self.ports.iter().filter_map(|port| {
            port.network.map(|network| RoutingTablePort {
                network,
                port_id: (port.id.0 + 1).min(u8::MAX as u16) as u8,
                info: Bytes::new(),
            })
        });
        let learned = self.table.iter().map(|entry| RoutingTablePort {
            network: entry.network,
            port_id: (entry.port.0 + 1).min(u8::MAX as u16) as u8,
            info: Bytes::new(),
        });
        direct.chain(learned).collect()
    }

    /// Network message addressed back to the sender of `npdu`
    fn reply(&self, port: PortId, source_mac: &[u8], npdu: &Npdu, message: NetworkMessage) -> RouterOutput {
        let mut reply = Npdu::network_message(message);
        if let Some(source) = &npdu.source {
            reply.destination = Some(source.clone());
            reply.hop_count = self.config.initial_hop_count;
        }
        self.transmission(port, LinkDestination::from_mac(source_mac), reply)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_network_message(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        npdu: &Npdu,
        message: &NetworkMessage,
        timers: &mut TimerQueue,
        now: Instant,
        outputs: &mut Vec<RouterOutput>,
    ) {
        match message {
            NetworkMessage::WhoIsRouterToNetwork(requested) => {
                if !self.is_router() {
                    return;
                }
                let reachable = self.reachable_networks(port);
                match requested {
                    None if reachable.is_empty() => {}
                    None => {
                        let answer = Npdu::network_message(NetworkMessage::IAmRouterToNetwork(reachable));
                        outputs.push(self.transmission(port, LinkDestination::Broadcast, answer));
                    }
                    Some(network) if reachable.contains(network) => {
                        let answer =
                            Npdu::network_message(NetworkMessage::IAmRouterToNetwork(vec![*network]));
                        outputs.push(self.transmission(port, LinkDestination::Broadcast, answer));
                    }
                    Some(network) if self.directly_connected(*network) == Some(port) => {}
                    Some(network) => {
                        let mut query = Npdu::network_message(NetworkMessage::WhoIsRouterToNetwork(
                            Some(*network),
                        ));
                        query.source = npdu.source.clone().or_else(|| {
                            self.port_network(port)
                                .filter(|_| !source_mac.is_empty())
                                .map(|arrival| Address::remote(arrival, source_mac))
                        });
                        for other in self.other_ports(Some(port)) {
                            outputs.push(self.transmission(
                                other,
                                LinkDestination::Broadcast,
                                query.clone(),
                            ));
                        }
                    }
                }
            }
            NetworkMessage::IAmRouterToNetwork(networks) => {
                for network in networks {
                    if self.learn_route(*network, port, source_mac, now) {
                        self.flush_pending(*network, timers, now, outputs);
                    }
                }
                if self.is_router() && !networks.is_empty() {
                    let announcement =
                        Npdu::network_message(NetworkMessage::IAmRouterToNetwork(networks.clone()));
                    for other in self.other_ports(Some(port)) {
                        outputs.push(self.transmission(
                            other,
                            LinkDestination::Broadcast,
                            announcement.clone(),
                        ));
                    }
                }
            }
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => debug!(
                "{} could be router to network {} (performance {})",
                hex::encode(source_mac),
                network,
                performance_index
            ),
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                let status = match reason {
                    RejectMessageReason::RouterBusy => RouteStatus::Busy,
                    _ => RouteStatus::Stale,
                };
                self.table.set_status(*network, status);
                warn!("message to network {} rejected: {}", network, reason);
                outputs.push(RouterOutput::Failure(NetworkError::Rejected {
                    network: *network,
                    reason: *reason,
                }));
            }
            NetworkMessage::RouterBusyToNetwork(networks) => {
                let networks = if networks.is_empty() {
                    self.table.networks_via(port, source_mac)
                } else {
                    networks.clone()
                };
                for network in networks {
                    if self.table.set_status(network, RouteStatus::Busy) {
                        info!("router to network {} is busy", network);
                    }
                }
            }
            NetworkMessage::RouterAvailableToNetwork(networks) => {
                let networks = if networks.is_empty() {
                    self.table.networks_via(port, source_mac)
                } else {
                    networks.clone()
                };
                for network in networks {
                    if let Some(entry) = self.table.entries.get_mut(&network) {
                        entry.updated_at = now;
                        if entry.status != RouteStatus::Reachable {
                            entry.status = RouteStatus::Reachable;
                            info!("router to network {} is available", network);
                        }
                    }
                    self.flush_pending(network, timers, now, outputs);
                }
            }
            NetworkMessage::InitializeRoutingTable(entries) => {
                if !self.is_router() {
                    return;
                }
                let ack = if entries.is_empty() {
                    self.routing_table_ports()
                } else {
                    self.apply_routing_entries(entries, port, source_mac, now);
                    Vec::new()
                };
                outputs.push(self.reply(
                    port,
                    source_mac,
                    npdu,
                    NetworkMessage::InitializeRoutingTableAck(ack),
                ));
            }
            NetworkMessage::InitializeRoutingTableAck(entries) => {
                self.apply_routing_entries(entries, port, source_mac, now);
            }
            NetworkMessage::EstablishConnectionToNetwork {
                network,
                termination_time,
            } => debug!(
                "establish connection to network {} ({} s) not supported",
                network, termination_time
            ),
            NetworkMessage::DisconnectConnectionToNetwork(network) => {
                debug!("disconnect from network {} not supported", network)
            }
            NetworkMessage::WhatIsNetworkNumber => {
                if npdu.source.is_some() || npdu.destination.is_some() {
                    return;
                }
                let Some(local) = self.port(port) else {
                    return;
                };
                if let Some(network) = local.network {
                    let answer = Npdu::network_message(NetworkMessage::NetworkNumberIs {
                        network,
                        configured: local.configured,
                    });
                    outputs.push(self.transmission(port, LinkDestination::Broadcast, answer));
                }
            }
            NetworkMessage::NetworkNumberIs {
                network,
                configured,
            } => {
                if npdu.source.is_some() || npdu.destination.is_some() {
                    return;
                }
                if let Some(local) = self.ports.get_mut(port.0 as usize) {
                    match local.network {
                        None => {
                            info!("{} learned network number {}", port, network);
                            local.network = Some(*network);
                        }
                        Some(current) if current != *network && *configured => warn!(
                            "{} is configured as network {} but a peer claims {}",
                            port, current, network
                        ),
                        Some(_) => {}
                    }
                }
            }
            NetworkMessage::Other { message_type, .. } => {
                if source_mac.is_empty() {
                    return;
                }
                debug!("rejecting unknown network message 0x{:02X}", message_type);
                let network = npdu
                    .destination
                    .as_ref()
                    .map(Address::network)
                    .or_else(|| self.port_network(port))
                    .unwrap_or_default();
                outputs.push(self.reply(
                    port,
                    source_mac,
                    npdu,
                    NetworkMessage::RejectMessageToNetwork {
                        reason: RejectMessageReason::UnknownMessageType,
                        network,
                    },
                ));
            }
            NetworkMessage::Proprietary {
                message_type,
                vendor_id,
                ..
            } => debug!(
                "ignoring proprietary network message 0x{:02X} from vendor {}",
                message_type, vendor_id
            ),
        }
    }

    fn apply_routing_entries(
        &mut self,
        entries: &[RoutingTablePort],
        port: PortId,
        source_mac: &[u8],
        now: Instant,
    ) {
        for entry in entries {
            if entry.port_id == 0 {
                if self.table.entries.remove(&entry.network).is_some() {
                    info!("network {} purged from the routing table", entry.network);
                }
            } else {
                self.learn_route(entry.network, port, source_mac, now);
            }
        }
    }

    /// Give up on `network`: queued NPDUs are dropped, routed ones answered
    /// with Reject-Message-To-Network when configured
    pub fn on_resolution_timeout(&mut self, network: u16) -> Vec<RouterOutput> {
        let mut outputs = Vec::new();
        let Some(queue) = self.pending.remove(&network) else {
            return outputs;
        };
        let reason = match self.table.get(network) {
            Some(entry) if entry.status == RouteStatus::Busy => RejectMessageReason::RouterBusy,
            _ => RejectMessageReason::NotDirectlyConnected,
        };
        warn!(
            "no route to network {}, dropping {} pending NPDUs",
            network,
            queue.entries.len()
        );

        let mut local_failure = false;
        for pending in queue.entries {
            match pending.return_path {
                Some(path) => {
                    if self.config.send_reject_on_unreachable {
                        outputs.push(self.reject_to_source(&path, &pending.npdu, network, reason));
                    }
                }
                None => local_failure = true,
            }
        }
        if local_failure {
            outputs.push(RouterOutput::Failure(NetworkError::NetworkUnreachable(
                network,
            )));
        }
        outputs
    }

    fn reject_to_source(
        &self,
        path: &ReturnPath,
        npdu: &Npdu,
        network: u16,
        reason: RejectMessageReason,
    ) -> RouterOutput {
        let mut reject =
            Npdu::network_message(NetworkMessage::RejectMessageToNetwork { reason, network });
        // without SNET the originator sits on the arrival network itself
        if let Some(source) = npdu.source.clone() {
            if Some(source.network()) != self.port_network(path.port) {
                reject.destination = Some(source);
                reject.hop_count = self.config.initial_hop_count;
            }
        }
        self.transmission(path.port, LinkDestination::Unicast(path.mac.clone()), reject)
    }

    /// Mark routes not heard from within the stale limit; returns how many
    pub fn expire_routes(&mut self, now: Instant) -> usize {
        let stale_after = self.config.route_stale_after();
        let mut expired = 0;
        for entry in self.table.entries.values_mut() {
            if entry.status == RouteStatus::Reachable
                && now.saturating_duration_since(entry.updated_at) >= stale_after
            {
                entry.status = RouteStatus::Stale;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!("{} routes went stale", expired);
        }
        expired
    }
}

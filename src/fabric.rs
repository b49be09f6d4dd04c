// fabsim: Discrete-Event Simulation of Load Balancing in AI-Training Clos Fabrics
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Module with the network fabric: full-duplex links, FIFO ports, and the
//! host/switch arena with pluggable multipath port selection.

use std::{
    collections::{HashMap, VecDeque},
    net::Ipv4Addr,
};

use itertools::Itertools;
use log::trace;

use crate::{
    packet::Packet,
    routing::{FlowletEntry, FlowletTable, RouteCache, RouteTable, RoutingMode, RoutingParams},
    LinkId, NodeId, PortIx,
};

/// A full-duplex link between two `(node, port)` endpoints.
///
/// `next_free` tracks, per direction, when the link can accept the next
/// transmission; it is non-decreasing while the link is operational.
#[derive(Debug, Clone)]
pub struct Link {
    pub endpoints: [(NodeId, PortIx); 2],
    pub bandwidth_bps: f64,
    pub propagation_s: f64,
    pub failed: bool,
    next_free: [f64; 2],
    /// Packets offered to this link while failed.
    pub dropped: u64,
}

impl Link {
    pub fn new(
        a: (NodeId, PortIx),
        b: (NodeId, PortIx),
        bandwidth_bps: f64,
        propagation_s: f64,
    ) -> Self {
        Self {
            endpoints: [a, b],
            bandwidth_bps,
            propagation_s,
            failed: false,
            next_free: [0.0; 2],
            dropped: 0,
        }
    }

    /// Transmission direction index when sending out of `node`.
    pub fn direction_from(&self, node: NodeId) -> usize {
        if self.endpoints[0].0 == node {
            0
        } else {
            debug_assert_eq!(self.endpoints[1].0, node);
            1
        }
    }

    /// The far `(node, port)` endpoint as seen from `node`.
    pub fn peer_of(&self, node: NodeId) -> (NodeId, PortIx) {
        self.endpoints[1 - self.direction_from(node)]
    }

    pub fn serialization_s(&self, bytes: u32) -> f64 {
        bytes as f64 * 8.0 / self.bandwidth_bps
    }

    /// Earliest time a transmission in `dir` may start.
    pub fn earliest_start(&self, dir: usize, now: f64) -> f64 {
        now.max(self.next_free[dir])
    }

    /// Commit a transmission of `bytes` starting no earlier than `now`.
    /// Returns the arrival time at the far endpoint.
    pub fn transmit(&mut self, dir: usize, now: f64, bytes: u32) -> f64 {
        let start = self.earliest_start(dir, now);
        let done = start + self.serialization_s(bytes);
        debug_assert!(done >= self.next_free[dir], "link timer ran backwards");
        self.next_free[dir] = done;
        done + self.propagation_s
    }

    pub fn next_free(&self, dir: usize) -> f64 {
        self.next_free[dir]
    }
}

/// One attachment point of a node to a link, with a FIFO packet queue.
#[derive(Debug, Clone)]
pub struct Port {
    pub link: LinkId,
    queue: VecDeque<Packet>,
    /// Guards against scheduling a second drain while one is pending.
    pub drain_scheduled: bool,
    pub peak_depth: usize,
    pub enqueued_total: u64,
}

impl Port {
    fn new(link: LinkId) -> Self {
        Self {
            link,
            queue: VecDeque::new(),
            drain_scheduled: false,
            peak_depth: 0,
            enqueued_total: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }
}

/// What a node is: an end host with an address, or a transit switch.
#[derive(Debug, Clone, Copy)]
pub enum NodeKind {
    Host { ip: Ipv4Addr },
    Switch,
}

/// A host or switch in the arena. Owns its ports, routing table and policy.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub ports: Vec<Port>,
    pub table: RouteTable,
    pub mode: RoutingMode,
    pub(crate) flowlet: FlowletTable,
    route_cache: RouteCache,
}

impl Node {
    pub fn is_host(&self) -> bool {
        matches!(self.kind, NodeKind::Host { .. })
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        match self.kind {
            NodeKind::Host { ip } => Some(ip),
            NodeKind::Switch => None,
        }
    }
}

/// Result of draining a port: deliveries to schedule, and an optional time at
/// which the drain must resume because the link was busy.
#[derive(Debug, Default)]
pub struct DrainResult {
    pub deliveries: Vec<(f64, NodeId, Packet)>,
    pub resume_at: Option<f64>,
}

/// The whole fabric: flat arenas of nodes and links, plus drop accounting.
#[derive(Debug, Clone, Default)]
pub struct Fabric {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    /// Bumped whenever link state changes; invalidates per-node route caches.
    pub topo_version: u32,
    /// Global modeled-drop counter (TTL, no route, failed link, bad address).
    pub dropped: u64,
    host_by_ip: HashMap<Ipv4Addr, NodeId>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, name: impl Into<String>, ip: Ipv4Addr, mode: RoutingMode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind: NodeKind::Host { ip },
            ports: Vec::new(),
            table: RouteTable::new(),
            mode,
            flowlet: FlowletTable::new(),
            route_cache: RouteCache::default(),
        });
        self.host_by_ip.insert(ip, id);
        id
    }

    pub fn add_switch(&mut self, name: impl Into<String>, mode: RoutingMode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind: NodeKind::Switch,
            ports: Vec::new(),
            table: RouteTable::new(),
            mode,
            flowlet: FlowletTable::new(),
            route_cache: RouteCache::default(),
        });
        id
    }

    /// Connect two nodes with a fresh full-duplex link, creating one port on
    /// each side. Returns the link id and the two new port indices.
    pub fn connect(
        &mut self,
        a: NodeId,
        b: NodeId,
        bandwidth_bps: f64,
        propagation_s: f64,
    ) -> (LinkId, PortIx, PortIx) {
        let link_id = self.links.len();
        let port_a = self.nodes[a].ports.len();
        let port_b = self.nodes[b].ports.len();
        self.nodes[a].ports.push(Port::new(link_id));
        self.nodes[b].ports.push(Port::new(link_id));
        self.links.push(Link::new(
            (a, port_a),
            (b, port_b),
            bandwidth_bps,
            propagation_s,
        ));
        (link_id, port_a, port_b)
    }

    pub fn host_by_ip(&self, ip: Ipv4Addr) -> Option<NodeId> {
        self.host_by_ip.get(&ip).copied()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_host())
    }

    /// Mark a link failed and invalidate all route caches.
    pub fn fail_link(&mut self, link: LinkId) {
        self.links[link].failed = true;
        self.topo_version += 1;
    }

    /// Restore a failed link and invalidate all route caches.
    pub fn restore_link(&mut self, link: LinkId) {
        self.links[link].failed = false;
        self.topo_version += 1;
    }

    /// LPM candidates for `dst` at `node`: live links only, stable order,
    /// truncated to `max_path`. Cached per destination until the topology
    /// version changes.
    pub fn candidate_ports(&mut self, node: NodeId, dst: Ipv4Addr, max_path: usize) -> Vec<PortIx> {
        let version = self.topo_version;
        if let Some(cached) = self.nodes[node].route_cache.get(dst, version) {
            return cached.to_vec();
        }
        let n = &self.nodes[node];
        let mut candidates: Vec<PortIx> = n
            .table
            .lookup(dst)
            .iter()
            .copied()
            .filter(|&p| !self.links[n.ports[p].link].failed)
            .collect();
        candidates.truncate(max_path);
        self.nodes[node]
            .route_cache
            .put(dst, version, candidates.clone());
        candidates
    }

    /// Pick the egress port for `pkt` at `node`, or `None` if unroutable.
    ///
    /// Flowlet mode may rewrite the packet's `flowlet_field`.
    pub fn select_port(
        &mut self,
        node: NodeId,
        pkt: &mut Packet,
        now: f64,
        params: &RoutingParams,
    ) -> Option<PortIx> {
        let candidates = self.candidate_ports(node, pkt.l3.tuple.dst_ip, params.max_path);
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self.nodes[node].mode {
            RoutingMode::Ecmp => {
                candidates[(pkt.l3.tuple.hash64() % candidates.len() as u64) as usize]
            }
            RoutingMode::Flowlet => self.flowlet_choice(node, pkt, now, params, &candidates),
            RoutingMode::Adaptive => {
                let n = &self.nodes[node];
                let min_depth = candidates
                    .iter()
                    .map(|&p| n.ports[p].depth())
                    .min()
                    .unwrap();
                let tied = candidates
                    .iter()
                    .copied()
                    .filter(|&p| n.ports[p].depth() == min_depth)
                    .collect_vec();
                tied[(pkt.l3.tuple.hash64() % tied.len() as u64) as usize]
            }
        };
        Some(chosen)
    }

    fn flowlet_choice(
        &mut self,
        node: NodeId,
        pkt: &mut Packet,
        now: f64,
        params: &RoutingParams,
        candidates: &[PortIx],
    ) -> PortIx {
        let flow = pkt.transport.flow_id;
        let threshold = params.flowlet_n_packets;
        let previous = self.nodes[node].flowlet.get(&flow).copied();

        let (reroute, salt) = match previous {
            None => (true, 0),
            Some(e) => {
                // threshold 0 disables flowlet boundaries: flows stay pinned
                let boundary = threshold > 0
                    && (e.pkts_since_reroute >= threshold
                        || now - e.last_seen >= params.flowlet_idle_gap_s);
                let invalid = !candidates.contains(&e.chosen);
                if boundary || invalid {
                    (true, e.salt.wrapping_add(1))
                } else {
                    (false, e.salt)
                }
            }
        };

        pkt.l3.tuple.flowlet_field = salt;
        let chosen = if reroute {
            candidates[(pkt.l3.tuple.hash64() % candidates.len() as u64) as usize]
        } else {
            previous.unwrap().chosen
        };

        let entry = self
            .nodes[node]
            .flowlet
            .entry(flow)
            .or_insert(FlowletEntry {
                chosen,
                last_seen: now,
                pkts_since_reroute: 0,
                salt,
            });
        entry.chosen = chosen;
        entry.salt = salt;
        entry.last_seen = now;
        if reroute {
            entry.pkts_since_reroute = 0;
        }
        entry.pkts_since_reroute += 1;
        chosen
    }

    /// Put a packet on a port FIFO. Returns `true` when the caller must
    /// schedule a drain event (none was pending).
    pub fn enqueue(&mut self, node: NodeId, port: PortIx, pkt: Packet) -> bool {
        let p = &mut self.nodes[node].ports[port];
        p.queue.push_back(pkt);
        p.enqueued_total += 1;
        p.peak_depth = p.peak_depth.max(p.queue.len());
        if p.drain_scheduled {
            false
        } else {
            p.drain_scheduled = true;
            true
        }
    }

    /// Drain a port FIFO onto its link at time `now`.
    ///
    /// Pops and transmits head packets while the link is free; when the link is
    /// busy the head stays queued and `resume_at` tells the caller when to try
    /// again. The `drain_scheduled` flag is cleared only when the queue empties,
    /// so at most one drain event is ever pending per port.
    pub fn drain_port(&mut self, node: NodeId, port: PortIx, now: f64) -> DrainResult {
        let mut result = DrainResult::default();
        loop {
            let link_id = self.nodes[node].ports[port].link;
            if self.nodes[node].ports[port].queue.front().is_none() {
                self.nodes[node].ports[port].drain_scheduled = false;
                return result;
            }

            if self.links[link_id].failed {
                let mut pkt = self.nodes[node].ports[port].queue.pop_front().unwrap();
                pkt.l3.dropped = true;
                self.links[link_id].dropped += 1;
                self.dropped += 1;
                trace!(
                    "dropping packet of flow {} on failed link {link_id}",
                    pkt.transport.flow_id
                );
                continue;
            }

            let dir = self.links[link_id].direction_from(node);
            let start = self.links[link_id].earliest_start(dir, now);
            if start > now {
                // link busy: keep the head queued and come back when it frees up
                result.resume_at = Some(start);
                return result;
            }

            let size = self.nodes[node].ports[port].queue.front().unwrap().l3.size_bytes;
            let arrival = self.links[link_id].transmit(dir, now, size);
            let pkt = self.nodes[node].ports[port].queue.pop_front().unwrap();
            let (peer, _) = self.links[link_id].peer_of(node);
            result.deliveries.push((arrival, peer, pkt));
        }
    }
}

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
//! Module with the longest-prefix-match routing table and the multipath modes.

use std::{collections::HashMap, net::Ipv4Addr};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::{FlowId, PortIx};

/// How a node picks one egress port out of the LPM candidate set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoutingMode {
    /// Hash-pinned per-flow selection.
    Ecmp,
    /// ECMP with per-flowlet rerouting on packet-count or idle-gap boundaries.
    Flowlet,
    /// Per-packet shortest-queue selection, hash tie-break.
    Adaptive,
}

/// Tuning knobs shared by all nodes, resolved once from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct RoutingParams {
    /// Cap on the LPM candidate set after the live-link filter.
    pub max_path: usize,
    /// Packets after which a flowlet is rerouted; 0 pins flows to their first choice.
    pub flowlet_n_packets: u32,
    /// Idle gap within a flow that also triggers a flowlet reroute.
    pub flowlet_idle_gap_s: f64,
}

/// Longest-prefix-match table mapping prefixes to candidate port sets.
///
/// Entries are kept sorted by decreasing prefix length, so the first containing
/// entry of a linear sweep is the longest match. Port sets are sorted and
/// deduplicated; candidate ordering must be stable for deterministic hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<(Ipv4Net, Vec<PortIx>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add candidate ports for a prefix, merging with an existing entry.
    pub fn insert(&mut self, net: Ipv4Net, ports: impl IntoIterator<Item = PortIx>) {
        if let Some((_, existing)) = self.routes.iter_mut().find(|(n, _)| *n == net) {
            existing.extend(ports);
            existing.sort_unstable();
            existing.dedup();
            return;
        }
        let mut ports: Vec<PortIx> = ports.into_iter().collect();
        ports.sort_unstable();
        ports.dedup();
        self.routes.push((net, ports));
        self.routes
            .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()).then(a.cmp(b)));
    }

    /// Candidate ports of the longest prefix containing `dst`; empty if none.
    pub fn lookup(&self, dst: Ipv4Addr) -> &[PortIx] {
        self.routes
            .iter()
            .find(|(net, _)| net.contains(&dst))
            .map(|(_, ports)| ports.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Per-node cache of resolved candidate sets, keyed by destination address.
///
/// Entries remember the fabric topology version they were computed against and
/// lazily re-validate after failure injection bumps the version.
#[derive(Debug, Clone, Default)]
pub struct RouteCache {
    entries: HashMap<Ipv4Addr, (u32, Vec<PortIx>)>,
}

impl RouteCache {
    pub fn get(&self, dst: Ipv4Addr, version: u32) -> Option<&[PortIx]> {
        match self.entries.get(&dst) {
            Some((v, ports)) if *v == version => Some(ports),
            _ => None,
        }
    }

    pub fn put(&mut self, dst: Ipv4Addr, version: u32, ports: Vec<PortIx>) {
        self.entries.insert(dst, (version, ports));
    }
}

/// Flowlet bookkeeping one node keeps per flow.
#[derive(Debug, Clone, Copy)]
pub struct FlowletEntry {
    pub chosen: PortIx,
    pub last_seen: f64,
    pub pkts_since_reroute: u32,
    /// Current perturbation of the flow's `flowlet_field`; bumped on reroute.
    pub salt: u64,
}

/// Per-flow flowlet state of one node.
pub type FlowletTable = HashMap<FlowId, FlowletEntry>;

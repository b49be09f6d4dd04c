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
//! Module building the leaf-spine scalable-unit fabric and injecting link failures.

use std::{collections::VecDeque, net::Ipv4Addr};

use ipnet::Ipv4Net;
use log::{debug, info};
use rand::{prelude::SliceRandom, rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::{
    config::TopologyConfig,
    fabric::Fabric,
    metrics::TopologySummary,
    LinkId, NodeId,
};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("`topology.ai_factory_su.{field}`: at most 200 supported, got {got}")]
    DimensionTooLarge { field: &'static str, got: usize },
    #[error(
        "cannot fail {requested} of {total} links without disconnecting hosts \
         (only {failed} could be failed)"
    )]
    TooManyFailures {
        requested: usize,
        total: usize,
        failed: usize,
    },
}

/// The built fabric plus the leaf grouping the scenarios need.
#[derive(Debug, Clone)]
pub struct BuiltTopology {
    pub fabric: Fabric,
    /// Host node ids grouped by the leaf they attach to.
    pub hosts_by_leaf: Vec<Vec<NodeId>>,
    pub summary: TopologySummary,
}

impl BuiltTopology {
    /// Leaf index of a host, if it is one.
    pub fn leaf_of(&self, host: NodeId) -> Option<usize> {
        self.hosts_by_leaf
            .iter()
            .position(|hosts| hosts.contains(&host))
    }

    pub fn all_hosts(&self) -> Vec<NodeId> {
        self.hosts_by_leaf.iter().flatten().copied().collect()
    }
}

/// Address of the host at `(leaf, server)`.
fn host_ip(leaf: usize, server: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, leaf as u8, server as u8, 2)
}

/// Aggregate prefix of all hosts under a leaf.
fn leaf_net(leaf: usize) -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, leaf as u8, 0, 0), 16).unwrap()
}

fn host_net(leaf: usize, server: usize) -> Ipv4Net {
    Ipv4Net::new(host_ip(leaf, server), 32).unwrap()
}

const DEFAULT_NET: &str = "0.0.0.0/0";

/// Build the `ai_factory_su` fabric described by the configuration.
///
/// Deterministic and idempotent: identical configurations produce structurally
/// identical fabrics. Failure injection uses `seed` and refuses to disconnect
/// any host pair; it fails loudly if the requested fraction cannot be met.
pub fn build(cfg: &TopologyConfig, seed: u64) -> Result<BuiltTopology, TopologyError> {
    let su = &cfg.ai_factory_su;
    for (field, got) in [
        ("leaves", su.leaves),
        ("servers_per_leaf", su.servers_per_leaf),
    ] {
        // the 10.leaf.server.2 address plan caps both dimensions at one octet
        if got > 200 {
            return Err(TopologyError::DimensionTooLarge { field, got });
        }
    }

    let mut fabric = Fabric::new();
    let mode = cfg.routing.mode;
    let default_net: Ipv4Net = DEFAULT_NET.parse().unwrap();

    let spines: Vec<NodeId> = (0..su.spines)
        .map(|s| fabric.add_switch(format!("spine{s}"), mode))
        .collect();
    let leaves: Vec<NodeId> = (0..su.leaves)
        .map(|l| fabric.add_switch(format!("leaf{l}"), mode))
        .collect();

    let mut hosts_by_leaf = Vec::with_capacity(su.leaves);
    for (l, &leaf) in leaves.iter().enumerate() {
        let mut hosts = Vec::with_capacity(su.servers_per_leaf);
        for s in 0..su.servers_per_leaf {
            let host = fabric.add_host(format!("h{l}-{s}"), host_ip(l, s), mode);
            for _ in 0..su.server_parallel_links {
                let (_, leaf_port, host_port) = fabric.connect(
                    leaf,
                    host,
                    cfg.links.bandwidth_bps.server_to_leaf,
                    cfg.links.propagation_delay_s.server_to_leaf,
                );
                fabric.nodes[leaf].table.insert(host_net(l, s), [leaf_port]);
                fabric.nodes[host].table.insert(default_net, [host_port]);
            }
            hosts.push(host);
        }
        hosts_by_leaf.push(hosts);

        for &spine in &spines {
            for _ in 0..su.leaf_to_spine_parallel_links {
                let (_, leaf_port, spine_port) = fabric.connect(
                    leaf,
                    spine,
                    cfg.links.bandwidth_bps.leaf_to_spine,
                    cfg.links.propagation_delay_s.leaf_to_spine,
                );
                fabric.nodes[leaf].table.insert(default_net, [leaf_port]);
                fabric.nodes[spine].table.insert(leaf_net(l), [spine_port]);
            }
        }
    }

    let failed = inject_failures(&mut fabric, cfg.links.failure_percent, seed)?;
    info!(
        "built ai_factory_su fabric: {} leaves, {} spines, {} hosts, {} links ({} failed)",
        su.leaves,
        su.spines,
        su.leaves * su.servers_per_leaf,
        fabric.links.len(),
        failed
    );

    let summary = TopologySummary {
        leaves: su.leaves,
        spines: su.spines,
        hosts: su.leaves * su.servers_per_leaf,
        links: fabric.links.len(),
        failed_links: failed,
    };

    Ok(BuiltTopology {
        fabric,
        hosts_by_leaf,
        summary,
    })
}

/// Mark `percent`% of the links failed without disconnecting any host.
///
/// Candidates are drawn in seeded random order; a link whose failure would
/// partition the hosts is skipped. Returns the number of failed links.
fn inject_failures(fabric: &mut Fabric, percent: f64, seed: u64) -> Result<usize, TopologyError> {
    let total = fabric.links.len();
    let quota = (percent / 100.0 * total as f64).round() as usize;
    if quota == 0 {
        return Ok(0);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut candidates: Vec<LinkId> = (0..total).collect();
    candidates.shuffle(&mut rng);

    let mut failed = 0;
    for link in candidates {
        if failed == quota {
            break;
        }
        fabric.fail_link(link);
        if hosts_connected(fabric) {
            failed += 1;
            debug!("failed link {link}");
        } else {
            fabric.restore_link(link);
        }
    }

    if failed < quota {
        return Err(TopologyError::TooManyFailures {
            requested: quota,
            total,
            failed,
        });
    }
    Ok(failed)
}

/// Whether every host can still reach every other host over non-failed links.
fn hosts_connected(fabric: &Fabric) -> bool {
    let Some(start) = fabric.hosts().map(|n| n.id).next() else {
        return true;
    };
    let mut seen = vec![false; fabric.nodes.len()];
    let mut queue = VecDeque::from([start]);
    seen[start] = true;
    while let Some(node) = queue.pop_front() {
        for port in &fabric.nodes[node].ports {
            let link = &fabric.links[port.link];
            if link.failed {
                continue;
            }
            let (peer, _) = link.peer_of(node);
            if !seen[peer] {
                seen[peer] = true;
                queue.push_back(peer);
            }
        }
    }
    fabric.hosts().all(|n| seen[n.id])
}

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
//! End-to-end tests driving complete runs against hand-built and generated
//! fabrics, plus the boundary behaviors of the flow injector.

mod determinism;
mod scenarios;

use std::net::Ipv4Addr;

pub(crate) use crate::config::test_helpers::{config, topology_config};

use crate::{
    config::Config,
    fabric::Fabric,
    metrics::{RunReport, RunStatus, TopologySummary},
    routing::RoutingMode,
    sim::Simulation,
    topology::BuiltTopology,
    workload::{Bucket, FlowIdGen, FlowSpec, Job, JobStep, Phase},
    FlowId, NodeId,
};

pub(crate) fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// A job with a single comm phase holding one bucket of the given flows.
pub(crate) fn comm_job(flows: Vec<FlowSpec>) -> Job {
    Job {
        id: 0,
        name: "test_comm".to_string(),
        steps: vec![JobStep {
            phases: vec![Phase::Comm {
                buckets: vec![Bucket { flows }],
            }],
        }],
    }
}

pub(crate) fn one_flow_job(flow_id: FlowId, src: NodeId, dst: NodeId, size_bytes: u64) -> Job {
    comm_job(vec![FlowSpec {
        flow_id,
        src,
        dst,
        size_bytes,
        start_offset_s: 0.0,
    }])
}

/// Two hosts hanging off one switch, 1 Gbps links with 1 us propagation.
pub(crate) fn ping_topology() -> (BuiltTopology, NodeId, NodeId) {
    let mode = RoutingMode::Ecmp;
    let mut fabric = Fabric::new();
    let sw = fabric.add_switch("sw", mode);
    let a = fabric.add_host("a", ip(10, 0, 0, 2), mode);
    let b = fabric.add_host("b", ip(10, 0, 1, 2), mode);
    let (_, sw_a, a_up) = fabric.connect(sw, a, 1e9, 1e-6);
    let (_, sw_b, b_up) = fabric.connect(sw, b, 1e9, 1e-6);
    fabric.nodes[sw]
        .table
        .insert("10.0.0.2/32".parse().unwrap(), [sw_a]);
    fabric.nodes[sw]
        .table
        .insert("10.0.1.2/32".parse().unwrap(), [sw_b]);
    fabric.nodes[a]
        .table
        .insert("0.0.0.0/0".parse().unwrap(), [a_up]);
    fabric.nodes[b]
        .table
        .insert("0.0.0.0/0".parse().unwrap(), [b_up]);

    let topo = BuiltTopology {
        fabric,
        hosts_by_leaf: vec![vec![a], vec![b]],
        summary: TopologySummary {
            leaves: 1,
            spines: 0,
            hosts: 2,
            links: 2,
            failed_links: 0,
        },
    };
    (topo, a, b)
}

pub(crate) fn run_with(cfg: &Config, topo: BuiltTopology, jobs: Vec<Job>) -> RunReport {
    Simulation::from_parts(cfg, topo, jobs, FlowIdGen::new()).run_to_completion()
}

#[test]
fn zero_size_flow_completes_at_injection() {
    let (topo, a, b) = ping_topology();
    let mut cfg = config(topology_config(1, 1, 2, 1, 1), "dp_allreduce");
    cfg.run.message_verbose = true;
    let report = run_with(&cfg, topo, vec![one_flow_job(0, a, b, 0)]);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.flows.len(), 1);
    assert_eq!(report.flows[0].bytes, 0);
    assert_eq!(report.flows[0].fct, 0.0);
    // no packets were emitted
    assert!(report.delivered_history.is_empty());
    assert_eq!(report.dropped_packets, 0);
}

#[test]
fn zero_duration_compute_phase_completes_in_place() {
    let (topo, _, _) = ping_topology();
    let cfg = config(topology_config(1, 1, 2, 1, 1), "dp_allreduce");
    let job = Job {
        id: 0,
        name: "compute_only".to_string(),
        steps: vec![JobStep {
            phases: vec![Phase::Compute { duration_s: 0.0 }],
        }],
    };
    let report = run_with(&cfg, topo, vec![job]);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.total_time, 0.0);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].duration, 0.0);
    assert_eq!(report.steps[0].participants, 0);
}

#[test]
fn ttl_exhaustion_is_a_silent_drop_that_stalls_the_run() {
    let (topo, a, b) = ping_topology();
    let mut cfg = config(topology_config(1, 1, 2, 1, 1), "dp_allreduce");
    cfg.topology.ttl = 1;
    let report = run_with(&cfg, topo, vec![one_flow_job(0, a, b, 4096)]);

    assert_eq!(report.dropped_packets, 1);
    let RunStatus::Stalled { unfinished } = &report.status else {
        panic!("run must stall when the only packet is dropped");
    };
    assert!(unfinished.iter().any(|s| s.contains("flow 0")));
    // the flow never completed, so no flow record was written
    assert!(report.flows.is_empty());
}

#[test]
fn multi_packet_message_is_segmented_at_the_mtu() {
    let (topo, a, b) = ping_topology();
    let mut cfg = config(topology_config(1, 1, 2, 1, 1), "dp_allreduce");
    cfg.run.message_verbose = true;
    // 2.5 MTUs: two full packets and a 2048-byte tail
    let report = run_with(&cfg, topo, vec![one_flow_job(0, a, b, 10_240)]);

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.delivered_history.len(), 3);
    let sizes: Vec<u32> = report
        .delivered_history
        .iter()
        .map(|d| d.size_bytes)
        .collect();
    assert_eq!(sizes, vec![4096, 4096, 2048]);
    // port FIFO: packets arrive in flow-sequence order
    let seqs: Vec<u64> = report
        .delivered_history
        .iter()
        .map(|d| d.flow_seq)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(report.flows[0].bytes, 10_240);
}

#[test]
fn stalled_report_lists_every_unfinished_phase() {
    // two jobs, one of which can never finish: its destination is unreachable
    let (mut topo, a, b) = ping_topology();
    let dead_link = topo.fabric.nodes[b].ports[0].link;
    topo.fabric.fail_link(dead_link);
    let cfg = config(topology_config(1, 1, 2, 1, 1), "dp_allreduce");
    let mut blocked = one_flow_job(0, a, b, 4096);
    blocked.name = "blocked".to_string();
    let fine = Job {
        id: 1,
        name: "fine".to_string(),
        steps: vec![JobStep {
            phases: vec![Phase::Compute { duration_s: 1e-3 }],
        }],
    };
    let report = run_with(&cfg, topo, vec![blocked, fine]);

    let RunStatus::Stalled { unfinished } = &report.status else {
        panic!("expected a stalled run");
    };
    assert!(unfinished.iter().any(|s| s.contains("blocked")));
    assert!(!unfinished.iter().any(|s| s.contains("fine")));
    // the healthy job still produced its records
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].name, "fine");
}

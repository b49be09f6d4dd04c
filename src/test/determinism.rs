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
//! Determinism guarantees: identical configuration and seeds produce
//! bit-identical metrics, and the stochastic inputs stay within their contracts.

use super::{config, topology_config};
use crate::{
    metrics::{FlowKind, RunStatus},
    routing::RoutingMode,
    run,
};

/// The full stack at once: mixed workload, flowlet routing, link failures and
/// mice. Two runs must serialize to the identical byte string.
#[test]
fn identical_config_produces_bit_identical_reports() {
    let mut cfg = config(topology_config(2, 2, 2, 1, 2), "mixed");
    cfg.topology.routing.mode = RoutingMode::Flowlet;
    cfg.topology.routing.ecmp_flowlet_n_packets = 32;
    cfg.topology.links.failure_percent = 10.0;
    cfg.scenario.params.seed = 13;
    cfg.scenario.params.steps = 2;
    cfg.scenario.params.bucket_bytes_per_participant = 1 << 15;
    cfg.scenario.params.t_fwd_bwd_ms = 0.5;
    cfg.scenario.params.optimizer_ms = 0.2;
    cfg.scenario.params.mice.enabled = true;
    cfg.scenario.params.mice.seed = 99;
    cfg.scenario.params.mice.end_time_s = 2e-3;
    cfg.scenario.params.mice.interarrival_s = 5e-4;

    let a = run(&cfg).unwrap();
    let b = run(&cfg).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(a.seeds.scenario, 13);
    assert_eq!(a.seeds.mice, Some(99));
    assert!(a.topology.failed_links > 0);
}

/// A different seed moves the failure pattern and the mice schedule.
#[test]
fn seed_changes_change_the_run()  {
    let mut cfg = config(topology_config(2, 2, 2, 1, 2), "dp_allreduce");
    cfg.topology.links.failure_percent = 20.0;
    cfg.scenario.params.bucket_bytes_per_participant = 1 << 15;
    let a = run(&cfg).unwrap();
    cfg.scenario.params.seed = 1;
    let b = run(&cfg).unwrap();
    // same dimensions, but not necessarily the same failed links / timings
    assert_eq!(a.topology.links, b.topology.links);
    assert_eq!(a.topology.failed_links, b.topology.failed_links);
    assert_eq!(a.seeds.scenario, 0);
    assert_eq!(b.seeds.scenario, 1);
}

/// Mice flows are tracked apart from job flows and honor the cross-rack rule.
#[test]
fn mice_flows_are_cross_rack_and_partitioned() {
    let mut cfg = config(topology_config(2, 2, 2, 1, 1), "dp_allreduce");
    cfg.scenario.params.bucket_bytes_per_participant = 1 << 15;
    cfg.scenario.params.t_fwd_bwd_ms = 1.0;
    cfg.scenario.params.optimizer_ms = 0.5;
    cfg.scenario.params.mice.enabled = true;
    cfg.scenario.params.mice.seed = 7;
    cfg.scenario.params.mice.start_delay_s = 1e-4;
    cfg.scenario.params.mice.end_time_s = 1.5e-3;
    cfg.scenario.params.mice.interarrival_s = 2e-4;
    cfg.scenario.params.mice.force_cross_rack = true;

    let report = run(&cfg).unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let mice: Vec<_> = report
        .flows
        .iter()
        .filter(|f| f.kind == FlowKind::Mice)
        .collect();
    assert!(!mice.is_empty(), "the mice injector must have fired");
    for flow in &mice {
        assert_eq!(flow.job, None);
        // host names are h{leaf}-{server}: cross-rack means different leaves
        let leaf = |name: &str| name[1..name.find('-').unwrap()].to_string();
        assert_ne!(leaf(&flow.src), leaf(&flow.dst));
    }
    let summary = report.mice_flow_fct.unwrap();
    assert_eq!(summary.count, mice.len());
    // job flows are summarized separately
    assert!(report.job_flow_fct.unwrap().count > 0);
}

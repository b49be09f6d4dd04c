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
//! Module with the run-time state machinery of jobs: bucket barriers, the
//! byte-accounting flow tracker, and the background mice injector.

use std::{collections::HashMap, net::Ipv4Addr};

use itertools::Itertools;
use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Exp};

use crate::{
    config::MiceConfig,
    packet::Packet,
    workload::{FlowIdGen, FlowSpec, Job},
    FlowId, JobId, NodeId,
};

/// Barrier joining the flows of one bucket.
///
/// `pending` shrinks monotonically; the barrier fires exactly once, when the
/// last flow is signalled. Duplicate signals after firing are ignored (they
/// must not occur, but failing closed is safe).
#[derive(Debug, Clone)]
pub struct Join {
    pending: std::collections::HashSet<FlowId>,
    fired: bool,
}

impl Join {
    pub fn new(flows: impl IntoIterator<Item = FlowId>) -> Self {
        Self {
            pending: flows.into_iter().collect(),
            fired: false,
        }
    }

    /// Signal completion of one flow. Returns `true` iff the barrier fires now.
    pub fn signal(&mut self, flow: FlowId) -> bool {
        self.pending.remove(&flow);
        if self.pending.is_empty() && !self.fired {
            self.fired = true;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// Where a flow came from, for barrier lookup and metrics partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOrigin {
    Job {
        job: JobId,
        step: usize,
        phase: usize,
        bucket: usize,
    },
    Mice,
}

/// A flow currently being delivered, tracked by received-byte accounting.
#[derive(Debug, Clone)]
pub struct ActiveFlow {
    pub dst_ip: Ipv4Addr,
    pub expected: u64,
    pub received: u64,
    pub origin: FlowOrigin,
    pub started_at: f64,
}

/// The flow injector's observer side: byte-accounts every delivery at the
/// registered destination host and reports completion exactly once.
#[derive(Debug, Default)]
pub struct FlowTracker {
    active: HashMap<FlowId, ActiveFlow>,
}

impl FlowTracker {
    pub fn register(
        &mut self,
        flow_id: FlowId,
        dst_ip: Ipv4Addr,
        expected: u64,
        origin: FlowOrigin,
        now: f64,
    ) {
        let previous = self.active.insert(
            flow_id,
            ActiveFlow {
                dst_ip,
                expected,
                received: 0,
                origin,
                started_at: now,
            },
        );
        assert!(previous.is_none(), "flow {flow_id} registered twice");
    }

    /// Account a packet delivered to the host owning `host_ip`.
    ///
    /// Returns the finished flow when this delivery completed it; the flow is
    /// unregistered at that point so completion cannot fire twice.
    pub fn on_delivery(&mut self, host_ip: Ipv4Addr, pkt: &Packet) -> Option<(FlowId, ActiveFlow)> {
        let flow_id = pkt.transport.flow_id;
        let flow = self.active.get_mut(&flow_id)?;
        if flow.dst_ip != host_ip {
            return None;
        }
        flow.received += pkt.l3.size_bytes as u64;
        assert!(
            flow.received <= 2 * flow.expected,
            "flow {flow_id} received {} bytes, more than twice the expected {}",
            flow.received,
            flow.expected
        );
        trace!(
            "flow {flow_id}: {}/{} bytes at {host_ip}",
            flow.received,
            flow.expected
        );
        if flow.received >= flow.expected {
            let flow = self.active.remove(&flow_id).unwrap();
            Some((flow_id, flow))
        } else {
            None
        }
    }

    /// Flows still pending bytes, in flow-id order.
    pub fn unfinished(&self) -> Vec<(FlowId, &ActiveFlow)> {
        self.active
            .iter()
            .map(|(id, f)| (*id, f))
            .sorted_by_key(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Per-job execution state. The runner never spins: every transition is driven
/// by a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Compute { step: usize, phase: usize },
    Comm { step: usize, phase: usize, bucket: usize },
    Done,
}

#[derive(Debug)]
pub struct JobRuntime {
    pub job: Job,
    pub state: JobState,
    /// Barrier of the bucket currently in flight, if any.
    pub join: Option<Join>,
    pub started_at: f64,
    pub step_started_at: f64,
    pub phase_started_at: f64,
    pub bucket_started_at: f64,
}

impl JobRuntime {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            state: JobState::Idle,
            join: None,
            started_at: 0.0,
            step_started_at: 0.0,
            phase_started_at: 0.0,
            bucket_started_at: 0.0,
        }
    }

    /// Human-readable position for stall reports.
    pub fn position(&self) -> String {
        match self.state {
            JobState::Idle => format!("{}: not started", self.job.name),
            JobState::Compute { step, phase } => {
                format!("{}: step {step}, compute phase {phase}", self.job.name)
            }
            JobState::Comm { step, phase, bucket } => format!(
                "{}: step {step}, comm phase {phase}, bucket {bucket} ({} flows pending)",
                self.job.name,
                self.join.as_ref().map(Join::pending).unwrap_or(0)
            ),
            JobState::Done => format!("{}: done", self.job.name),
        }
    }
}

/// Background mice-flow source with seeded exponential inter-arrivals.
#[derive(Debug)]
pub struct MiceInjector {
    cfg: MiceConfig,
    rng: StdRng,
    /// `(host, leaf)` pairs the injector samples from.
    hosts: Vec<(NodeId, usize)>,
}

impl MiceInjector {
    pub fn new(cfg: MiceConfig, hosts: Vec<(NodeId, usize)>) -> Self {
        if cfg.force_cross_rack {
            let first_leaf = hosts.first().map(|(_, leaf)| *leaf);
            assert!(
                hosts.iter().any(|(_, leaf)| Some(*leaf) != first_leaf),
                "mice.force_cross_rack requires hosts under at least two leaves"
            );
        }
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, rng, hosts }
    }

    pub fn cfg(&self) -> &MiceConfig {
        &self.cfg
    }

    /// Delay until the next arrival.
    pub fn next_interarrival(&mut self) -> f64 {
        let exp = Exp::new(1.0 / self.cfg.interarrival_s).expect("interarrival must be positive");
        exp.sample(&mut self.rng)
    }

    /// Sample one mice flow. With `force_cross_rack`, src/dst pairs under the
    /// same leaf are resampled.
    pub fn sample_flow(&mut self, mtu: u32, ids: &mut FlowIdGen) -> FlowSpec {
        assert!(self.hosts.len() >= 2, "mice need at least two hosts");
        let (src, dst) = loop {
            let (src, src_leaf) = self.hosts[self.rng.gen_range(0..self.hosts.len())];
            let (dst, dst_leaf) = self.hosts[self.rng.gen_range(0..self.hosts.len())];
            if src == dst {
                continue;
            }
            if self.cfg.force_cross_rack && src_leaf == dst_leaf {
                continue;
            }
            break (src, dst);
        };
        let packets = self
            .rng
            .gen_range(self.cfg.min_packets..=self.cfg.max_packets);
        FlowSpec {
            flow_id: ids.next_id(),
            src,
            dst,
            size_bytes: packets as u64 * mtu as u64,
            start_offset_s: 0.0,
        }
    }
}

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
//! Module defining the job hierarchy and the expansion of collectives into
//! point-to-point flow buckets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{FlowId, JobId, NodeId};

/// A training job: an ordered list of steps executed back to back.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub steps: Vec<JobStep>,
}

impl Job {
    /// Distinct hosts touched by any flow of this job.
    pub fn participants(&self) -> BTreeSet<NodeId> {
        self.steps
            .iter()
            .flat_map(|s| &s.phases)
            .filter_map(|p| match p {
                Phase::Compute { .. } => None,
                Phase::Comm { buckets } => Some(buckets),
            })
            .flatten()
            .flat_map(|b| &b.flows)
            .flat_map(|f| [f.src, f.dst])
            .collect()
    }
}

/// One training step, an ordered list of phases.
#[derive(Debug, Clone)]
pub struct JobStep {
    pub phases: Vec<Phase>,
}

/// A phase either burns simulated time or moves bytes.
#[derive(Debug, Clone)]
pub enum Phase {
    Compute { duration_s: f64 },
    Comm { buckets: Vec<Bucket> },
}

/// One barrier's worth of concurrent flows inside a comm phase.
///
/// Buckets of a phase are strictly sequential: bucket `k + 1` starts only once
/// every flow of bucket `k` has delivered its full byte count.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub flows: Vec<FlowSpec>,
}

/// A point-to-point transfer between two hosts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowSpec {
    pub flow_id: FlowId,
    pub src: NodeId,
    pub dst: NodeId,
    pub size_bytes: u64,
    /// Injection delay relative to the bucket start, clamped at zero.
    pub start_offset_s: f64,
}

/// Allocator of globally unique flow ids.
#[derive(Debug, Default)]
pub struct FlowIdGen {
    next: FlowId,
}

impl FlowIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> FlowId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Logical group operations expanded into point-to-point flow schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collective {
    AllReduce,
    ReduceScatter,
    AllGather,
}

impl Collective {
    /// Bytes each participant puts on the wire in a ring schedule of this
    /// collective over a payload of `payload` bytes.
    pub fn wire_bytes_per_participant(&self, n: usize, payload: u64) -> u64 {
        assert!(n > 0);
        if n == 1 {
            return 0;
        }
        let rounds = match self {
            // reduce-scatter plus all-gather, (n-1) rounds each
            Collective::AllReduce => 2 * (n as u64 - 1),
            Collective::ReduceScatter | Collective::AllGather => n as u64 - 1,
        };
        // each round moves one shard of payload / n bytes, rounded up
        (payload * rounds).div_ceil(n as u64)
    }
}

/// Expand a collective over `participants` into one bucket of neighbor flows.
///
/// The ring schedule is collapsed into a single flow per participant towards
/// its ring successor, carrying the full per-participant wire volume. Flow
/// launches are staggered by `gap_s`.
pub fn expand_collective(
    kind: Collective,
    participants: &[NodeId],
    payload_bytes: u64,
    gap_s: f64,
    ids: &mut FlowIdGen,
) -> Bucket {
    let n = participants.len();
    if n < 2 {
        return Bucket { flows: Vec::new() };
    }
    let size = kind.wire_bytes_per_participant(n, payload_bytes);
    let flows = participants
        .iter()
        .enumerate()
        .map(|(i, &src)| FlowSpec {
            flow_id: ids.next_id(),
            src,
            dst: participants[(i + 1) % n],
            size_bytes: size,
            start_offset_s: i as f64 * gap_s,
        })
        .collect();
    Bucket { flows }
}

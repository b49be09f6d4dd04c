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
//! Module defining record data types for run results and their (de-)serialization.

use std::collections::{HashMap, VecDeque};

use fabsim_utils::stats::{self, Summary};
use serde::{Deserialize, Serialize};

use crate::{FlowId, JobId, NodeId, PortIx};

/// Whether a flow belongs to a training job or to the background mice traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Job,
    Mice,
}

/// Completion record of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: FlowId,
    pub kind: FlowKind,
    pub job: Option<JobId>,
    pub src: String,
    pub dst: String,
    pub bytes: u64,
    pub start: f64,
    pub end: f64,
    pub fct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub job: JobId,
    pub step: usize,
    pub phase: usize,
    pub bucket: usize,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Compute,
    Comm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub job: JobId,
    pub step: usize,
    pub phase: usize,
    pub kind: PhaseKind,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job: JobId,
    pub step: usize,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub participants: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: JobId,
    pub name: String,
    pub start: f64,
    pub end: f64,
    pub total_time: f64,
    pub steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySummary {
    pub leaves: usize,
    pub spines: usize,
    pub hosts: usize,
    pub links: usize,
    pub failed_links: usize,
}

/// Seeds the run drew from, reported for reproduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRecord {
    pub scenario: u64,
    pub mice: Option<u64>,
}

/// Outcome of a run. A stalled run means the event queue drained while at
/// least one job had work left, typically because a drop starved a barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunStatus {
    Completed,
    Stalled { unfinished: Vec<String> },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// A delivered packet retained in the bounded history ring on verbose runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub time: f64,
    pub node: NodeId,
    pub flow_id: FlowId,
    pub flow_seq: u64,
    pub size_bytes: u32,
}

/// Bounded ring of delivered-packet identities for post-run analysis.
#[derive(Debug, Clone)]
pub struct PacketHistory {
    ring: VecDeque<DeliveryRecord>,
    cap: usize,
    enabled: bool,
}

impl PacketHistory {
    pub fn new(enabled: bool, cap: usize) -> Self {
        Self {
            ring: VecDeque::new(),
            cap,
            enabled,
        }
    }

    pub fn record(&mut self, rec: DeliveryRecord) {
        if !self.enabled {
            return;
        }
        if self.ring.len() == self.cap {
            self.ring.pop_front();
        }
        self.ring.push_back(rec);
    }

    pub fn records(&self) -> impl Iterator<Item = &DeliveryRecord> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// The complete result record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub topology: TopologySummary,
    /// Node names indexed by arena id, for resolving the tuple-keyed maps.
    pub node_names: Vec<String>,
    pub jobs: Vec<JobRecord>,
    pub steps: Vec<StepRecord>,
    pub phases: Vec<PhaseRecord>,
    pub buckets: Vec<BucketRecord>,
    pub flows: Vec<FlowRecord>,
    pub step_times: Option<Summary>,
    pub job_flow_fct: Option<Summary>,
    pub mice_flow_fct: Option<Summary>,
    #[serde(with = "fabsim_utils::serde::tuple_keyed")]
    pub port_peak_depths: HashMap<(NodeId, PortIx), usize>,
    #[serde(with = "fabsim_utils::serde::tuple_keyed")]
    pub switch_peak_depths: HashMap<NodeId, usize>,
    pub dropped_packets: u64,
    pub delivered_history: Vec<DeliveryRecord>,
    pub total_time: f64,
    pub seeds: SeedRecord,
}

impl RunReport {
    /// Export the per-flow records as CSV.
    pub fn write_flow_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut csv = csv::Writer::from_writer(writer);
        for flow in &self.flows {
            csv.serialize(flow)?;
        }
        csv.flush()?;
        Ok(())
    }
}

/// Accumulates records while the run executes and folds them into the report.
#[derive(Debug)]
pub struct MetricsCollector {
    pub flows: Vec<FlowRecord>,
    pub buckets: Vec<BucketRecord>,
    pub phases: Vec<PhaseRecord>,
    pub steps: Vec<StepRecord>,
    pub jobs: Vec<JobRecord>,
    pub history: PacketHistory,
}

/// Capacity of the delivered-packet history ring.
const HISTORY_CAP: usize = 65_536;

impl MetricsCollector {
    pub fn new(message_verbose: bool) -> Self {
        Self {
            flows: Vec::new(),
            buckets: Vec::new(),
            phases: Vec::new(),
            steps: Vec::new(),
            jobs: Vec::new(),
            history: PacketHistory::new(message_verbose, HISTORY_CAP),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        self,
        status: RunStatus,
        topology: TopologySummary,
        node_names: Vec<String>,
        port_peak_depths: HashMap<(NodeId, PortIx), usize>,
        switch_peak_depths: HashMap<NodeId, usize>,
        dropped_packets: u64,
        total_time: f64,
        seeds: SeedRecord,
    ) -> RunReport {
        let mut step_times: Vec<f64> = self.steps.iter().map(|s| s.duration).collect();
        let mut job_fct: Vec<f64> = self
            .flows
            .iter()
            .filter(|f| f.kind == FlowKind::Job)
            .map(|f| f.fct)
            .collect();
        let mut mice_fct: Vec<f64> = self
            .flows
            .iter()
            .filter(|f| f.kind == FlowKind::Mice)
            .map(|f| f.fct)
            .collect();

        RunReport {
            status,
            topology,
            node_names,
            jobs: self.jobs,
            steps: self.steps,
            phases: self.phases,
            buckets: self.buckets,
            flows: self.flows,
            step_times: stats::summarize(&mut step_times),
            job_flow_fct: stats::summarize(&mut job_fct),
            mice_flow_fct: stats::summarize(&mut mice_fct),
            port_peak_depths,
            switch_peak_depths,
            dropped_packets,
            delivered_history: self.history.records().cloned().collect(),
            total_time,
            seeds,
        }
    }
}

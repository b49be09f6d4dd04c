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
//! Module translating the well-known scenario names into concrete jobs.

use log::debug;
use thiserror::Error;

use crate::{
    config::ScenarioParams,
    topology::BuiltTopology,
    workload::{expand_collective, Bucket, Collective, FlowIdGen, FlowSpec, Job, JobStep, Phase},
    NodeId,
};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown scenario `{0}`")]
    Unknown(String),
    #[error("scenario `{name}` needs {needed}, topology provides {got}")]
    TopologyTooSmall {
        name: &'static str,
        needed: &'static str,
        got: usize,
    },
}

/// Build the jobs of the named scenario.
///
/// - `dp_allreduce`: one data-parallel job over all hosts; each step is
///   forward/backward compute, bucketized gradient AllReduce, optimizer.
/// - `tp_micro`: one tensor-parallel job per leaf running many small
///   AllReduce buckets between short compute phases.
/// - `pp_stages`: one pipeline job; leaves are stages, activations flow
///   stage to stage between compute phases.
/// - `mixed`: the DP job plus the per-leaf TP jobs, sharing the fabric.
pub fn build_jobs(
    name: &str,
    params: &ScenarioParams,
    topo: &BuiltTopology,
    ids: &mut FlowIdGen,
) -> Result<Vec<Job>, ScenarioError> {
    let jobs = match name {
        "dp_allreduce" => vec![dp_allreduce(params, topo, ids, 0)?],
        "tp_micro" => tp_micro(params, topo, ids, 0)?,
        "pp_stages" => vec![pp_stages(params, topo, ids, 0)?],
        "mixed" => {
            let mut jobs = vec![dp_allreduce(params, topo, ids, 0)?];
            jobs.extend(tp_micro(params, topo, ids, jobs.len())?);
            jobs
        }
        other => return Err(ScenarioError::Unknown(other.to_string())),
    };
    debug!(
        "scenario `{name}`: {} job(s), {} flows",
        jobs.len(),
        jobs.iter()
            .flat_map(|j| &j.steps)
            .flat_map(|s| &s.phases)
            .filter_map(|p| match p {
                Phase::Comm { buckets } => Some(buckets),
                Phase::Compute { .. } => None,
            })
            .flatten()
            .map(|b| b.flows.len())
            .sum::<usize>()
    );
    Ok(jobs)
}

fn gap_s(params: &ScenarioParams) -> f64 {
    params.gap_us * 1e-6
}

/// Data-parallel job: every host participates in every gradient bucket.
fn dp_allreduce(
    params: &ScenarioParams,
    topo: &BuiltTopology,
    ids: &mut FlowIdGen,
    job_id: usize,
) -> Result<Job, ScenarioError> {
    let hosts = topo.all_hosts();
    if hosts.len() < 2 {
        return Err(ScenarioError::TopologyTooSmall {
            name: "dp_allreduce",
            needed: "at least 2 hosts",
            got: hosts.len(),
        });
    }

    let steps = (0..params.steps)
        .map(|_| {
            let buckets = (0..params.num_buckets)
                .map(|_| {
                    expand_collective(
                        Collective::AllReduce,
                        &hosts,
                        params.bucket_bytes_per_participant,
                        gap_s(params),
                        ids,
                    )
                })
                .collect();
            JobStep {
                phases: vec![
                    Phase::Compute {
                        duration_s: params.t_fwd_bwd_ms * 1e-3,
                    },
                    Phase::Comm { buckets },
                    Phase::Compute {
                        duration_s: params.optimizer_ms * 1e-3,
                    },
                ],
            }
        })
        .collect();

    Ok(Job {
        id: job_id,
        name: "dp_allreduce".to_string(),
        steps,
    })
}

/// Tensor-parallel jobs: each leaf is one TP group exchanging small
/// micro-collectives. The compute slices between collectives are a fraction
/// of the DP forward/backward time.
fn tp_micro(
    params: &ScenarioParams,
    topo: &BuiltTopology,
    ids: &mut FlowIdGen,
    first_job_id: usize,
) -> Result<Vec<Job>, ScenarioError> {
    let groups: Vec<&Vec<NodeId>> = topo
        .hosts_by_leaf
        .iter()
        .filter(|hosts| hosts.len() >= 2)
        .collect();
    if groups.is_empty() {
        return Err(ScenarioError::TopologyTooSmall {
            name: "tp_micro",
            needed: "a leaf with at least 2 hosts",
            got: 0,
        });
    }

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(g, hosts)| {
            let steps = (0..params.steps)
                .map(|_| {
                    let buckets = (0..params.num_buckets)
                        .map(|_| {
                            expand_collective(
                                Collective::AllReduce,
                                hosts,
                                params.bucket_bytes_per_participant,
                                gap_s(params),
                                ids,
                            )
                        })
                        .collect();
                    JobStep {
                        phases: vec![
                            Phase::Compute {
                                duration_s: params.t_fwd_bwd_ms * 1e-3
                                    / params.num_buckets.max(1) as f64,
                            },
                            Phase::Comm { buckets },
                        ],
                    }
                })
                .collect();
            Job {
                id: first_job_id + g,
                name: format!("tp_micro_leaf{g}"),
                steps,
            }
        })
        .collect())
}

/// Pipeline job: the first host of each leaf is one stage; each step moves the
/// activations stage by stage with compute in between.
fn pp_stages(
    params: &ScenarioParams,
    topo: &BuiltTopology,
    ids: &mut FlowIdGen,
    job_id: usize,
) -> Result<Job, ScenarioError> {
    let stages: Vec<NodeId> = topo
        .hosts_by_leaf
        .iter()
        .filter_map(|hosts| hosts.first().copied())
        .collect();
    if stages.len() < 2 {
        return Err(ScenarioError::TopologyTooSmall {
            name: "pp_stages",
            needed: "at least 2 leaves with hosts",
            got: stages.len(),
        });
    }

    // per stage transfer: one bucket with a single point-to-point flow
    let steps = (0..params.steps)
        .map(|_| {
            let mut phases = Vec::new();
            for pair in stages.windows(2) {
                phases.push(Phase::Compute {
                    duration_s: params.t_fwd_bwd_ms * 1e-3 / (stages.len() - 1) as f64,
                });
                phases.push(Phase::Comm {
                    buckets: vec![Bucket {
                        flows: vec![FlowSpec {
                            flow_id: ids.next_id(),
                            src: pair[0],
                            dst: pair[1],
                            size_bytes: params.bucket_bytes_per_participant,
                            start_offset_s: 0.0,
                        }],
                    }],
                });
            }
            JobStep { phases }
        })
        .collect();

    Ok(Job {
        id: job_id,
        name: "pp_stages".to_string(),
        steps,
    })
}

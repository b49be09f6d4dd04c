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
//! Module wiring the scheduler, fabric, jobs and injectors into one run.

use std::collections::HashMap;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    config::{Config, ConfigError, RunOptions},
    engine::{EventQueue, SimAction},
    fabric::{Fabric, NodeKind},
    metrics::{
        BucketRecord, DeliveryRecord, FlowKind, FlowRecord, JobRecord, MetricsCollector,
        PhaseKind, PhaseRecord, RunReport, RunStatus, SeedRecord, StepRecord, TopologySummary,
    },
    packet::{flow_ports, FiveTuple, L3Header, Packet, PacketTrace, TransportHeader, PROTO_UDP},
    routing::RoutingParams,
    runner::{FlowOrigin, FlowTracker, Join, JobRuntime, JobState, MiceInjector},
    scenarios::{self, ScenarioError},
    topology::{self, BuiltTopology, TopologyError},
    workload::{FlowIdGen, FlowSpec, Job, Phase},
    FlowId, JobId, NodeId, PortIx,
};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("scenario error: {0}")]
    Scenario(#[from] ScenarioError),
}

/// Run a complete simulation for the given configuration.
///
/// Identical configurations produce bit-identical reports.
pub fn run(config: &Config) -> Result<RunReport, SimError> {
    Ok(Simulation::new(config)?.run_to_completion())
}

/// One simulation run: the event queue, the fabric, and all control-plane state.
///
/// Every mutable structure has this single owner; handoffs between them happen
/// only through scheduled events.
pub struct Simulation {
    run_opts: RunOptions,
    mtu: u32,
    ttl: u8,
    params: RoutingParams,
    queue: EventQueue,
    fabric: Fabric,
    summary: TopologySummary,
    jobs: Vec<JobRuntime>,
    /// All flows known to the run, by id. Entries are removed at completion.
    flows: HashMap<FlowId, (FlowSpec, FlowOrigin)>,
    tracker: FlowTracker,
    metrics: MetricsCollector,
    mice: Option<MiceInjector>,
    ids: FlowIdGen,
    seeds: SeedRecord,
}

impl Simulation {
    pub fn new(config: &Config) -> Result<Self, SimError> {
        config.validate()?;
        let topo = topology::build(&config.topology, config.scenario.params.seed)?;
        let mut ids = FlowIdGen::new();
        let jobs = scenarios::build_jobs(
            &config.scenario.name,
            &config.scenario.params,
            &topo,
            &mut ids,
        )?;
        Ok(Self::from_parts(config, topo, jobs, ids))
    }

    /// Assemble a simulation from an already-built topology and job list.
    pub(crate) fn from_parts(
        config: &Config,
        topo: BuiltTopology,
        jobs: Vec<Job>,
        ids: FlowIdGen,
    ) -> Self {
        let mice_cfg = &config.scenario.params.mice;
        let mice = mice_cfg.enabled.then(|| {
            let hosts: Vec<(NodeId, usize)> = topo
                .hosts_by_leaf
                .iter()
                .enumerate()
                .flat_map(|(leaf, hosts)| hosts.iter().map(move |&h| (h, leaf)))
                .collect();
            MiceInjector::new(mice_cfg.clone(), hosts)
        });
        Self {
            run_opts: config.run.clone(),
            mtu: config.topology.mtu,
            ttl: config.topology.ttl,
            params: RoutingParams {
                max_path: config.topology.max_path,
                flowlet_n_packets: config.topology.routing.ecmp_flowlet_n_packets,
                flowlet_idle_gap_s: config.topology.routing.flowlet_idle_gap_us * 1e-6,
            },
            queue: EventQueue::new(),
            fabric: topo.fabric,
            summary: topo.summary,
            jobs: jobs.into_iter().map(JobRuntime::new).collect(),
            flows: HashMap::new(),
            tracker: FlowTracker::default(),
            metrics: MetricsCollector::new(config.run.message_verbose),
            mice,
            ids,
            seeds: SeedRecord {
                scenario: config.scenario.params.seed,
                mice: mice_cfg.enabled.then_some(mice_cfg.seed),
            },
        }
    }

    /// Arm the workload, drain the queue, and produce the report.
    pub fn run_to_completion(mut self) -> RunReport {
        for job in 0..self.jobs.len() {
            self.queue.schedule(0.0, SimAction::StartJob { job });
        }
        if let Some(mice) = &self.mice {
            self.queue
                .schedule(mice.cfg().start_delay_s, SimAction::MiceArrival);
        }

        while let Some(action) = self.queue.pop() {
            self.dispatch(action);
        }

        self.finalize()
    }

    fn dispatch(&mut self, action: SimAction) {
        match action {
            SimAction::StartJob { job } => self.on_start_job(job),
            SimAction::ComputeDone { job } => self.on_compute_done(job),
            SimAction::InjectFlow { flow } => self.on_inject_flow(flow),
            SimAction::DrainPort { node, port } => self.on_drain(node, port),
            SimAction::Deliver { node, packet } => self.on_deliver(node, packet),
            SimAction::MiceArrival => self.on_mice_arrival(),
        }
    }

    fn on_start_job(&mut self, job: JobId) {
        let now = self.queue.now();
        {
            let rt = &mut self.jobs[job];
            debug_assert_eq!(rt.state, JobState::Idle);
            rt.started_at = now;
            rt.step_started_at = now;
            info!("job `{}` started", rt.job.name);
        }
        self.enter_phase(job, 0, 0);
    }

    fn enter_phase(&mut self, job: JobId, step: usize, phase: usize) {
        let now = self.queue.now();
        self.jobs[job].phase_started_at = now;
        let compute = match &self.jobs[job].job.steps[step].phases[phase] {
            Phase::Compute { duration_s } => Some(*duration_s),
            Phase::Comm { .. } => None,
        };
        match compute {
            Some(duration_s) => {
                self.jobs[job].state = JobState::Compute { step, phase };
                self.queue
                    .schedule(duration_s, SimAction::ComputeDone { job });
            }
            None => self.enter_bucket(job, step, phase, 0),
        }
    }

    /// Arm bucket `bucket` of a comm phase; empty buckets complete in place.
    fn enter_bucket(&mut self, job: JobId, step: usize, phase: usize, mut bucket: usize) {
        loop {
            let specs: Option<Vec<FlowSpec>> = {
                let Phase::Comm { buckets } = &self.jobs[job].job.steps[step].phases[phase] else {
                    unreachable!("bucket transition in a compute phase")
                };
                buckets.get(bucket).map(|b| b.flows.clone())
            };
            let Some(specs) = specs else {
                self.phase_done(job, step, phase);
                return;
            };

            let now = self.queue.now();
            {
                let rt = &mut self.jobs[job];
                rt.state = JobState::Comm { step, phase, bucket };
                rt.bucket_started_at = now;
                rt.join = Some(Join::new(specs.iter().map(|f| f.flow_id)));
            }

            if specs.is_empty() {
                // nothing to join; the barrier is trivially closed
                self.metrics.buckets.push(BucketRecord {
                    job,
                    step,
                    phase,
                    bucket,
                    start: now,
                    end: now,
                });
                bucket += 1;
                continue;
            }

            trace!(
                "job {job} step {step} phase {phase}: bucket {bucket} with {} flows",
                specs.len()
            );
            for spec in specs {
                let origin = FlowOrigin::Job {
                    job,
                    step,
                    phase,
                    bucket,
                };
                self.flows.insert(spec.flow_id, (spec, origin));
                self.queue.schedule(
                    spec.start_offset_s.max(0.0),
                    SimAction::InjectFlow { flow: spec.flow_id },
                );
            }
            return;
        }
    }

    fn on_compute_done(&mut self, job: JobId) {
        let JobState::Compute { step, phase } = self.jobs[job].state else {
            panic!("compute timer fired for job {job} in state {:?}", self.jobs[job].state)
        };
        self.phase_done(job, step, phase);
    }

    fn phase_done(&mut self, job: JobId, step: usize, phase: usize) {
        let now = self.queue.now();
        let (kind, phase_start, phase_count, step_count) = {
            let rt = &self.jobs[job];
            let kind = match rt.job.steps[step].phases[phase] {
                Phase::Compute { .. } => PhaseKind::Compute,
                Phase::Comm { .. } => PhaseKind::Comm,
            };
            (
                kind,
                rt.phase_started_at,
                rt.job.steps[step].phases.len(),
                rt.job.steps.len(),
            )
        };
        self.metrics.phases.push(PhaseRecord {
            job,
            step,
            phase,
            kind,
            start: phase_start,
            end: now,
            duration: now - phase_start,
        });

        if phase + 1 < phase_count {
            self.enter_phase(job, step, phase + 1);
            return;
        }

        let step_start = self.jobs[job].step_started_at;
        let participants = self.jobs[job].job.participants().len();
        self.metrics.steps.push(StepRecord {
            job,
            step,
            start: step_start,
            end: now,
            duration: now - step_start,
            participants,
        });

        if step + 1 < step_count {
            self.jobs[job].step_started_at = now;
            self.enter_phase(job, step + 1, 0);
            return;
        }

        let (name, started_at) = {
            let rt = &mut self.jobs[job];
            rt.state = JobState::Done;
            (rt.job.name.clone(), rt.started_at)
        };
        self.metrics.jobs.push(JobRecord {
            job,
            name: name.clone(),
            start: started_at,
            end: now,
            total_time: now - started_at,
            steps: step_count,
        });
        info!("job `{name}` completed after {:.6}s", now - started_at);
    }

    fn on_inject_flow(&mut self, flow: FlowId) {
        let now = self.queue.now();
        let (spec, origin) = *self.flows.get(&flow).expect("injected unknown flow");
        let dst_ip = self.fabric.nodes[spec.dst]
            .ip()
            .expect("flow destination is not a host");
        if spec.size_bytes == 0 {
            // zero-size flows complete at injection without emitting packets
            self.finish_flow(flow, origin, now);
            return;
        }
        self.tracker
            .register(flow, dst_ip, spec.size_bytes, origin, now);
        self.send_message(spec.src, flow, dst_ip, spec.size_bytes);
    }

    /// Segment a message into MTU packets and queue them on the source host.
    ///
    /// The host never blocks: every packet of the message is enqueued at the
    /// time of the call.
    fn send_message(&mut self, src: NodeId, flow_id: FlowId, dst_ip: std::net::Ipv4Addr, size_bytes: u64) {
        let now = self.queue.now();
        let mtu = self.mtu as u64;
        let count = size_bytes.div_ceil(mtu);
        let (src_port, dst_port) = flow_ports(flow_id);
        let src_ip = self.fabric.nodes[src].ip().expect("flow source is not a host");

        for i in 0..count {
            let size = if i + 1 == count {
                size_bytes - mtu * (count - 1)
            } else {
                mtu
            } as u32;
            let mut pkt = Packet {
                l3: L3Header {
                    tuple: FiveTuple {
                        src_ip,
                        dst_ip,
                        src_port,
                        dst_port,
                        protocol: PROTO_UDP,
                        flowlet_field: 0,
                    },
                    seq: i,
                    size_bytes: size,
                    ttl: self.ttl,
                    dropped: false,
                },
                transport: TransportHeader {
                    flow_id,
                    flow_count: count,
                    flow_seq: i,
                },
                trace: self.run_opts.verbose_route.then(PacketTrace::default),
            };
            pkt.record_hop(src, now);
            self.route_and_enqueue(src, pkt);
        }
    }

    /// Pick an egress port and enqueue, scheduling a drain when none is pending.
    fn route_and_enqueue(&mut self, node: NodeId, mut pkt: Packet) {
        let now = self.queue.now();
        match self.fabric.select_port(node, &mut pkt, now, &self.params) {
            None => {
                pkt.l3.dropped = true;
                debug!(
                    "no route for flow {} towards {} at {}",
                    pkt.transport.flow_id, pkt.l3.tuple.dst_ip, self.fabric.nodes[node].name
                );
                self.fabric.dropped += 1;
            }
            Some(port) => {
                if self.fabric.enqueue(node, port, pkt) {
                    self.queue.schedule(0.0, SimAction::DrainPort { node, port });
                }
            }
        }
    }

    fn on_drain(&mut self, node: NodeId, port: PortIx) {
        let now = self.queue.now();
        let result = self.fabric.drain_port(node, port, now);
        for (arrival, peer, packet) in result.deliveries {
            self.queue
                .schedule(arrival - now, SimAction::Deliver { node: peer, packet });
        }
        if let Some(resume_at) = result.resume_at {
            self.queue
                .schedule(resume_at - now, SimAction::DrainPort { node, port });
        }
    }

    fn on_deliver(&mut self, node: NodeId, mut pkt: Packet) {
        let now = self.queue.now();
        pkt.record_hop(node, now);
        match self.fabric.nodes[node].kind {
            NodeKind::Host { ip } => {
                if pkt.l3.tuple.dst_ip == ip {
                    self.metrics.history.record(DeliveryRecord {
                        time: now,
                        node,
                        flow_id: pkt.transport.flow_id,
                        flow_seq: pkt.transport.flow_seq,
                        size_bytes: pkt.l3.size_bytes,
                    });
                    if let Some(trace) = &pkt.trace {
                        trace!(
                            "flow {} packet {} path: {:?}",
                            pkt.transport.flow_id,
                            pkt.transport.flow_seq,
                            trace.hops
                        );
                    }
                    if let Some((flow_id, active)) = self.tracker.on_delivery(ip, &pkt) {
                        self.finish_flow(flow_id, active.origin, active.started_at);
                    }
                } else {
                    // delivered to a host that does not own the address
                    debug!(
                        "packet for {} arrived at {}",
                        pkt.l3.tuple.dst_ip, self.fabric.nodes[node].name
                    );
                    self.fabric.dropped += 1;
                }
            }
            NodeKind::Switch => self.forward(node, pkt),
        }
    }

    fn forward(&mut self, node: NodeId, mut pkt: Packet) {
        pkt.l3.ttl = pkt.l3.ttl.saturating_sub(1);
        if pkt.l3.ttl == 0 {
            pkt.l3.dropped = true;
            debug!(
                "TTL exceeded for flow {} at {}",
                pkt.transport.flow_id, self.fabric.nodes[node].name
            );
            self.fabric.dropped += 1;
            return;
        }
        self.route_and_enqueue(node, pkt);
    }

    /// Stamp the flow record and close its bucket barrier if it was the last.
    fn finish_flow(&mut self, flow_id: FlowId, origin: FlowOrigin, started_at: f64) {
        let now = self.queue.now();
        let (spec, _) = self
            .flows
            .remove(&flow_id)
            .expect("completed flow is not registered");
        self.metrics.flows.push(FlowRecord {
            flow_id,
            kind: match origin {
                FlowOrigin::Job { .. } => FlowKind::Job,
                FlowOrigin::Mice => FlowKind::Mice,
            },
            job: match origin {
                FlowOrigin::Job { job, .. } => Some(job),
                FlowOrigin::Mice => None,
            },
            src: self.fabric.nodes[spec.src].name.clone(),
            dst: self.fabric.nodes[spec.dst].name.clone(),
            bytes: spec.size_bytes,
            start: started_at,
            end: now,
            fct: now - started_at,
        });

        if let FlowOrigin::Job {
            job,
            step,
            phase,
            bucket,
        } = origin
        {
            let fired = self.jobs[job]
                .join
                .as_mut()
                .map(|join| join.signal(flow_id))
                .unwrap_or(false);
            if fired {
                let start = self.jobs[job].bucket_started_at;
                self.metrics.buckets.push(BucketRecord {
                    job,
                    step,
                    phase,
                    bucket,
                    start,
                    end: now,
                });
                self.enter_bucket(job, step, phase, bucket + 1);
            }
        }
    }

    fn on_mice_arrival(&mut self) {
        let now = self.queue.now();
        let Some(mice) = &mut self.mice else { return };
        if now >= mice.cfg().end_time_s {
            return;
        }
        let spec = mice.sample_flow(self.mtu, &mut self.ids);
        let delay = mice.next_interarrival();
        let next_due = now + delay;
        let end = mice.cfg().end_time_s;

        trace!(
            "mice flow {} of {} bytes: node {} -> node {}",
            spec.flow_id,
            spec.size_bytes,
            spec.src,
            spec.dst
        );
        self.flows.insert(spec.flow_id, (spec, FlowOrigin::Mice));
        self.queue
            .schedule(0.0, SimAction::InjectFlow { flow: spec.flow_id });
        if next_due < end {
            self.queue.schedule(delay, SimAction::MiceArrival);
        }
    }

    fn finalize(self) -> RunReport {
        let all_done = self.jobs.iter().all(|rt| rt.state == JobState::Done);
        let status = if all_done {
            RunStatus::Completed
        } else {
            let mut unfinished: Vec<String> = self
                .jobs
                .iter()
                .filter(|rt| rt.state != JobState::Done)
                .map(JobRuntime::position)
                .collect();
            unfinished.extend(
                self.tracker
                    .unfinished()
                    .into_iter()
                    .map(|(id, f)| format!("flow {id}: {}/{} bytes delivered", f.received, f.expected)),
            );
            warn!("run stalled with {} unfinished item(s)", unfinished.len());
            RunStatus::Stalled { unfinished }
        };

        let port_peak_depths: HashMap<(NodeId, PortIx), usize> = self
            .fabric
            .nodes
            .iter()
            .flat_map(|n| {
                n.ports
                    .iter()
                    .enumerate()
                    .map(move |(ix, p)| ((n.id, ix), p.peak_depth))
            })
            .filter(|(_, peak)| *peak > 0)
            .collect();
        let switch_peak_depths: HashMap<NodeId, usize> = self
            .fabric
            .nodes
            .iter()
            .filter(|n| !n.is_host())
            .map(|n| {
                (
                    n.id,
                    n.ports.iter().map(|p| p.peak_depth).max().unwrap_or(0),
                )
            })
            .collect();
        let node_names = self.fabric.nodes.iter().map(|n| n.name.clone()).collect();

        self.metrics.finalize(
            status,
            self.summary,
            node_names,
            port_peak_depths,
            switch_peak_depths,
            self.fabric.dropped,
            self.queue.now(),
            self.seeds,
        )
    }
}

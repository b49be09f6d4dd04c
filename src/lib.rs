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
//! Library for packet-level discrete-event simulation of load-balancing strategies
//! (ECMP, flowlet, adaptive) on leaf-spine fabrics under collective-communication
//! workloads.

/// Stable integer handle of a node (host or switch) in the fabric arena.
pub type NodeId = usize;
/// Index of a port within the port list of its owning node.
pub type PortIx = usize;
/// Stable integer handle of a link in the fabric arena.
pub type LinkId = usize;
/// Globally unique identifier of a point-to-point flow.
pub type FlowId = u64;
/// Index of a job in the installed workload.
pub type JobId = usize;

pub mod config;
pub mod engine;
pub mod fabric;
pub mod metrics;
pub mod packet;
pub mod routing;
pub mod runner;
pub mod scenarios;
pub mod sim;
pub mod topology;
pub mod workload;

#[cfg(test)]
mod test;

pub use sim::run;

pub mod prelude {
    pub use super::{
        config::Config,
        metrics::{RunReport, RunStatus},
        routing::RoutingMode,
        sim::{run, SimError, Simulation},
        FlowId, JobId, LinkId, NodeId, PortIx,
    };
}

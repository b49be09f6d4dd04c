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
//! Module defining the parsed configuration record the simulator consumes.
//!
//! Loading (file formats, CLI) is the caller's concern; the core only validates
//! the record and reads it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::RoutingMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{key}`: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

fn out_of_range(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        reason: reason.into(),
    }
}

/// Top-level configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub run: RunOptions,
    pub topology: TopologyConfig,
    pub scenario: ScenarioConfig,
}

impl Config {
    /// Check every numeric range. Unknown enum values and unknown keys are
    /// already rejected at deserialization time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let su = &self.topology.ai_factory_su;
        for (key, value) in [
            ("topology.ai_factory_su.leaves", su.leaves),
            ("topology.ai_factory_su.spines", su.spines),
            ("topology.ai_factory_su.servers_per_leaf", su.servers_per_leaf),
            (
                "topology.ai_factory_su.server_parallel_links",
                su.server_parallel_links,
            ),
            (
                "topology.ai_factory_su.leaf_to_spine_parallel_links",
                su.leaf_to_spine_parallel_links,
            ),
        ] {
            if value == 0 {
                return Err(out_of_range(key, "must be at least 1"));
            }
        }

        let links = &self.topology.links;
        if !(0.0..=100.0).contains(&links.failure_percent) {
            return Err(out_of_range(
                "topology.links.failure_percent",
                format!("must be within 0..=100, got {}", links.failure_percent),
            ));
        }
        for (key, value) in [
            (
                "topology.links.bandwidth_bps.server_to_leaf",
                links.bandwidth_bps.server_to_leaf,
            ),
            (
                "topology.links.bandwidth_bps.leaf_to_spine",
                links.bandwidth_bps.leaf_to_spine,
            ),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(out_of_range(key, format!("must be positive, got {value}")));
            }
        }
        for (key, value) in [
            (
                "topology.links.propagation_delay_s.server_to_leaf",
                links.propagation_delay_s.server_to_leaf,
            ),
            (
                "topology.links.propagation_delay_s.leaf_to_spine",
                links.propagation_delay_s.leaf_to_spine,
            ),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(out_of_range(
                    key,
                    format!("must be non-negative, got {value}"),
                ));
            }
        }

        if self.topology.max_path == 0 {
            return Err(out_of_range("topology.max_path", "must be at least 1"));
        }
        if self.topology.mtu == 0 {
            return Err(out_of_range("topology.mtu", "must be at least 1"));
        }
        if self.topology.ttl == 0 {
            return Err(out_of_range("topology.ttl", "must be at least 1"));
        }
        if self.topology.routing.flowlet_idle_gap_us <= 0.0 {
            return Err(out_of_range(
                "topology.routing.flowlet_idle_gap_us",
                "must be positive",
            ));
        }

        let params = &self.scenario.params;
        if params.steps == 0 {
            return Err(out_of_range("scenario.params.steps", "must be at least 1"));
        }
        for (key, value) in [
            ("scenario.params.gap_us", params.gap_us),
            ("scenario.params.t_fwd_bwd_ms", params.t_fwd_bwd_ms),
            ("scenario.params.optimizer_ms", params.optimizer_ms),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(out_of_range(
                    key,
                    format!("must be non-negative, got {value}"),
                ));
            }
        }

        let mice = &params.mice;
        if mice.enabled {
            if !(mice.interarrival_s.is_finite() && mice.interarrival_s > 0.0) {
                return Err(out_of_range(
                    "scenario.params.mice.interarrival_s",
                    format!("must be positive, got {}", mice.interarrival_s),
                ));
            }
            if mice.min_packets == 0 {
                return Err(out_of_range(
                    "scenario.params.mice.min_packets",
                    "must be at least 1",
                ));
            }
            if mice.min_packets > mice.max_packets {
                return Err(out_of_range(
                    "scenario.params.mice.max_packets",
                    format!(
                        "must be >= min_packets ({} > {})",
                        mice.min_packets, mice.max_packets
                    ),
                ));
            }
            if mice.end_time_s <= mice.start_delay_s {
                return Err(out_of_range(
                    "scenario.params.mice.end_time_s",
                    "must be after start_delay_s",
                ));
            }
            // cross-rack pairs cannot exist with a single leaf; the injector
            // would resample forever
            if mice.force_cross_rack && su.leaves < 2 {
                return Err(out_of_range(
                    "scenario.params.mice.force_cross_rack",
                    format!(
                        "requires at least 2 leaves, topology has {}",
                        su.leaves
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// Verbosity and tracking switches. `visualize` and `file_debug` are carried
/// for the external tooling that consumes the run artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    pub file_debug: bool,
    /// Retain the bounded delivered-packet history ring.
    pub message_verbose: bool,
    /// Record per-packet hop trails.
    pub verbose_route: bool,
    pub visualize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    AiFactorySu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    #[serde(rename = "type")]
    pub kind: TopologyKind,
    pub ai_factory_su: SuParams,
    pub routing: RoutingConfig,
    pub links: LinkParams,
    /// Cap on the multipath candidate set after the longest-prefix match.
    #[serde(default = "default_max_path")]
    pub max_path: usize,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
}

/// Dimensions of one scalable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuParams {
    pub leaves: usize,
    pub spines: usize,
    pub servers_per_leaf: usize,
    #[serde(default = "default_one")]
    pub server_parallel_links: usize,
    #[serde(default = "default_one")]
    pub leaf_to_spine_parallel_links: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    pub mode: RoutingMode,
    /// Flowlet packet-count threshold; 0 disables flowlet boundaries.
    #[serde(default)]
    pub ecmp_flowlet_n_packets: u32,
    /// Idle gap within a flow that also ends a flowlet.
    #[serde(default = "default_flowlet_idle_gap_us")]
    pub flowlet_idle_gap_us: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkParams {
    /// Percentage of links marked failed at build time.
    #[serde(default)]
    pub failure_percent: f64,
    pub bandwidth_bps: BandwidthParams,
    #[serde(default)]
    pub propagation_delay_s: PropagationParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BandwidthParams {
    pub server_to_leaf: f64,
    pub leaf_to_spine: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropagationParams {
    pub server_to_leaf: f64,
    pub leaf_to_spine: f64,
}

impl Default for PropagationParams {
    fn default() -> Self {
        Self {
            server_to_leaf: 1e-6,
            leaf_to_spine: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Scenario name resolved by the scenario builders.
    pub name: String,
    #[serde(default)]
    pub params: ScenarioParams,
}

/// Well-known scenario parameters. Scenarios are otherwise opaque to the core,
/// so unknown keys are tolerated here rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioParams {
    pub steps: usize,
    pub seed: u64,
    pub num_buckets: usize,
    pub bucket_bytes_per_participant: u64,
    /// Stagger between successive flow launches inside a bucket.
    pub gap_us: f64,
    pub t_fwd_bwd_ms: f64,
    pub optimizer_ms: f64,
    pub mice: MiceConfig,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            steps: 1,
            seed: 0,
            num_buckets: 1,
            bucket_bytes_per_participant: 1 << 20,
            gap_us: 0.0,
            t_fwd_bwd_ms: 10.0,
            optimizer_ms: 5.0,
            mice: MiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiceConfig {
    pub enabled: bool,
    pub seed: u64,
    pub start_delay_s: f64,
    pub end_time_s: f64,
    pub interarrival_s: f64,
    pub min_packets: u32,
    pub max_packets: u32,
    /// Reject src/dst pairs attached to the same leaf.
    pub force_cross_rack: bool,
}

impl Default for MiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 0,
            start_delay_s: 0.0,
            end_time_s: 1.0,
            interarrival_s: 1e-3,
            min_packets: 1,
            max_packets: 8,
            force_cross_rack: false,
        }
    }
}

fn default_one() -> usize {
    1
}

fn default_max_path() -> usize {
    16
}

fn default_mtu() -> u32 {
    4096
}

fn default_ttl() -> u8 {
    64
}

fn default_flowlet_idle_gap_us() -> f64 {
    50.0
}

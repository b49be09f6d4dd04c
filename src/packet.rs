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
//! Module defining the packet record and the extended five-tuple it is keyed by.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::{FlowId, NodeId};

/// Transport protocol number stamped on simulated packets (UDP).
pub const PROTO_UDP: u8 = 17;

/// Extended five-tuple identifying a packet's flow.
///
/// `flowlet_field` is not part of the wire identity of the flow: flowlet routing
/// perturbs it to re-seed the path hash when a flowlet boundary is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub flowlet_field: u64,
}

impl FiveTuple {
    /// 64-bit path-selection hash of the tuple.
    ///
    /// xxh64 over the big-endian packed numeric fields. The packing fixes the
    /// byte order, so the value is identical across processes and platforms for
    /// identical inputs. Never derived from a textual rendering of the tuple.
    pub fn hash64(&self) -> u64 {
        let mut buf = [0u8; 21];
        buf[0..4].copy_from_slice(&self.src_ip.octets());
        buf[4..8].copy_from_slice(&self.dst_ip.octets());
        buf[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        buf[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[12] = self.protocol;
        buf[13..21].copy_from_slice(&self.flowlet_field.to_be_bytes());
        xxh64(&buf, 0)
    }
}

/// Derive the deterministic transport ports of a flow from its id.
///
/// Distinct flows get distinct source ports (modulo the ephemeral range), which
/// is what spreads them across ECMP candidates.
pub fn flow_ports(flow_id: FlowId) -> (u16, u16) {
    let src_port = 32_768 + (flow_id % 28_000) as u16;
    (src_port, 9_000)
}

/// Network-layer header of a simulated packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L3Header {
    pub tuple: FiveTuple,
    /// Sequence number of this packet within its flow.
    pub seq: u64,
    pub size_bytes: u32,
    pub ttl: u8,
    pub dropped: bool,
}

/// Transport-layer header carrying the flow bookkeeping of the message adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransportHeader {
    pub flow_id: FlowId,
    /// Total number of packets the flow was segmented into.
    pub flow_count: u64,
    /// 0-based index of this packet within the flow.
    pub flow_seq: u64,
}

/// Optional per-packet tracking, populated only on verbose runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketTrace {
    pub hops: Vec<NodeId>,
    pub hop_times: Vec<f64>,
}

/// A packet in flight. Created at host send, destroyed at consumption or drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub l3: L3Header,
    pub transport: TransportHeader,
    pub trace: Option<PacketTrace>,
}

impl Packet {
    pub fn record_hop(&mut self, node: NodeId, time: f64) {
        if let Some(trace) = &mut self.trace {
            trace.hops.push(node);
            trace.hop_times.push(time);
        }
    }
}

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
//! Module implementing the event scheduler: a monotonic simulated clock driving a
//! stable priority queue of tagged actions.

use std::{cmp::Ordering, collections::BinaryHeap};

use ordered_float::NotNan;

use crate::{packet::Packet, FlowId, JobId, NodeId, PortIx};

/// The closed set of actions the simulation dispatches on.
///
/// Every state change in a run is driven by one of these variants; the dispatcher
/// matches exhaustively so that a new event kind cannot be silently ignored.
#[derive(Debug, Clone)]
pub enum SimAction {
    /// Start a job's first step at its scheduled time.
    StartJob { job: JobId },
    /// A compute phase timer of the given job elapsed.
    ComputeDone { job: JobId },
    /// Hand a registered flow to the source host for packetization.
    InjectFlow { flow: FlowId },
    /// Drain the FIFO of the given port onto its link.
    DrainPort { node: NodeId, port: PortIx },
    /// A packet finished traversing a link and arrives at `node`.
    Deliver { node: NodeId, packet: Packet },
    /// The mice injector wakes up to emit a background flow.
    MiceArrival,
}

/// An enqueued event. Ordering is on `(time, seq)` only; the action is opaque.
#[derive(Debug)]
struct ScheduledEvent {
    time: NotNan<f64>,
    seq: u64,
    action: SimAction,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the std max-heap pops the smallest (time, seq) first
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time-ordered event queue with a stable FIFO tie-break among equal timestamps.
///
/// `seq` is assigned strictly increasing at enqueue time, so two events scheduled
/// for the same instant execute in insertion order. Actions scheduled *at* the
/// current time run after all already-queued events of that time.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
    now: f64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The timestamp of the last dequeued event, or `0.0` before the first pop.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Enqueue `action` to run `delay_s` seconds from now.
    ///
    /// Panics on a negative delay: scheduling into the past is a bug in the
    /// caller, not a recoverable condition.
    pub fn schedule(&mut self, delay_s: f64, action: SimAction) {
        assert!(
            delay_s >= 0.0,
            "scheduled an event {delay_s}s in the past ({action:?})"
        );
        let time = NotNan::new(self.now + delay_s).expect("event time is NaN");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent { time, seq, action });
    }

    /// Pop the next action in `(time, seq)` order, advancing the clock to it.
    pub fn pop(&mut self) -> Option<SimAction> {
        let ev = self.heap.pop()?;
        debug_assert!(ev.time.into_inner() >= self.now, "event clock ran backwards");
        self.now = ev.time.into_inner();
        Some(ev.action)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

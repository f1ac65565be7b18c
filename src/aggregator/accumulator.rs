use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, Span};

use crate::clock::Clock;
use crate::flow::{AggregationKey, FlowRecord, Port};
use crate::rollup::{IsEphemeralStatus, PortRollupStore};

use super::collision::CollisionChecker;

/// Per-key aggregation state.
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// Flow waiting for the next flush; `None` once flushed.
    pub flow: Option<FlowRecord>,
    /// `None` once the schedule runs past the representable time range.
    pub next_flush: Option<SystemTime>,
    pub last_successful_flush: SystemTime,
}

/// Owns the aggregation map and its merge/flush/expire lifecycle.
///
/// Ingest and flush take the same lock, so a flow is merged either before
/// or after a flush scan sees its context, never lost in between. The flush
/// scan is O(contexts) under that lock.
pub struct FlowAccumulator {
    flows: parking_lot::Mutex<HashMap<AggregationKey, FlowContext>>,
    flush_interval: Duration,
    flow_context_ttl: Duration,
    rollup: Option<Arc<PortRollupStore>>,
    collisions: CollisionChecker,
    clock: Clock,
    span: Span,
}

impl FlowAccumulator {
    /// Creates an accumulator. Pass `rollup = None` to disable port rollup.
    pub fn new(
        flush_interval: Duration,
        flow_context_ttl: Duration,
        rollup: Option<Arc<PortRollupStore>>,
        collisions: CollisionChecker,
        clock: Clock,
        span: Span,
    ) -> Self {
        Self {
            flows: parking_lot::Mutex::new(HashMap::with_capacity(1024)),
            flush_interval,
            flow_context_ttl,
            rollup,
            collisions,
            clock,
            span,
        }
    }

    /// Merges a flow into the map, wildcarding an ephemeral port first.
    pub fn add(&self, mut flow: FlowRecord) {
        if let Some(rollup) = &self.rollup {
            apply_rollup(rollup, &mut flow);
        }

        let key = flow.aggregation_key();
        let now = (self.clock)();

        let pending_check = {
            let mut flows = self.flows.lock();
            match flows.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(FlowContext {
                        flow: Some(flow),
                        next_flush: Some(now),
                        last_successful_flush: now,
                    });
                    None
                }
                Entry::Occupied(mut slot) => {
                    let ctx = slot.get_mut();
                    match ctx.flow.as_mut() {
                        None => {
                            ctx.flow = Some(flow);
                            None
                        }
                        Some(existing) => {
                            let before = existing.clone();
                            existing.merge(&flow);
                            Some((before, flow))
                        }
                    }
                }
            }
        };

        if let Some((existing, incoming)) = pending_check {
            self.collisions.submit(existing, incoming);
        }
    }

    /// Returns flows whose flush time has come and drops idle contexts
    /// whose TTL has expired.
    pub fn flush(&self) -> Vec<FlowRecord> {
        let now = (self.clock)();
        let flush_interval = self.flush_interval;
        let ttl = self.flow_context_ttl;
        let mut ready = Vec::new();
        let mut expired = 0usize;

        let mut flows = self.flows.lock();
        flows.retain(|_, ctx| {
            let idle_deadline = ctx.last_successful_flush.checked_add(ttl);
            if ctx.flow.is_none() && idle_deadline.is_some_and(|deadline| deadline < now) {
                expired += 1;
                return false;
            }
            let Some(next_flush) = ctx.next_flush.filter(|next| *next <= now) else {
                return true;
            };
            if let Some(flow) = ctx.flow.take() {
                ready.push(flow);
                ctx.last_successful_flush = now;
            }
            ctx.next_flush = next_flush.checked_add(flush_interval);
            true
        });
        let remaining = flows.len();
        drop(flows);

        debug!(
            parent: &self.span,
            flushed = ready.len(),
            expired,
            contexts = remaining,
            "accumulator flush",
        );
        ready
    }

    /// Takes every pending flow regardless of its flush schedule.
    pub fn drain(&self) -> Vec<FlowRecord> {
        let now = (self.clock)();
        let mut flows = self.flows.lock();
        flows
            .values_mut()
            .filter_map(|ctx| {
                let flow = ctx.flow.take()?;
                ctx.last_successful_flush = now;
                Some(flow)
            })
            .collect()
    }

    pub fn flow_context_count(&self) -> usize {
        self.flows.lock().len()
    }
}

/// Records the flow's ports and wildcards at most one of them.
fn apply_rollup(rollup: &PortRollupStore, flow: &mut FlowRecord) {
    let (Port::Concrete(src_port), Port::Concrete(dst_port)) = (flow.src_port, flow.dst_port)
    else {
        return;
    };

    rollup.add(&flow.src_addr, &flow.dst_addr, src_port, dst_port);
    match rollup.is_ephemeral(&flow.src_addr, &flow.dst_addr, src_port, dst_port) {
        IsEphemeralStatus::SourceIsEphemeral => flow.src_port = Port::Ephemeral,
        IsEphemeralStatus::DestIsEphemeral => flow.dst_port = Port::Ephemeral,
        IsEphemeralStatus::NotEphemeral => {}
    }
}

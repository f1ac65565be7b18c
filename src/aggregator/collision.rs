//! Asynchronous hash-collision detection.
//!
//! Every merge in the accumulator submits the pre-merge flow and the incoming
//! flow to a bounded queue. A single worker compares their key fields; equal
//! keys with differing key fields mean two distinct flows were merged.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};

use crate::export::health::HealthMetrics;
use crate::flow::FlowRecord;

/// One pending comparison.
#[derive(Debug)]
pub struct CollisionCheck {
    pub existing: FlowRecord,
    pub incoming: FlowRecord,
}

impl CollisionCheck {
    /// True when the two flows share a key but are not the same flow.
    pub fn is_collision(&self) -> bool {
        !self.existing.same_key_fields(&self.incoming)
    }
}

/// Producer side, held by the accumulator.
#[derive(Clone)]
pub struct CollisionChecker {
    tx: mpsc::Sender<CollisionCheck>,
    metrics: Arc<HealthMetrics>,
    span: Span,
}

/// Consumer side, run as its own task by the aggregator.
pub struct CollisionWorker {
    rx: mpsc::Receiver<CollisionCheck>,
    metrics: Arc<HealthMetrics>,
    span: Span,
}

/// Creates a checker/worker pair sharing a queue of `capacity` checks.
pub fn collision_queue(
    capacity: usize,
    metrics: Arc<HealthMetrics>,
    span: Span,
) -> (CollisionChecker, CollisionWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        CollisionChecker {
            tx,
            metrics: Arc::clone(&metrics),
            span: span.clone(),
        },
        CollisionWorker { rx, metrics, span },
    )
}

impl CollisionChecker {
    /// Enqueues a comparison without blocking. A full queue drops the check.
    pub fn submit(&self, existing: FlowRecord, incoming: FlowRecord) {
        match self.tx.try_send(CollisionCheck { existing, incoming }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.collision_checks_dropped.inc();
                debug!(parent: &self.span, "collision check queue full, skipping check");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl CollisionWorker {
    /// Processes checks until `cancel` fires or every checker is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                check = self.rx.recv() => match check {
                    Some(check) => {
                        self.inspect(&check);
                    }
                    None => break,
                },
            }
        }
        debug!(parent: &self.span, "collision worker stopped");
    }

    /// Counts and reports a single check. Returns whether it was a collision.
    pub fn inspect(&self, check: &CollisionCheck) -> bool {
        if !check.is_collision() {
            return false;
        }

        self.metrics.hash_collisions.inc();
        warn!(
            parent: &self.span,
            key = check.incoming.aggregation_key().0,
            existing = ?check.existing,
            incoming = ?check.incoming,
            "hash collision between distinct flows",
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Port;

    fn metrics() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new(":0").expect("metrics"))
    }

    fn flow(dst_port: u16) -> FlowRecord {
        FlowRecord {
            src_addr: vec![10, 0, 0, 1],
            dst_addr: vec![10, 0, 0, 2],
            src_port: Port::Concrete(40000),
            dst_port: Port::Concrete(dst_port),
            bytes: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_flow_is_not_collision() {
        let m = metrics();
        let (_checker, worker) = collision_queue(4, Arc::clone(&m), Span::none());
        let mut incoming = flow(443);
        incoming.bytes = 999;
        incoming.tcp_flags = 0x18;

        let check = CollisionCheck {
            existing: flow(443),
            incoming,
        };
        assert!(!worker.inspect(&check));
        assert_eq!(m.hash_collisions.get(), 0);
    }

    #[test]
    fn test_distinct_key_fields_are_counted() {
        let m = metrics();
        let (_checker, worker) = collision_queue(4, Arc::clone(&m), Span::none());
        let check = CollisionCheck {
            existing: flow(443),
            incoming: flow(80),
        };
        assert!(worker.inspect(&check));
        assert_eq!(m.hash_collisions.get(), 1);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let m = metrics();
        let (checker, _worker) = collision_queue(1, Arc::clone(&m), Span::none());
        checker.submit(flow(1), flow(1));
        checker.submit(flow(2), flow(2));
        checker.submit(flow(3), flow(3));
        assert_eq!(m.collision_checks_dropped.get(), 2);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let m = metrics();
        let (checker, worker) = collision_queue(8, Arc::clone(&m), Span::none());
        checker.submit(flow(443), flow(80));
        checker.submit(flow(443), flow(443));
        drop(checker);

        // Worker exits once the queue is empty and all checkers are gone.
        worker.run(CancellationToken::new()).await;
        assert_eq!(m.hash_collisions.get(), 1);
    }
}

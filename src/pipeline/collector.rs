//! # Ordered Collector
//!
//! Emits results in input order regardless of completion order. Workers
//! deposit into position-indexed slots (single writer per index); a
//! cursor advances over filled slots and forwards them to the consumer
//! channel. The deposit path never suspends.

use crate::models::ProcessingResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Notify};

/// Position-ordered result collector
pub struct OrderedCollector {
    /// One slot per position, filled exactly once
    slots: Mutex<CollectorSlots>,

    /// Ordered output channel
    emit: mpsc::UnboundedSender<ProcessingResult>,

    /// Signalled when every slot has been emitted or the batch is
    /// cancelled
    done: Notify,

    /// Completion flag
    completed: AtomicBool,

    /// Cancellation flag carried into the completion event
    cancelled: AtomicBool,
}

struct CollectorSlots {
    slots: Vec<Option<ProcessingResult>>,
    next_to_emit: usize,
}

impl OrderedCollector {
    /// Create a collector for `total` positions
    ///
    /// Returns the collector and the ordered receiving end.
    pub fn new(total: usize) -> (Self, mpsc::UnboundedReceiver<ProcessingResult>) {
        let (emit, receiver) = mpsc::unbounded_channel();
        (
            Self {
                slots: Mutex::new(CollectorSlots {
                    slots: (0..total).map(|_| None).collect(),
                    next_to_emit: 0,
                }),
                emit,
                done: Notify::new(),
                completed: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            },
            receiver,
        )
    }

    /// Deposit one result into its slot and emit any now-contiguous run
    ///
    /// Positions are 1-based; depositing twice into a slot or out of
    /// range is a programming error.
    pub fn deposit(&self, result: ProcessingResult) {
        let total = {
            let mut state = self.slots.lock();
            let index = result.position.checked_sub(1).expect("positions are 1-based");
            assert!(index < state.slots.len(), "position out of range");
            assert!(state.slots[index].is_none(), "slot deposited twice");
            state.slots[index] = Some(result);

            while state.next_to_emit < state.slots.len() {
                let next_to_emit = state.next_to_emit;
                match state.slots[next_to_emit].take() {
                    Some(ready) => {
                        // Receiver gone means the consumer stopped early;
                        // ordering is preserved either way
                        let _ = self.emit.send(ready);
                        state.next_to_emit += 1;
                    }
                    None => break,
                }
            }
            state.next_to_emit == state.slots.len()
        };

        if total {
            self.completed.store(true, Ordering::Release);
            self.done.notify_waiters();
        }
    }

    /// Emitted count so far
    pub fn emitted(&self) -> usize {
        self.slots.lock().next_to_emit
    }

    /// Fire the completion event early with the cancelled flag set
    ///
    /// Results already emitted stay emitted; unfilled slots are
    /// abandoned.
    pub fn finish_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.completed.store(true, Ordering::Release);
        self.done.notify_waiters();
    }

    /// Whether the completion event carries the cancelled flag
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wait for the completion event; returns the cancelled flag
    pub async fn wait(&self) -> bool {
        loop {
            if self.completed.load(Ordering::Acquire) {
                return self.is_cancelled();
            }
            let notified = self.done.notified();
            if self.completed.load(Ordering::Acquire) {
                return self.is_cancelled();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PipelineError};
    use crate::models::ProcessingResult;

    fn result(position: usize) -> ProcessingResult {
        let record = PipelineError::transient(ErrorKind::Timeout, "placeholder", "test")
            .to_record();
        ProcessingResult::failed(position, format!("term-{}", position), record)
    }

    #[tokio::test]
    async fn test_emits_in_order_despite_reverse_deposits() {
        let (collector, mut rx) = OrderedCollector::new(5);

        for position in (1..=5).rev() {
            collector.deposit(result(position));
        }

        let cancelled = collector.wait().await;
        assert!(!cancelled);

        let mut seen = Vec::new();
        while let Ok(r) = rx.try_recv() {
            seen.push(r.position);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_contiguous_prefix_emitted_immediately() {
        let (collector, mut rx) = OrderedCollector::new(3);

        collector.deposit(result(2));
        assert!(rx.try_recv().is_err());

        collector.deposit(result(1));
        assert_eq!(rx.try_recv().unwrap().position, 1);
        assert_eq!(rx.try_recv().unwrap().position, 2);
        assert_eq!(collector.emitted(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_fires_completion() {
        let (collector, mut rx) = OrderedCollector::new(4);
        collector.deposit(result(1));

        collector.finish_cancelled();
        let cancelled = collector.wait().await;
        assert!(cancelled);

        // The contiguous prefix was still emitted
        assert_eq!(rx.try_recv().unwrap().position, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_deposits_preserve_order() {
        let (collector, mut rx) = OrderedCollector::new(50);
        let collector = std::sync::Arc::new(collector);

        let mut handles = Vec::new();
        for position in 1..=50 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50 - position as u64)).await;
                collector.deposit(result(position));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        collector.wait().await;
        let mut seen = Vec::new();
        while let Ok(r) = rx.try_recv() {
            seen.push(r.position);
        }
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }
}

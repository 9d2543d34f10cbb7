use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};
use tracing::warn;

use crate::{
    error::{ErgolinkError, Result},
    protocol::CommandBatch,
};

/// Decides which command batch each poll cycle sends
///
/// Ad-hoc batches submitted from outside the poll loop wait in a bounded
/// FIFO and take priority; when it is empty the long-lived refresh batch is
/// sent instead. The refresh batch is never consumed, only read, so steady
/// background polling continues indefinitely between bursts of requests.
///
/// Locks are held only for the enqueue/dequeue itself, never across IO, so
/// submitting a command can never stall behind a slow device.
#[derive(Debug)]
pub struct CommandScheduler {
    pending: Mutex<VecDeque<CommandBatch>>,
    refresh: RwLock<CommandBatch>,
    capacity: usize,
}

impl CommandScheduler {
    /// Create a scheduler with the given pending-queue capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_refresh(capacity, CommandBatch::default_refresh())
    }

    /// Create a scheduler with a specific refresh batch
    #[must_use]
    pub fn with_refresh(capacity: usize, refresh: CommandBatch) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            refresh: RwLock::new(refresh),
            capacity,
        }
    }

    /// Queue a batch for the next poll cycles
    ///
    /// Never blocks; callers seeing `QueueFull` are expected to drop the
    /// batch and retry later.
    ///
    /// # Errors
    ///
    /// Returns [`ErgolinkError::QueueFull`] when the queue is at capacity;
    /// the queue is left unchanged.
    pub fn enqueue(&self, batch: CommandBatch) -> Result<()> {
        let mut pending = self.pending.lock().expect("scheduler lock poisoned");
        if pending.len() >= self.capacity {
            warn!(capacity = self.capacity, "command queue full, dropping batch");
            return Err(ErgolinkError::QueueFull {
                capacity: self.capacity,
            });
        }
        pending.push_back(batch);
        Ok(())
    }

    /// The batch the current poll cycle should send
    ///
    /// Pops the pending head when there is one, otherwise returns a copy of
    /// the refresh batch.
    #[must_use]
    pub fn next_batch(&self) -> CommandBatch {
        if let Some(batch) = self
            .pending
            .lock()
            .expect("scheduler lock poisoned")
            .pop_front()
        {
            return batch;
        }
        self.refresh
            .read()
            .expect("scheduler lock poisoned")
            .clone()
    }

    /// Replace the refresh batch; takes effect on the next cycle
    pub fn set_refresh_batch(&self, batch: CommandBatch) {
        *self.refresh.write().expect("scheduler lock poisoned") = batch;
    }

    /// Number of batches currently waiting
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("scheduler lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn batch(commands: &[Command]) -> CommandBatch {
        CommandBatch::new(commands.to_vec())
    }

    #[test]
    fn test_pending_takes_priority_over_refresh() {
        let scheduler = CommandScheduler::new(4);
        scheduler
            .enqueue(batch(&[Command::GetPower]))
            .unwrap();

        assert_eq!(scheduler.next_batch(), batch(&[Command::GetPower]));
        // Queue drained: falls back to the refresh batch.
        assert_eq!(scheduler.next_batch(), CommandBatch::default_refresh());
    }

    #[test]
    fn test_pending_batches_kept_in_order() {
        let scheduler = CommandScheduler::new(4);
        scheduler.enqueue(batch(&[Command::GetSpeed])).unwrap();
        scheduler.enqueue(batch(&[Command::GetStatus])).unwrap();

        assert_eq!(scheduler.next_batch(), batch(&[Command::GetSpeed]));
        assert_eq!(scheduler.next_batch(), batch(&[Command::GetStatus]));
    }

    #[test]
    fn test_refresh_batch_is_never_consumed() {
        let scheduler = CommandScheduler::new(4);
        for _ in 0..10 {
            assert_eq!(scheduler.next_batch(), CommandBatch::default_refresh());
        }
    }

    #[test]
    fn test_queue_full_leaves_queue_unchanged() {
        let scheduler = CommandScheduler::new(2);
        scheduler.enqueue(batch(&[Command::GetPower])).unwrap();
        scheduler.enqueue(batch(&[Command::GetSpeed])).unwrap();

        let result = scheduler.enqueue(batch(&[Command::GetStatus]));
        assert!(matches!(
            result,
            Err(ErgolinkError::QueueFull { capacity: 2 })
        ));

        assert_eq!(scheduler.pending_len(), 2);
        assert_eq!(scheduler.next_batch(), batch(&[Command::GetPower]));
        assert_eq!(scheduler.next_batch(), batch(&[Command::GetSpeed]));
    }

    #[test]
    fn test_set_refresh_batch_takes_effect_next_cycle() {
        let scheduler = CommandScheduler::new(4);
        assert_eq!(scheduler.next_batch(), CommandBatch::default_refresh());

        let slim = batch(&[Command::GetPower, Command::GetStatus]);
        scheduler.set_refresh_batch(slim.clone());
        assert_eq!(scheduler.next_batch(), slim);
    }

    #[test]
    fn test_enqueue_from_many_threads_respects_capacity() {
        use std::sync::Arc;

        let scheduler = Arc::new(CommandScheduler::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                std::thread::spawn(move || {
                    let mut accepted = 0usize;
                    for _ in 0..8 {
                        if scheduler.enqueue(batch(&[Command::GetPower])).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 8);
        assert_eq!(scheduler.pending_len(), 8);
    }
}

//! Multiplexed batch execution
//!
//! An executor borrows a set of `(connection, batch)` pairs and drives all of
//! them at once under one deadline. It never retries and never fails as a
//! whole: each registration ends up completed, failed (failure recorded in
//! its batch) or timed out (batch keeps whatever replies arrived).

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::core::Connection;

/// How a single registration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

/// Per-outcome counts of one `execute` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl ExecutionSummary {
    pub fn all_completed(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Transient set of batches to drive to completion together
#[derive(Default)]
pub struct Executor<'a> {
    registrations: Vec<(&'a mut Connection, &'a mut Batch)>,
}

impl<'a> Executor<'a> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Register a batch to be sent over `connection`. No I/O happens here.
    pub fn add(&mut self, connection: &'a mut Connection, batch: &'a mut Batch) {
        self.registrations.push((connection, batch));
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Flush every registered batch and collect replies until all are
    /// complete or `timeout` has elapsed
    ///
    /// Connections that fail or run out of time are aborted, since replies
    /// still in flight would be read by the next pipeline on that socket.
    pub async fn execute(&mut self, timeout: Duration) -> ExecutionSummary {
        let deadline = Instant::now() + timeout;
        debug!(
            "Executing {} batches with {}ms timeout",
            self.registrations.len(),
            timeout.as_millis()
        );

        let outcomes = join_all(
            self.registrations
                .iter_mut()
                .map(|(connection, batch)| drive(connection, batch, deadline)),
        )
        .await;

        let mut summary = ExecutionSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        debug!("Execution finished: {:?}", summary);
        summary
    }

    /// Release every registration
    pub fn free(self) {}
}

async fn drive(connection: &mut Connection, batch: &mut Batch, deadline: Instant) -> Outcome {
    let result = timeout_at(deadline, connection.execute_batch(batch)).await;
    match result {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) => {
            warn!("Batch to {} failed: {}", connection.address(), e);
            connection.abort();
            batch.record_failure(e);
            Outcome::Failed
        }
        Err(_) => {
            debug!(
                "Batch to {} timed out with {}/{} replies",
                connection.address(),
                batch.replies_received(),
                batch.commands_written()
            );
            connection.abort();
            Outcome::TimedOut
        }
    }
}

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::execution::{CellExecution, ExecutionStatus};

/// What happens to queued executions when the running one is interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Keep sending the queued executions one after another.
    Drain,
    /// Abort every queued execution.
    #[default]
    Clear,
}

/// Executions of one session: at most one in flight, the rest waiting in
/// submission order.
pub struct ExecutionQueue {
    queue: VecDeque<CellExecution>,
    in_flight: Option<CellExecution>,
    last_seq: u64,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            last_seq: 0,
        }
    }

    /// Hands out the sequence number for the next admitted execution.
    pub fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Number of executions waiting behind the in-flight one.
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn push(&mut self, execution: CellExecution) {
        self.queue.push_back(execution);
    }

    pub fn in_flight(&self) -> Option<&CellExecution> {
        self.in_flight.as_ref()
    }

    /// The in-flight execution, if `msg_id` is its request id.
    pub fn outstanding(&mut self, msg_id: &str) -> Option<&mut CellExecution> {
        self.in_flight
            .as_mut()
            .filter(|execution| execution.msg_id() == msg_id)
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut CellExecution> {
        self.in_flight.as_mut()
    }

    /// Moves the next queued execution in flight when nothing else is.
    /// The caller is expected to send it.
    pub fn advance(&mut self) -> Option<&mut CellExecution> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.queue.pop_front();
        self.in_flight.as_mut()
    }

    /// Removes the in-flight execution once it reached a terminal status.
    pub fn take_finished(&mut self) -> Option<CellExecution> {
        let finished = self
            .in_flight
            .as_ref()
            .is_some_and(|execution| execution.status().is_terminal());
        if finished {
            self.in_flight.take()
        } else {
            None
        }
    }

    pub fn abort_in_flight(&mut self) -> Option<u64> {
        let mut execution = self.in_flight.take()?;
        execution.abort();
        Some(execution.seq())
    }

    /// Aborts every queued execution, leaving the in-flight one alone.
    pub fn clear(&mut self) -> usize {
        let cleared = self.queue.len();
        for mut execution in self.queue.drain(..) {
            execution.abort();
        }
        cleared
    }

    pub fn abort_all(&mut self) {
        self.abort_in_flight();
        self.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    pub fn statuses(&self) -> Vec<ExecutionStatus> {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .map(CellExecution::status)
            .collect()
    }
}

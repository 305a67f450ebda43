use serde_json::Map;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::debug;

use crate::{
    message::{
        Content, ExecuteReply, ExecuteRequest, ExecutionState, Header, InputRequest, Message,
        ReplyStatus,
    },
    output::{ExecutionError, ExecutionResult, OutputAggregator},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Sent,
    Executing,
    Ok,
    Error,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Aborted)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Sent)
                | (Self::Sent, Self::Executing)
                | (Self::Executing, Self::Ok | Self::Error)
                | (Self::Queued | Self::Sent | Self::Executing, Self::Aborted)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    /// Abort everything still queued behind this execution if it fails.
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

impl ExecuteOptions {
    pub fn request(&self, code: String) -> ExecuteRequest {
        ExecuteRequest {
            code,
            silent: self.silent,
            store_history: self.store_history,
            user_expressions: Map::new(),
            allow_stdin: self.allow_stdin,
            stop_on_error: self.stop_on_error,
        }
    }
}

/// What a caller sees of one execution at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub seq: u64,
    pub msg_id: String,
    pub source: String,
    pub status: ExecutionStatus,
    /// Every status this execution has been in, oldest first.
    pub transitions: Vec<ExecutionStatus>,
    pub result: ExecutionResult,
    /// Set while the kernel waits on stdin for this execution.
    pub input_prompt: Option<InputRequest>,
}

/// Caller-side view of a submitted execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    seq: u64,
    msg_id: String,
    snapshot: watch::Receiver<ExecutionSnapshot>,
}

impl ExecutionHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// The result so far; partial while the execution is still running.
    pub fn result(&self) -> ExecutionResult {
        self.snapshot.borrow().result.clone()
    }

    pub fn updates(&self) -> StatusUpdates {
        StatusUpdates {
            receiver: self.snapshot.clone(),
            seen: 0,
        }
    }

    /// Waits until the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionSnapshot {
        let mut receiver = self.snapshot.clone();
        if let Ok(snapshot) = receiver.wait_for(|s| s.status.is_terminal()).await {
            return snapshot.clone();
        }
        let snapshot = receiver.borrow().clone();
        snapshot
    }
}

/// Every status transition of one execution, none skipped.
pub struct StatusUpdates {
    receiver: watch::Receiver<ExecutionSnapshot>,
    seen: usize,
}

impl StatusUpdates {
    /// Yields the next transition, or `None` once the terminal one was yielded.
    pub async fn next(&mut self) -> Option<ExecutionStatus> {
        loop {
            {
                let snapshot = self.receiver.borrow_and_update();
                if let Some(status) = snapshot.transitions.get(self.seen) {
                    self.seen += 1;
                    return Some(*status);
                }
                if snapshot.status.is_terminal() {
                    return None;
                }
            }
            if self.receiver.changed().await.is_err() {
                let snapshot = self.receiver.borrow();
                let status = snapshot.transitions.get(self.seen).copied();
                self.seen += 1;
                return status;
            }
        }
    }
}

/// The session-side state machine of one execution.
pub struct CellExecution {
    request: Message,
    options: ExecuteOptions,
    aggregator: OutputAggregator,
    reply: Option<ExecuteReply>,
    idle_seen: bool,
    input_parent: Option<Header>,
    snapshot: watch::Sender<ExecutionSnapshot>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl CellExecution {
    pub fn new(
        seq: u64,
        request: Message,
        options: ExecuteOptions,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let source = match &request.content {
            Content::ExecuteRequest(execute) => execute.code.clone(),
            _ => String::new(),
        };
        let (snapshot, _) = watch::channel(ExecutionSnapshot {
            seq,
            msg_id: request.msg_id().to_string(),
            source,
            status: ExecutionStatus::Queued,
            transitions: vec![ExecutionStatus::Queued],
            result: ExecutionResult::default(),
            input_prompt: None,
        });

        Self {
            request,
            options,
            aggregator: OutputAggregator::default(),
            reply: None,
            idle_seen: false,
            input_parent: None,
            snapshot,
            _permit: permit,
        }
    }

    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            seq: self.seq(),
            msg_id: self.msg_id().to_string(),
            snapshot: self.snapshot.subscribe(),
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn msg_id(&self) -> &str {
        self.request.msg_id()
    }

    pub fn seq(&self) -> u64 {
        self.snapshot.borrow().seq
    }

    pub fn status(&self) -> ExecutionStatus {
        self.snapshot.borrow().status
    }

    pub fn stops_on_error(&self) -> bool {
        self.options.stop_on_error
    }

    pub fn mark_sent(&mut self) {
        self.transition(ExecutionStatus::Sent);
    }

    /// Feeds an iopub message whose parent is this execution. Messages that
    /// arrive after it finished are dropped.
    pub fn observe_iopub(&mut self, content: &Content) {
        if self.status().is_terminal() {
            return;
        }
        self.begin_executing();

        match content {
            Content::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    self.idle_seen = true;
                }
            }
            content => {
                let aggregator = &mut self.aggregator;
                self.snapshot.send_if_modified(|snapshot| {
                    aggregator.apply(&mut snapshot.result, content)
                });
            }
        }

        self.settle();
    }

    /// Feeds the shell `execute_reply` for this execution.
    pub fn observe_reply(&mut self, reply: ExecuteReply) {
        if self.status().is_terminal() {
            return;
        }
        self.begin_executing();
        self.reply = Some(reply);
        self.settle();
    }

    pub fn request_input(&mut self, parent: Header, request: InputRequest) {
        self.input_parent = Some(parent);
        self.snapshot
            .send_modify(|snapshot| snapshot.input_prompt = Some(request));
    }

    /// Takes the header of the pending `input_request`, if any.
    pub fn take_input_request(&mut self) -> Option<Header> {
        let parent = self.input_parent.take()?;
        self.snapshot
            .send_modify(|snapshot| snapshot.input_prompt = None);
        Some(parent)
    }

    pub fn abort(&mut self) {
        self.input_parent = None;
        self.transition(ExecutionStatus::Aborted);
    }

    fn begin_executing(&mut self) {
        if self.status() == ExecutionStatus::Sent {
            self.transition(ExecutionStatus::Executing);
        }
    }

    /// Finishes the execution once both the reply and the trailing idle arrived.
    fn settle(&mut self) {
        if !self.idle_seen || self.status().is_terminal() {
            return;
        }
        let Some(reply) = self.reply.take() else {
            return;
        };

        let status = match reply.status {
            ReplyStatus::Ok => ExecutionStatus::Ok,
            ReplyStatus::Error => ExecutionStatus::Error,
            ReplyStatus::Aborted => ExecutionStatus::Aborted,
        };

        self.snapshot.send_modify(|snapshot| {
            let result = &mut snapshot.result;
            result.execution_count = reply.execution_count.or(result.last_execute_count());
            if status == ExecutionStatus::Error {
                result.error = match (&reply.ename, &reply.evalue) {
                    (Some(ename), Some(evalue)) => Some(ExecutionError {
                        ename: ename.clone(),
                        evalue: evalue.clone(),
                        traceback: reply.traceback.clone().unwrap_or_default(),
                    }),
                    _ => result.last_error().cloned(),
                };
            }
        });
        self.transition(status);
    }

    fn transition(&mut self, next: ExecutionStatus) -> bool {
        let current = self.status();
        if !current.can_become(next) {
            debug!(msg_id = %self.msg_id(), ?current, ?next, "ignoring status transition");
            return false;
        }

        self.snapshot.send_modify(|snapshot| {
            snapshot.status = next;
            snapshot.transitions.push(next);
            if next.is_terminal() {
                snapshot.input_prompt = None;
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorContent, ExecuteResult, Status, Stream, StreamName};
    use googletest::prelude::*;
    use serde_json::json;

    fn cell(code: &str) -> CellExecution {
        let options = ExecuteOptions::default();
        let request = Message::new(
            Content::ExecuteRequest(options.request(code.to_string())),
            "session",
            "user",
        );
        CellExecution::new(1, request, options, None)
    }

    fn status(state: ExecutionState) -> Content {
        Content::Status(Status {
            execution_state: state,
        })
    }

    fn reply(status: ReplyStatus, count: u32) -> ExecuteReply {
        ExecuteReply {
            status,
            execution_count: Some(count),
            ename: None,
            evalue: None,
            traceback: None,
        }
    }

    #[googletest::test]
    fn reply_alone_does_not_finish_the_execution() {
        let mut cell = cell("1+1");
        cell.mark_sent();

        cell.observe_reply(reply(ReplyStatus::Ok, 1));

        expect_that!(cell.status(), eq(ExecutionStatus::Executing));
    }

    #[googletest::test]
    fn idle_before_reply_finishes_when_reply_arrives() {
        let mut cell = cell("1+1");
        cell.mark_sent();

        cell.observe_iopub(&status(ExecutionState::Busy));
        cell.observe_iopub(&status(ExecutionState::Idle));
        expect_that!(cell.status(), eq(ExecutionStatus::Executing));

        cell.observe_reply(reply(ReplyStatus::Ok, 3));
        expect_that!(cell.status(), eq(ExecutionStatus::Ok));
        expect_that!(cell.handle().result().execution_count, some(eq(3)));
    }

    #[googletest::test]
    fn transitions_are_recorded_in_order() {
        let mut cell = cell("1+1");
        let handle = cell.handle();

        cell.mark_sent();
        cell.observe_iopub(&status(ExecutionState::Busy));
        cell.observe_iopub(&Content::ExecuteResult(ExecuteResult {
            execution_count: 1,
            data: json!({"text/plain": "2"}).as_object().cloned().unwrap(),
            metadata: Map::new(),
        }));
        cell.observe_reply(reply(ReplyStatus::Ok, 1));
        cell.observe_iopub(&status(ExecutionState::Idle));

        expect_that!(
            handle.snapshot().transitions,
            elements_are![
                eq(ExecutionStatus::Queued),
                eq(ExecutionStatus::Sent),
                eq(ExecutionStatus::Executing),
                eq(ExecutionStatus::Ok),
            ]
        );
    }

    #[googletest::test]
    fn error_reply_fills_error_from_output_when_reply_has_none() {
        let mut cell = cell("buggy");
        cell.mark_sent();

        cell.observe_iopub(&Content::Error(ErrorContent {
            ename: "NameError".to_string(),
            evalue: "name 'buggy' is not defined".to_string(),
            traceback: vec!["line 1".to_string()],
        }));
        cell.observe_reply(ExecuteReply {
            status: ReplyStatus::Error,
            execution_count: Some(2),
            ename: None,
            evalue: None,
            traceback: None,
        });
        cell.observe_iopub(&status(ExecutionState::Idle));

        let result = cell.handle().result();
        expect_that!(cell.status(), eq(ExecutionStatus::Error));
        expect_that!(
            result.error,
            some(pat!(ExecutionError {
                ename: eq("NameError"),
                evalue: anything(),
                traceback: len(eq(1)),
            }))
        );
    }

    #[googletest::test]
    fn aborted_execution_ignores_late_messages() {
        let mut cell = cell("expensive");
        cell.mark_sent();
        cell.abort();

        cell.observe_iopub(&Content::Stream(Stream {
            name: StreamName::Stdout,
            text: "late".to_string(),
        }));
        cell.observe_reply(reply(ReplyStatus::Ok, 1));
        cell.observe_iopub(&status(ExecutionState::Idle));

        expect_that!(cell.status(), eq(ExecutionStatus::Aborted));
        expect_that!(cell.handle().result().outputs, empty());
    }

    #[googletest::test]
    fn finished_execution_keeps_its_outputs() {
        let mut cell = cell("print(x)");
        cell.mark_sent();
        cell.observe_iopub(&Content::Stream(Stream {
            name: StreamName::Stdout,
            text: "x\n".to_string(),
        }));
        cell.observe_reply(reply(ReplyStatus::Ok, 1));
        cell.observe_iopub(&status(ExecutionState::Idle));

        cell.observe_iopub(&Content::Stream(Stream {
            name: StreamName::Stdout,
            text: "late\n".to_string(),
        }));

        expect_that!(cell.status(), eq(ExecutionStatus::Ok));
        expect_that!(cell.handle().result().outputs, len(eq(1)));
    }

    #[googletest::test]
    fn aborted_reply_status_aborts() {
        let mut cell = cell("queued behind error");
        cell.mark_sent();
        cell.observe_reply(ExecuteReply {
            status: ReplyStatus::Aborted,
            execution_count: None,
            ename: None,
            evalue: None,
            traceback: None,
        });
        cell.observe_iopub(&status(ExecutionState::Idle));

        expect_that!(cell.status(), eq(ExecutionStatus::Aborted));
    }

    #[googletest::test]
    #[tokio::test]
    async fn status_updates_yield_every_transition() {
        let mut cell = cell("1+1");
        let mut updates = cell.handle().updates();

        cell.mark_sent();
        cell.observe_iopub(&status(ExecutionState::Busy));
        cell.observe_reply(reply(ReplyStatus::Ok, 1));
        cell.observe_iopub(&status(ExecutionState::Idle));

        let mut seen = Vec::new();
        while let Some(status) = updates.next().await {
            seen.push(status);
        }
        expect_that!(
            seen,
            elements_are![
                eq(ExecutionStatus::Queued),
                eq(ExecutionStatus::Sent),
                eq(ExecutionStatus::Executing),
                eq(ExecutionStatus::Ok),
            ]
        );
    }
}

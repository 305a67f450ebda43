use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore},
    task::{self, JoinHandle},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    execution::{CellExecution, ExecuteOptions, ExecutionHandle, ExecutionStatus},
    message::{
        CompleteReply, CompleteRequest, Content, ExecutionState, InputReply, InspectReply,
        InspectRequest, InterruptRequest, KernelInfoReply, KernelInfoRequest, Message,
        ShutdownRequest,
    },
    queue::{ExecutionQueue, QueuePolicy},
    transport::{Channel, Connector, Transport, TransportError},
    SessionError,
};

/// Lifecycle of the kernel behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Unstarted,
    Starting,
    Idle,
    Busy,
    Dead,
}

type Reply = oneshot::Receiver<Message>;

enum Command {
    Start {
        responds_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Execute {
        source: String,
        options: ExecuteOptions,
        permit: Option<OwnedSemaphorePermit>,
        responds_to: oneshot::Sender<ExecutionHandle>,
    },
    Request {
        content: Content,
        responds_to: oneshot::Sender<Result<Reply, SessionError>>,
    },
    Interrupt {
        policy: QueuePolicy,
        responds_to: oneshot::Sender<Result<Reply, SessionError>>,
    },
    Input {
        value: String,
        responds_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Restart {
        responds_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown {
        responds_to: oneshot::Sender<Result<(), SessionError>>,
    },
    History {
        responds_to: oneshot::Sender<Vec<ExecutionHandle>>,
    },
    ClearHistory,
}

impl Command {
    /// Commands that need a settled kernel wait while it starts or stops.
    fn waits_for_transition(&self) -> bool {
        matches!(
            self,
            Command::Start { .. }
                | Command::Request { .. }
                | Command::Interrupt { .. }
                | Command::Input { .. }
                | Command::Restart { .. }
                | Command::Shutdown { .. }
        )
    }
}

/// A caller-owned connection to one kernel.
///
/// Dropping the session shuts the kernel down and aborts whatever was still
/// queued or running.
pub struct KernelSession {
    session_id: String,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<KernelStatus>,
    admission: Option<Arc<Semaphore>>,
}

impl KernelSession {
    /// Creates an unstarted session; nothing is launched until [`start`](Self::start).
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(KernelStatus::Unstarted);
        let admission = config
            .queue_depth
            .map(|depth| Arc::new(Semaphore::new(depth)));

        let kernel = Kernel {
            session_id: session_id.clone(),
            config: config.clone(),
            connector,
            transport: None,
            queue: ExecutionQueue::new(),
            requests: HashMap::new(),
            kernel_info_request: None,
            status: status_sender,
            history: Vec::new(),
            transition: None,
            deferred: VecDeque::new(),
        };
        task::spawn(run_kernel(kernel, command_receiver));

        Self {
            session_id,
            config,
            commands,
            status,
            admission,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    pub fn status_updates(&self) -> watch::Receiver<KernelStatus> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.call(|responds_to| Command::Start { responds_to })
            .await?
    }

    pub async fn execute(&self, source: impl Into<String>) -> Result<ExecutionHandle, SessionError> {
        self.execute_with(source, ExecuteOptions::default()).await
    }

    /// Admits an execution to the queue. Only waits when a bounded queue is full.
    pub async fn execute_with(
        &self,
        source: impl Into<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, SessionError> {
        let permit = match &self.admission {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SessionError::KernelDead)?,
            ),
            None => None,
        };
        let source = source.into();

        self.call(|responds_to| Command::Execute {
            source,
            options,
            permit,
            responds_to,
        })
        .await
    }

    pub async fn complete(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
    ) -> Result<CompleteReply, SessionError> {
        let content = Content::CompleteRequest(CompleteRequest {
            code: code.into(),
            cursor_pos,
        });
        match self.request(content).await?.content {
            Content::CompleteReply(reply) => Ok(reply),
            other => Err(SessionError::UnexpectedReply(other.msg_type().to_string())),
        }
    }

    pub async fn inspect(
        &self,
        code: impl Into<String>,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<InspectReply, SessionError> {
        let content = Content::InspectRequest(InspectRequest {
            code: code.into(),
            cursor_pos,
            detail_level,
        });
        match self.request(content).await?.content {
            Content::InspectReply(reply) => Ok(reply),
            other => Err(SessionError::UnexpectedReply(other.msg_type().to_string())),
        }
    }

    pub async fn kernel_info(&self) -> Result<KernelInfoReply, SessionError> {
        let content = Content::KernelInfoRequest(KernelInfoRequest {});
        match self.request(content).await?.content {
            Content::KernelInfoReply(reply) => Ok(reply),
            other => Err(SessionError::UnexpectedReply(other.msg_type().to_string())),
        }
    }

    /// Asks the kernel to interrupt the running execution, which is marked
    /// aborted right away. `policy` decides what happens to the queue.
    /// Resolves once the kernel acknowledges the interrupt.
    pub async fn interrupt(&self, policy: QueuePolicy) -> Result<(), SessionError> {
        let reply = self
            .call(|responds_to| Command::Interrupt {
                policy,
                responds_to,
            })
            .await??;
        await_reply(reply, "interrupt_request", self.config.interrupt_timeout()).await?;
        Ok(())
    }

    /// Answers the kernel's pending `input_request`.
    pub async fn send_input(&self, value: impl Into<String>) -> Result<(), SessionError> {
        let value = value.into();
        self.call(|responds_to| Command::Input { value, responds_to })
            .await?
    }

    pub async fn restart(&self) -> Result<(), SessionError> {
        self.call(|responds_to| Command::Restart { responds_to })
            .await?
    }

    /// Shuts the kernel down. Calling it again on a dead session does nothing.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        match self
            .call(|responds_to| Command::Shutdown { responds_to })
            .await
        {
            Ok(result) => result,
            Err(SessionError::KernelDead) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Every execution admitted since the history was last cleared, in
    /// submission order.
    pub async fn history(&self) -> Vec<ExecutionHandle> {
        self.call(|responds_to| Command::History { responds_to })
            .await
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        let _ = self.commands.send(Command::ClearHistory);
    }

    async fn request(&self, content: Content) -> Result<Message, SessionError> {
        let msg_type = content.msg_type().to_string();
        let reply = self
            .call(|responds_to| Command::Request {
                content,
                responds_to,
            })
            .await??;
        timeout(self.config.request_timeout(), reply)
            .await
            .map_err(|_| SessionError::Timeout(msg_type, self.config.request_timeout()))?
            .map_err(|_| SessionError::KernelTerminated)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (responds_to, response) = oneshot::channel();
        self.commands
            .send(command(responds_to))
            .map_err(|_| SessionError::KernelDead)?;
        response.await.map_err(|_| SessionError::KernelDead)
    }
}

/// Creates a session and starts its kernel.
pub async fn launch(
    connector: Arc<dyn Connector>,
    config: SessionConfig,
) -> Result<KernelSession, SessionError> {
    let session = KernelSession::new(connector, config);
    session.start().await?;
    Ok(session)
}

async fn await_reply(reply: Reply, what: &str, limit: Duration) -> Result<Message, SessionError> {
    match timeout(limit, reply).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(_)) => Err(SessionError::KernelTerminated),
        Err(_) => Err(SessionError::Timeout(what.to_string(), limit)),
    }
}

/// Outcome of connecting to or stopping a kernel, which happens off the
/// actor so executions keep being admitted meanwhile.
enum Lifecycle {
    Connected(Result<Transport, TransportError>),
    Stopped(Result<(), SessionError>),
}

struct Transition {
    task: JoinHandle<Lifecycle>,
    responds_to: oneshot::Sender<Result<(), SessionError>>,
}

/// Session state owned by the background task. Only this task touches the
/// queue, the outstanding requests and the transport.
struct Kernel {
    session_id: String,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Transport>,
    queue: ExecutionQueue,
    requests: HashMap<String, oneshot::Sender<Message>>,
    kernel_info_request: Option<String>,
    status: watch::Sender<KernelStatus>,
    history: Vec<ExecutionHandle>,
    transition: Option<Transition>,
    deferred: VecDeque<Command>,
}

async fn run_kernel(mut kernel: Kernel, mut command_receiver: mpsc::UnboundedReceiver<Command>) {
    loop {
        tokio::select! {
            biased;

            command = command_receiver.recv() => match command {
                Some(command) => kernel.handle_command(command),
                None => break,
            },
            lifecycle = next_transition(&mut kernel.transition) => {
                kernel.complete_transition(lifecycle);
            }
            incoming = next_message(&mut kernel.transport) => match incoming {
                Ok((channel, message)) => kernel.route(channel, message),
                Err(error) => kernel.lose_transport(error),
            },
        }
    }

    kernel.teardown().await;
}

async fn next_transition(transition: &mut Option<Transition>) -> Lifecycle {
    let Some(transition) = transition else {
        return std::future::pending().await;
    };
    match (&mut transition.task).await {
        Ok(lifecycle) => lifecycle,
        Err(error) => {
            warn!(%error, "kernel lifecycle task failed");
            Lifecycle::Stopped(Err(SessionError::KernelDead))
        }
    }
}

async fn next_message(
    transport: &mut Option<Transport>,
) -> Result<(Channel, Message), TransportError> {
    match transport {
        Some(transport) => transport.recv_any().await,
        None => std::future::pending().await,
    }
}

impl Kernel {
    fn handle_command(&mut self, command: Command) {
        if self.transition.is_some() && command.waits_for_transition() {
            self.deferred.push_back(command);
            return;
        }

        match command {
            Command::Start { responds_to } => match self.current_status() {
                KernelStatus::Unstarted => self.begin_connect(responds_to),
                KernelStatus::Dead => {
                    let _ = responds_to.send(Err(SessionError::KernelDead));
                }
                _ => {
                    let _ = responds_to.send(Ok(()));
                }
            },
            Command::Execute {
                source,
                options,
                permit,
                responds_to,
            } => {
                let _ = responds_to.send(self.admit(source, options, permit));
                self.pump();
            }
            Command::Request {
                content,
                responds_to,
            } => {
                let _ = responds_to.send(self.send_request(Channel::Shell, content));
            }
            Command::Interrupt {
                policy,
                responds_to,
            } => {
                let _ = responds_to.send(self.interrupt(policy));
                self.pump();
            }
            Command::Input { value, responds_to } => {
                let _ = responds_to.send(self.reply_input(value));
            }
            Command::Restart { responds_to } => self.begin_restart(responds_to),
            Command::Shutdown { responds_to } => self.begin_shutdown(responds_to),
            Command::History { responds_to } => {
                let _ = responds_to.send(self.history.clone());
            }
            Command::ClearHistory => self.history.clear(),
        }
    }

    fn message(&self, content: Content) -> Message {
        Message::new(content, &self.session_id, &self.config.username)
    }

    fn current_status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: KernelStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(session_id = %self.session_id, from = ?*current, to = ?status, "kernel status");
            *current = status;
            true
        });
    }

    fn live_transport(&self) -> Result<&Transport, SessionError> {
        match (&self.transport, self.current_status()) {
            (Some(transport), _) => Ok(transport),
            (None, KernelStatus::Unstarted) => Err(SessionError::NotStarted),
            (None, _) => Err(SessionError::KernelDead),
        }
    }

    fn begin<F>(&mut self, responds_to: oneshot::Sender<Result<(), SessionError>>, work: F)
    where
        F: Future<Output = Lifecycle> + Send + 'static,
    {
        self.transition = Some(Transition {
            task: task::spawn(work),
            responds_to,
        });
    }

    fn begin_connect(&mut self, responds_to: oneshot::Sender<Result<(), SessionError>>) {
        self.set_status(KernelStatus::Starting);
        let connector = self.connector.clone();
        let session_id = self.session_id.clone();
        self.begin(responds_to, async move {
            Lifecycle::Connected(connector.connect(&session_id).await)
        });
    }

    fn begin_restart(&mut self, responds_to: oneshot::Sender<Result<(), SessionError>>) {
        info!(session_id = %self.session_id, "restarting kernel");
        self.abort_everything();
        self.set_status(KernelStatus::Starting);

        let stopping = self.transport.take().map(|transport| {
            let request = self.message(Content::ShutdownRequest(ShutdownRequest { restart: true }));
            (transport, request)
        });
        let limit = self.config.shutdown_timeout();
        let connector = self.connector.clone();
        let session_id = self.session_id.clone();
        self.begin(responds_to, async move {
            if let Some((transport, request)) = stopping {
                if let Err(error) = stop_kernel(transport, request, limit).await {
                    warn!(%error, "kernel did not acknowledge restart");
                }
            }
            Lifecycle::Connected(connector.connect(&session_id).await)
        });
    }

    fn begin_shutdown(&mut self, responds_to: oneshot::Sender<Result<(), SessionError>>) {
        self.abort_everything();
        self.set_status(KernelStatus::Dead);

        let Some(transport) = self.transport.take() else {
            let _ = responds_to.send(Ok(()));
            return;
        };
        let request = self.message(Content::ShutdownRequest(ShutdownRequest { restart: false }));
        let limit = self.config.shutdown_timeout();
        self.begin(responds_to, async move {
            Lifecycle::Stopped(stop_kernel(transport, request, limit).await)
        });
    }

    /// Applies a finished start, restart or shutdown and replays the commands
    /// that waited for it.
    fn complete_transition(&mut self, lifecycle: Lifecycle) {
        let Some(Transition { responds_to, .. }) = self.transition.take() else {
            return;
        };

        let result = match lifecycle {
            Lifecycle::Connected(Ok(transport)) => {
                self.attach(transport);
                Ok(())
            }
            Lifecycle::Connected(Err(error)) => {
                warn!(session_id = %self.session_id, %error, "could not start kernel");
                self.abort_everything();
                self.set_status(KernelStatus::Dead);
                Err(error.into())
            }
            Lifecycle::Stopped(result) => {
                self.abort_everything();
                self.set_status(KernelStatus::Dead);
                result
            }
        };
        let _ = responds_to.send(result);

        while self.transition.is_none() {
            let Some(command) = self.deferred.pop_front() else {
                break;
            };
            self.handle_command(command);
        }
    }

    fn attach(&mut self, transport: Transport) {
        let kernel_info = self.message(Content::KernelInfoRequest(KernelInfoRequest {}));
        if let Err(error) = transport.send(Channel::Shell, &kernel_info) {
            warn!(%error, "could not request kernel info");
        } else {
            self.kernel_info_request = Some(kernel_info.msg_id().to_string());
        }
        self.transport = Some(transport);

        info!(session_id = %self.session_id, "kernel connected");
        self.pump();
    }

    fn admit(
        &mut self,
        source: String,
        options: ExecuteOptions,
        permit: Option<OwnedSemaphorePermit>,
    ) -> ExecutionHandle {
        let seq = self.queue.next_seq();
        let request = self.message(Content::ExecuteRequest(options.request(source)));
        let mut execution = CellExecution::new(seq, request, options, permit);
        let handle = execution.handle();
        self.history.push(handle.clone());

        if self.current_status() == KernelStatus::Dead {
            execution.abort();
        } else {
            self.queue.push(execution);
        }
        handle
    }

    /// Sends the next queued execution when nothing is in flight.
    fn pump(&mut self) {
        loop {
            if let Some(finished) = self.queue.take_finished() {
                if finished.status() == ExecutionStatus::Error && finished.stops_on_error() {
                    let aborted = self.queue.clear();
                    if aborted > 0 {
                        info!(seq = finished.seq(), aborted, "execution failed, aborting queue");
                    }
                }
            }

            let Some(transport) = &self.transport else {
                return;
            };
            let Some(execution) = self.queue.advance() else {
                return;
            };

            match transport.send(Channel::Shell, execution.request()) {
                Ok(()) => {
                    execution.mark_sent();
                    return;
                }
                Err(error) => {
                    warn!(seq = execution.seq(), %error, "could not send execution");
                    execution.abort();
                }
            }
        }
    }

    fn send_request(&mut self, channel: Channel, content: Content) -> Result<Reply, SessionError> {
        let request = self.message(content);
        self.live_transport()?.send(channel, &request)?;

        let (responds_to, reply) = oneshot::channel();
        self.requests
            .insert(request.msg_id().to_string(), responds_to);
        Ok(reply)
    }

    fn interrupt(&mut self, policy: QueuePolicy) -> Result<Reply, SessionError> {
        let reply = self.send_request(
            Channel::Control,
            Content::InterruptRequest(InterruptRequest {}),
        )?;

        let interrupted = self.queue.abort_in_flight();
        let cleared = match policy {
            QueuePolicy::Clear => self.queue.clear(),
            QueuePolicy::Drain => 0,
        };
        info!(?interrupted, ?policy, cleared, "interrupt requested");
        Ok(reply)
    }

    fn reply_input(&mut self, value: String) -> Result<(), SessionError> {
        let parent = self
            .queue
            .in_flight_mut()
            .and_then(CellExecution::take_input_request)
            .ok_or(SessionError::NoPendingInput)?;

        let mut reply = self.message(Content::InputReply(InputReply { value }));
        reply.parent_header = Some(parent);
        self.live_transport()?.send(Channel::Stdin, &reply)?;
        Ok(())
    }

    /// Routes one incoming message to whatever is waiting for it.
    fn route(&mut self, channel: Channel, message: Message) {
        if let Content::Status(status) = &message.content {
            self.observe_status(status.execution_state);
        }

        let Some(parent_id) = message.parent_id().map(str::to_string) else {
            debug!(%channel, msg_type = message.msg_type(), "dropping message without parent");
            return;
        };

        match channel {
            Channel::IoPub => match self.queue.outstanding(&parent_id) {
                Some(execution) => execution.observe_iopub(&message.content),
                None => debug!(msg_type = message.msg_type(), %parent_id, "dropping unmatched iopub message"),
            },
            Channel::Shell | Channel::Control => {
                if let Some(responds_to) = self.requests.remove(&parent_id) {
                    let _ = responds_to.send(message);
                } else if self.kernel_info_request.as_deref() == Some(parent_id.as_str()) {
                    self.kernel_info_request = None;
                    if self.current_status() == KernelStatus::Starting {
                        self.set_status(KernelStatus::Idle);
                    }
                } else if let Some(execution) = self.queue.outstanding(&parent_id) {
                    match message.content {
                        Content::ExecuteReply(reply) => execution.observe_reply(reply),
                        other => debug!(msg_type = other.msg_type(), "unexpected reply to execution"),
                    }
                } else {
                    debug!(%channel, msg_type = message.msg_type(), %parent_id, "dropping unmatched reply");
                }
            }
            Channel::Stdin => {
                let Message {
                    header, content, ..
                } = message;
                match (self.queue.outstanding(&parent_id), content) {
                    (Some(execution), Content::InputRequest(request)) => {
                        execution.request_input(header, request)
                    }
                    (_, content) => {
                        debug!(msg_type = content.msg_type(), %parent_id, "dropping stdin message")
                    }
                }
            }
        }

        self.pump();
    }

    fn observe_status(&self, state: ExecutionState) {
        if matches!(
            self.current_status(),
            KernelStatus::Dead | KernelStatus::Unstarted
        ) {
            return;
        }
        self.set_status(match state {
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Idle => KernelStatus::Idle,
        });
    }

    fn lose_transport(&mut self, error: TransportError) {
        warn!(session_id = %self.session_id, %error, "kernel connection lost");
        self.abort_everything();
        if let Some(transport) = self.transport.take() {
            task::spawn(transport.close(self.config.kill_grace()));
        }
        self.set_status(KernelStatus::Dead);
    }

    fn abort_everything(&mut self) {
        self.queue.abort_all();
        self.requests.clear();
        self.kernel_info_request = None;
    }

    async fn teardown(&mut self) {
        if let Some(transition) = self.transition.take() {
            if let Ok(Lifecycle::Connected(Ok(transport))) = transition.task.await {
                self.transport = Some(transport);
            }
        }
        self.deferred.clear();
        self.abort_everything();

        if let Some(transport) = self.transport.take() {
            let request = self.message(Content::ShutdownRequest(ShutdownRequest { restart: false }));
            if let Err(error) = stop_kernel(transport, request, self.config.shutdown_timeout()).await {
                warn!(%error, "kernel did not shut down cleanly");
            }
        }
        self.set_status(KernelStatus::Dead);
        debug!(session_id = %self.session_id, "session closed");
    }
}

/// Sends `shutdown_request`, waits for the reply and closes the transport,
/// each step bounded by `limit`.
async fn stop_kernel(
    mut transport: Transport,
    request: Message,
    limit: Duration,
) -> Result<(), SessionError> {
    let acknowledged = match transport.send(Channel::Control, &request) {
        Ok(()) => {
            let msg_id = request.msg_id();
            let wait = async {
                loop {
                    match transport.recv_any().await {
                        Ok((_, message)) if message.parent_id() == Some(msg_id) => break,
                        Ok(_) => continue,
                        // A kernel that is already gone needs no acknowledgement.
                        Err(_) => break,
                    }
                }
            };
            timeout(limit, wait).await.is_ok()
        }
        Err(error) => {
            debug!(%error, "could not send shutdown request");
            true
        }
    };

    if transport.close(limit).await {
        warn!(session_id = %request.header.session, "kernel transport had to be torn down");
    }

    if acknowledged {
        Ok(())
    } else {
        Err(SessionError::Timeout("shutdown_request".to_string(), limit))
    }
}

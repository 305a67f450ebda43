use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use orrery_kernel::{
    message::{
        ClearOutput, CompleteReply, Content, DisplayData, ErrorContent, ExecuteInput,
        ExecuteReply, ExecuteRequest, ExecuteResult, ExecutionState, Header, InputRequest,
        InspectReply, InterruptReply, KernelInfoReply, LanguageInfo, MimeBundle, ReplyStatus,
        ShutdownReply, Status, Stream, StreamName, Transient,
    },
    transport::{
        memory::{MemoryConnector, MemoryKernel},
        Channel,
    },
    Message,
};
use serde_json::{Map, Value};
use tokio::task;

pub const KEY: &[u8] = b"mock-kernel-key";

// Demo of the behaviour of code:
// - `print(x)` writes `x` to stdout
// - `1+1` evaluates to `2`; any other code evaluates to itself
// - code containing `buggy` fails with a `NameError`
// - code containing `expensive` writes partial output and runs until interrupted
// - code containing `display` shows a progress display and updates it in place
// - code containing `clear` writes, clears and writes again
// - code containing `input` asks for a name on stdin
// - code containing `crash` kills the kernel
#[derive(Clone, Default)]
pub struct MockKernel {
    ignores_shutdown: bool,
    connections: Arc<AtomicUsize>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel that never answers `shutdown_request`.
    pub fn ignoring_shutdown() -> Self {
        Self {
            ignores_shutdown: true,
            ..Self::default()
        }
    }

    /// How many times a session connected to this kernel.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        let mock = self.clone();
        Arc::new(MemoryConnector::new(KEY, move |kernel| {
            mock.connections.fetch_add(1, Ordering::SeqCst);
            let ignores_shutdown = mock.ignores_shutdown;
            task::spawn(async move { run_mock_kernel(kernel, ignores_shutdown).await });
        }))
    }
}

/// An execution the mock has not replied to yet.
struct Pending {
    request: Header,
    execution_count: u32,
}

async fn run_mock_kernel(mut kernel: MemoryKernel, ignores_shutdown: bool) {
    let mut execution_count = 0;
    let mut running: Option<Pending> = None;
    let mut awaiting_input: Option<Pending> = None;

    publish(&kernel, None, status(ExecutionState::Starting));

    while let Some((channel, request)) = kernel.recv().await {
        let header = request.header.clone();

        match request.content {
            Content::ExecuteRequest(execute) => {
                execution_count += 1;
                let pending = Pending {
                    request: header,
                    execution_count,
                };
                publish(&kernel, Some(&pending.request), status(ExecutionState::Busy));
                publish(
                    &kernel,
                    Some(&pending.request),
                    Content::ExecuteInput(ExecuteInput {
                        code: execute.code.clone(),
                        execution_count,
                    }),
                );

                if execute.code.contains("crash") {
                    kernel.crash();
                    return;
                } else if execute.code.contains("expensive") {
                    stream(&kernel, &pending.request, "Partial output...");
                    running = Some(pending);
                } else if execute.code.contains("input") {
                    reply(
                        &kernel,
                        Channel::Stdin,
                        &pending.request,
                        Content::InputRequest(InputRequest {
                            prompt: "name: ".to_string(),
                            password: false,
                        }),
                    );
                    awaiting_input = Some(pending);
                } else {
                    simulate(&kernel, &pending, &execute);
                }
            }
            Content::InputReply(input) => {
                if let Some(pending) = awaiting_input.take() {
                    stream(&kernel, &pending.request, &format!("hello {}\n", input.value));
                    finish_ok(&kernel, &pending);
                }
            }
            Content::InterruptRequest(_) => {
                if let Some(pending) = running.take() {
                    let interrupted = ErrorContent {
                        ename: "KeyboardInterrupt".to_string(),
                        evalue: String::new(),
                        traceback: Vec::new(),
                    };
                    finish_error(&kernel, &pending, interrupted);
                }
                reply(
                    &kernel,
                    channel,
                    &header,
                    Content::InterruptReply(InterruptReply {
                        status: ReplyStatus::Ok,
                    }),
                );
            }
            Content::KernelInfoRequest(_) => {
                around_busy(&kernel, &header, || {
                    reply(&kernel, channel, &header, kernel_info());
                });
            }
            Content::CompleteRequest(complete) => {
                let prefix = complete.code.get(..complete.cursor_pos).unwrap_or_default();
                let matches = ["print", "property", "range"]
                    .into_iter()
                    .filter(|candidate| candidate.starts_with(prefix))
                    .map(str::to_string)
                    .collect();
                around_busy(&kernel, &header, || {
                    reply(
                        &kernel,
                        channel,
                        &header,
                        Content::CompleteReply(CompleteReply {
                            status: ReplyStatus::Ok,
                            matches,
                            cursor_start: 0,
                            cursor_end: complete.cursor_pos,
                            metadata: Map::new(),
                        }),
                    );
                });
            }
            Content::InspectRequest(inspect) => {
                around_busy(&kernel, &header, || {
                    reply(
                        &kernel,
                        channel,
                        &header,
                        Content::InspectReply(InspectReply {
                            status: ReplyStatus::Ok,
                            found: true,
                            data: plain(&format!("Docstring of {}", inspect.code)),
                            metadata: Map::new(),
                        }),
                    );
                });
            }
            Content::ShutdownRequest(shutdown) => {
                if ignores_shutdown {
                    continue;
                }
                reply(
                    &kernel,
                    channel,
                    &header,
                    Content::ShutdownReply(ShutdownReply {
                        status: ReplyStatus::Ok,
                        restart: shutdown.restart,
                    }),
                );
                return;
            }
            _ => {}
        }
    }
}

fn simulate(kernel: &MemoryKernel, pending: &Pending, execute: &ExecuteRequest) {
    let parent = &pending.request;
    let code = execute.code.trim();

    if code.contains("buggy") {
        let error = ErrorContent {
            ename: "NameError".to_string(),
            evalue: "name 'buggy' is not defined".to_string(),
            traceback: vec!["Traceback (most recent call last)".to_string()],
        };
        finish_error(kernel, pending, error);
        return;
    }

    if code.contains("display") {
        let progress = |text: &str| DisplayData {
            data: plain(text),
            metadata: Map::new(),
            transient: Some(Transient {
                display_id: Some("progress".to_string()),
            }),
        };
        publish(kernel, Some(parent), Content::DisplayData(progress("0%")));
        stream(kernel, parent, "working\n");
        publish(kernel, Some(parent), Content::UpdateDisplayData(progress("100%")));
    } else if code.contains("clear") {
        stream(kernel, parent, "first\n");
        publish(
            kernel,
            Some(parent),
            Content::ClearOutput(ClearOutput { wait: false }),
        );
        stream(kernel, parent, "second\n");
    } else if let Some(text) = code
        .strip_prefix("print(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        stream(kernel, parent, &format!("{text}\n"));
    } else if !execute.silent {
        let value = if code == "1+1" { "2" } else { code };
        publish(
            kernel,
            Some(parent),
            Content::ExecuteResult(ExecuteResult {
                execution_count: pending.execution_count,
                data: plain(value),
                metadata: Map::new(),
            }),
        );
    }

    finish_ok(kernel, pending);
}

fn finish_ok(kernel: &MemoryKernel, pending: &Pending) {
    reply(
        kernel,
        Channel::Shell,
        &pending.request,
        Content::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            execution_count: Some(pending.execution_count),
            ename: None,
            evalue: None,
            traceback: None,
        }),
    );
    publish(kernel, Some(&pending.request), status(ExecutionState::Idle));
}

fn finish_error(kernel: &MemoryKernel, pending: &Pending, error: ErrorContent) {
    publish(kernel, Some(&pending.request), Content::Error(error.clone()));
    // Idle before the reply, as kernels are free to order across channels.
    publish(kernel, Some(&pending.request), status(ExecutionState::Idle));
    reply(
        kernel,
        Channel::Shell,
        &pending.request,
        Content::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Error,
            execution_count: Some(pending.execution_count),
            ename: Some(error.ename),
            evalue: Some(error.evalue),
            traceback: Some(error.traceback),
        }),
    );
}

fn around_busy(kernel: &MemoryKernel, parent: &Header, body: impl FnOnce()) {
    publish(kernel, Some(parent), status(ExecutionState::Busy));
    body();
    publish(kernel, Some(parent), status(ExecutionState::Idle));
}

fn kernel_info() -> Content {
    Content::KernelInfoReply(KernelInfoReply {
        status: ReplyStatus::Ok,
        protocol_version: "5.3".to_string(),
        implementation: "mock".to_string(),
        implementation_version: "0.1.0".to_string(),
        language_info: LanguageInfo {
            name: "mock".to_string(),
            version: "1.0".to_string(),
            mimetype: None,
            file_extension: Some(".mock".to_string()),
        },
        banner: "Mock kernel".to_string(),
    })
}

fn status(execution_state: ExecutionState) -> Content {
    Content::Status(Status { execution_state })
}

fn plain(text: &str) -> MimeBundle {
    let mut data = Map::new();
    data.insert("text/plain".to_string(), Value::String(text.to_string()));
    data
}

fn stream(kernel: &MemoryKernel, parent: &Header, text: &str) {
    publish(
        kernel,
        Some(parent),
        Content::Stream(Stream {
            name: StreamName::Stdout,
            text: text.to_string(),
        }),
    );
}

fn publish(kernel: &MemoryKernel, parent: Option<&Header>, content: Content) {
    let message = match parent {
        Some(parent) => Message::reply_to(parent, content),
        None => Message::new(content, "mock-kernel", "kernel"),
    };
    let _ = kernel.send(Channel::IoPub, &message);
}

fn reply(kernel: &MemoryKernel, channel: Channel, parent: &Header, content: Content) {
    let _ = kernel.send(channel, &Message::reply_to(parent, content));
}

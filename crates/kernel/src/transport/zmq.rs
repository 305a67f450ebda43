use std::{path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::{Channel, Connector, Transport, TransportError, Wire, Wires};
use crate::{config::SessionConfig, connection::ConnectionInfo};

const DIAL_RETRY: Duration = Duration::from_millis(50);

/// Connects the channel sockets described by `info` and starts pumping
/// frames between them and `transport`. Endpoints that refuse the
/// connection are retried until the caller gives up.
pub(crate) async fn open(
    info: &ConnectionInfo,
    transport: &mut Transport,
    wires: Wires,
) -> Result<(), TransportError> {
    let closing = transport.closing();
    let dialed = async {
        let shell: DealerSocket = dial(&info.endpoint(Channel::Shell)).await;
        let control: DealerSocket = dial(&info.endpoint(Channel::Control)).await;
        let stdin: DealerSocket = dial(&info.endpoint(Channel::Stdin)).await;
        let iopub: SubSocket = dial(&info.endpoint(Channel::IoPub)).await;
        (shell, control, stdin, iopub)
    };
    let (shell, control, stdin, mut iopub) = tokio::select! {
        sockets = dialed => sockets,
        _ = closing.cancelled() => return Err(TransportError::KernelTerminated),
    };
    iopub.subscribe("").await?;

    transport.spawn(run_dealer(Channel::Shell, shell, wires.shell, closing.clone()));
    transport.spawn(run_dealer(
        Channel::Control,
        control,
        wires.control,
        closing.clone(),
    ));
    transport.spawn(run_dealer(Channel::Stdin, stdin, wires.stdin, closing.clone()));
    transport.spawn(run_subscriber(iopub, wires.iopub, closing));

    debug!(ip = %info.ip, "kernel channels connected");
    Ok(())
}

/// Connects to `endpoint`, retrying while it refuses. Callers bound the wait.
async fn dial<S: Socket>(endpoint: &str) -> S {
    loop {
        let mut socket = S::new();
        match socket.connect(endpoint).await {
            Ok(()) => return socket,
            Err(error) => {
                debug!(endpoint, %error, "kernel endpoint not reachable yet");
                sleep(DIAL_RETRY).await;
            }
        }
    }
}

async fn run_dealer(channel: Channel, mut socket: DealerSocket, wire: Wire, closing: CancellationToken) {
    let Wire {
        mut outbound,
        inbound,
    } = wire;

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            frames = outbound.recv() => {
                let Some(frames) = frames else { break };
                let message = match ZmqMessage::try_from(frames) {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(%channel, %error, "refusing to send message");
                        continue;
                    }
                };
                if let Err(error) = socket.send(message).await {
                    warn!(%channel, %error, "could not send message");
                }
            }
            received = socket.recv() => match received {
                Ok(message) => {
                    if inbound.send(message.into_vec()).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    warn!(%channel, %error, "channel failed");
                    break;
                }
            },
        }
    }

    debug!(%channel, "channel closed");
}

async fn run_subscriber(mut socket: SubSocket, wire: Wire, closing: CancellationToken) {
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            received = socket.recv() => match received {
                Ok(message) => {
                    if wire.inbound.send(message.into_vec()).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    warn!(channel = %Channel::IoPub, %error, "channel failed");
                    break;
                }
            },
        }
    }

    debug!(channel = %Channel::IoPub, "channel closed");
}

/// Pings the kernel's heartbeat socket; declares the kernel terminated after
/// `misses` consecutive pings go unanswered within `interval`. A reconnect
/// that does not succeed within `interval` counts as a miss too.
pub(crate) async fn run_heartbeat(
    endpoint: String,
    interval: Duration,
    misses: u32,
    terminated: CancellationToken,
    closing: CancellationToken,
) {
    let mut socket: Option<ReqSocket> = None;
    let mut missed = 0;

    loop {
        let beat = async {
            let mut req = match socket.take() {
                Some(req) => req,
                None => dial::<ReqSocket>(&endpoint).await,
            };
            req.send(ZmqMessage::from(Bytes::from_static(b"ping"))).await?;
            req.recv().await?;
            Ok::<_, zeromq::ZmqError>(req)
        };

        let outcome = tokio::select! {
            _ = closing.cancelled() => return,
            outcome = timeout(interval, beat) => outcome,
        };

        let failure = match outcome {
            Ok(Ok(req)) => {
                missed = 0;
                socket = Some(req);
                tokio::select! {
                    _ = closing.cancelled() => return,
                    _ = sleep(interval) => {}
                }
                continue;
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("no reply within {interval:?}"),
        };

        // A REQ socket that lost its reply cannot send again, so the next
        // beat dials a fresh one.
        missed += 1;
        warn!(missed, %failure, "kernel missed a heartbeat");
        if missed >= misses {
            terminated.cancel();
            return;
        }
    }
}

/// Attaches to a kernel that is already running, given its connection file.
pub struct RemoteKernel {
    info: ConnectionInfo,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_misses: u32,
}

impl RemoteKernel {
    pub fn new(info: ConnectionInfo, config: &SessionConfig) -> Self {
        Self {
            info,
            connect_timeout: config.startup_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_misses: config.heartbeat_misses.max(1),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, config: &SessionConfig) -> std::io::Result<Self> {
        Ok(Self::new(ConnectionInfo::from_file(path)?, config))
    }
}

#[async_trait]
impl Connector for RemoteKernel {
    async fn connect(&self, session_id: &str) -> Result<Transport, TransportError> {
        let (mut transport, wires) = Transport::wire(self.info.codec()?);

        timeout(self.connect_timeout, open(&self.info, &mut transport, wires))
            .await
            .map_err(|_| TransportError::StartupTimeout(self.connect_timeout))??;

        let terminator = transport.terminator();
        let closing = transport.closing();
        transport.spawn(run_heartbeat(
            self.info.heartbeat_endpoint(),
            self.heartbeat_interval,
            self.heartbeat_misses,
            terminator,
            closing,
        ));

        info!(session_id, kernel = ?self.info.kernel_name, "attached to kernel");
        Ok(transport)
    }
}

pub mod memory;
pub mod process;
pub mod zmq;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{Codec, CodecError, Frames},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Shell,
    Control,
    IoPub,
    Stdin,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Shell,
        Channel::Control,
        Channel::IoPub,
        Channel::Stdin,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
        })
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kernel terminated")]
    KernelTerminated,
    #[error("{0} channel is closed")]
    ChannelClosed(Channel),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zmq(#[from] zeromq::ZmqError),
    #[error("kernel did not come up within {0:?}")]
    StartupTimeout(Duration),
}

/// Opens a [`Transport`] to a kernel, launching it first if needed.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Transport, TransportError>;
}

/// The kernel-facing end of one channel: frames the client sends come out of
/// `outbound`, frames from the kernel go into `inbound`.
pub struct Wire {
    pub outbound: mpsc::UnboundedReceiver<Frames>,
    pub inbound: mpsc::UnboundedSender<Frames>,
}

pub struct Wires {
    pub shell: Wire,
    pub control: Wire,
    pub iopub: Wire,
    pub stdin: Wire,
}

/// Receiving end of one channel.
pub struct ChannelReceiver {
    channel: Channel,
    codec: Arc<Codec>,
    frames: mpsc::UnboundedReceiver<Frames>,
    terminated: CancellationToken,
}

impl ChannelReceiver {
    /// Next decodable message. Frames that fail to decode are logged and
    /// skipped; once the kernel is gone this fails with `KernelTerminated`.
    pub async fn receive(&mut self) -> Result<Message, TransportError> {
        loop {
            let frames = tokio::select! {
                biased;

                frames = self.frames.recv() => frames.ok_or(TransportError::KernelTerminated)?,
                _ = self.terminated.cancelled() => return Err(TransportError::KernelTerminated),
            };

            match self.codec.decode(frames) {
                Ok(message) => return Ok(message),
                Err(error) => warn!(channel = %self.channel, %error, "dropping message"),
            }
        }
    }
}

/// The four channels to exactly one kernel.
pub struct Transport {
    codec: Arc<Codec>,
    senders: [mpsc::UnboundedSender<Frames>; 4],
    shell: ChannelReceiver,
    control: ChannelReceiver,
    iopub: ChannelReceiver,
    stdin: ChannelReceiver,
    terminated: CancellationToken,
    closing: CancellationToken,
    tasks: JoinSet<()>,
}

impl Transport {
    /// Creates the client end and hands back the kernel end for a backend to
    /// pump.
    pub fn wire(codec: Codec) -> (Self, Wires) {
        let codec = Arc::new(codec);
        let terminated = CancellationToken::new();

        let open = |channel| {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let receiver = ChannelReceiver {
                channel,
                codec: codec.clone(),
                frames: inbound_rx,
                terminated: terminated.clone(),
            };
            let wire = Wire {
                outbound: outbound_rx,
                inbound: inbound_tx,
            };
            (outbound_tx, receiver, wire)
        };

        // Sender order follows `Channel::index`.
        let (shell_tx, shell, shell_wire) = open(Channel::Shell);
        let (control_tx, control, control_wire) = open(Channel::Control);
        let (iopub_tx, iopub, iopub_wire) = open(Channel::IoPub);
        let (stdin_tx, stdin, stdin_wire) = open(Channel::Stdin);

        let transport = Self {
            codec: codec.clone(),
            senders: [shell_tx, control_tx, iopub_tx, stdin_tx],
            shell,
            control,
            iopub,
            stdin,
            terminated: terminated.clone(),
            closing: CancellationToken::new(),
            tasks: JoinSet::new(),
        };
        let wires = Wires {
            shell: shell_wire,
            control: control_wire,
            iopub: iopub_wire,
            stdin: stdin_wire,
        };

        (transport, wires)
    }

    /// Runs a backend task for as long as this transport lives.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Cancelled by the backend when the kernel is gone.
    pub fn terminator(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Cancelled when the client closes the transport.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Queues `message` on `channel` without waiting for it to be written.
    pub fn send(&self, channel: Channel, message: &Message) -> Result<(), TransportError> {
        if self.is_terminated() {
            return Err(TransportError::KernelTerminated);
        }
        let frames = self.codec.encode(message)?;
        self.senders[channel.index()]
            .send(frames)
            .map_err(|_| TransportError::ChannelClosed(channel))
    }

    pub async fn receive(&mut self, channel: Channel) -> Result<Message, TransportError> {
        let receiver = match channel {
            Channel::Shell => &mut self.shell,
            Channel::Control => &mut self.control,
            Channel::IoPub => &mut self.iopub,
            Channel::Stdin => &mut self.stdin,
        };
        receiver.receive().await
    }

    /// Next message from whichever channel has one.
    pub async fn recv_any(&mut self) -> Result<(Channel, Message), TransportError> {
        tokio::select! {
            message = self.iopub.receive() => message.map(|m| (Channel::IoPub, m)),
            message = self.shell.receive() => message.map(|m| (Channel::Shell, m)),
            message = self.control.receive() => message.map(|m| (Channel::Control, m)),
            message = self.stdin.receive() => message.map(|m| (Channel::Stdin, m)),
        }
    }

    /// Stops every channel task, waiting up to `limit` before aborting them.
    /// Returns `true` when the tasks had to be aborted.
    pub async fn close(mut self, limit: Duration) -> bool {
        self.closing.cancel();

        let tasks = &mut self.tasks;
        let drained = timeout(limit, async { while tasks.join_next().await.is_some() {} })
            .await
            .is_ok();
        if !drained {
            warn!(?limit, "transport did not close in time, aborting its tasks");
            self.tasks.shutdown().await;
        }

        self.terminated.cancel();
        debug!("transport closed");
        !drained
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closing.cancel();
        self.terminated.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Content, KernelInfoRequest};
    use bytes::Bytes;
    use googletest::prelude::*;

    fn kernel_info() -> Message {
        Message::new(
            Content::KernelInfoRequest(KernelInfoRequest {}),
            "session",
            "user",
        )
    }

    #[googletest::test]
    #[tokio::test]
    async fn sent_message_reaches_the_kernel_end() {
        let (transport, mut wires) = Transport::wire(Codec::new(b"key"));
        let message = kernel_info();

        transport.send(Channel::Control, &message).unwrap();

        let frames = wires.control.outbound.recv().await.unwrap();
        expect_that!(transport.codec().decode(frames).unwrap(), eq(message));
    }

    #[googletest::test]
    #[tokio::test]
    async fn undecodable_frames_are_skipped() {
        let (mut transport, wires) = Transport::wire(Codec::new(b"key"));
        let message = kernel_info();

        wires
            .shell
            .inbound
            .send(vec![Bytes::from_static(b"garbage")])
            .unwrap();
        wires
            .shell
            .inbound
            .send(Codec::new(b"wrong key").encode(&message).unwrap())
            .unwrap();
        wires
            .shell
            .inbound
            .send(transport.codec().encode(&message).unwrap())
            .unwrap();

        let received = transport.receive(Channel::Shell).await;
        expect_that!(received.unwrap(), eq(message));
    }

    #[googletest::test]
    #[tokio::test]
    async fn termination_fails_pending_receive() {
        let (mut transport, _wires) = Transport::wire(Codec::unsigned());
        let terminator = transport.terminator();

        tokio::spawn(async move { terminator.cancel() });

        expect_that!(
            transport.recv_any().await,
            err(pat!(TransportError::KernelTerminated))
        );
        expect_that!(
            transport.send(Channel::Shell, &kernel_info()),
            err(pat!(TransportError::KernelTerminated))
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn close_aborts_tasks_that_ignore_closing() {
        let (mut transport, _wires) = Transport::wire(Codec::unsigned());
        transport.spawn(std::future::pending());

        let forced = transport.close(Duration::from_millis(10)).await;

        expect_that!(forced, eq(true));
    }

    #[googletest::test]
    #[tokio::test]
    async fn close_waits_for_tasks_honouring_closing() {
        let (mut transport, _wires) = Transport::wire(Codec::unsigned());
        let closing = transport.closing();
        transport.spawn(async move { closing.cancelled().await });

        let forced = transport.close(Duration::from_secs(1)).await;

        expect_that!(forced, eq(false));
    }
}

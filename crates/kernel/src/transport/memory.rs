//! An in-process kernel end, for driving a session without a real kernel.
//!
//! Frames still pass through the [`Codec`], so signing and validation behave
//! as they do over sockets.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Channel, Connector, Transport, TransportError, Wires};
use crate::{
    codec::{Codec, Frames},
    message::Message,
};

pub struct MemoryKernel {
    codec: Codec,
    wires: Wires,
    terminated: CancellationToken,
    closing: CancellationToken,
}

pub fn pair(codec: Codec) -> (Transport, MemoryKernel) {
    let (transport, wires) = Transport::wire(codec.clone());
    let kernel = MemoryKernel {
        codec,
        wires,
        terminated: transport.terminator(),
        closing: transport.closing(),
    };
    (transport, kernel)
}

impl MemoryKernel {
    /// Next client message on shell, control or stdin; `None` once the client
    /// closed the transport.
    pub async fn recv(&mut self) -> Option<(Channel, Message)> {
        loop {
            let (channel, frames) = tokio::select! {
                biased;

                Some(frames) = self.wires.control.outbound.recv() => (Channel::Control, frames),
                Some(frames) = self.wires.shell.outbound.recv() => (Channel::Shell, frames),
                Some(frames) = self.wires.stdin.outbound.recv() => (Channel::Stdin, frames),
                _ = self.closing.cancelled() => return None,
            };

            match self.codec.decode(frames) {
                Ok(message) => return Some((channel, message)),
                Err(error) => warn!(%channel, %error, "kernel dropping message"),
            }
        }
    }

    pub fn send(&self, channel: Channel, message: &Message) -> Result<(), TransportError> {
        let frames = self.codec.encode(message)?;
        self.send_frames(channel, frames)
    }

    /// Sends raw frames, bypassing the codec.
    pub fn send_frames(&self, channel: Channel, frames: Frames) -> Result<(), TransportError> {
        let wire = match channel {
            Channel::Shell => &self.wires.shell,
            Channel::Control => &self.wires.control,
            Channel::IoPub => &self.wires.iopub,
            Channel::Stdin => &self.wires.stdin,
        };
        wire.inbound
            .send(frames)
            .map_err(|_| TransportError::ChannelClosed(channel))
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Simulates the kernel process dying.
    pub fn crash(&self) {
        self.terminated.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }
}

type SpawnKernel = dyn Fn(MemoryKernel) + Send + Sync;

/// Connects to a fresh in-memory kernel on every call, handing its end to
/// `spawn_kernel`.
pub struct MemoryConnector {
    key: Vec<u8>,
    spawn_kernel: Box<SpawnKernel>,
}

impl MemoryConnector {
    pub fn new<F>(key: &[u8], spawn_kernel: F) -> Self
    where
        F: Fn(MemoryKernel) + Send + Sync + 'static,
    {
        Self {
            key: key.to_vec(),
            spawn_kernel: Box::new(spawn_kernel),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _session_id: &str) -> Result<Transport, TransportError> {
        let (transport, kernel) = pair(Codec::new(&self.key));
        (self.spawn_kernel)(kernel);
        Ok(transport)
    }
}

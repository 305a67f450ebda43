pub mod codec;
pub mod config;
pub mod connection;
pub mod execution;
pub mod kernel;
pub mod message;
pub mod output;
pub mod queue;
pub mod sessions;
pub mod transport;

use std::time::Duration;

use thiserror::Error;

pub use crate::{
    codec::{Codec, CodecError},
    config::{ConfigError, SessionConfig},
    connection::ConnectionInfo,
    execution::{ExecuteOptions, ExecutionHandle, ExecutionSnapshot, ExecutionStatus},
    kernel::{launch, KernelSession, KernelStatus},
    message::{Content, Message},
    output::{ExecutionError, ExecutionResult, Output},
    queue::QueuePolicy,
    sessions::KernelSessions,
    transport::{Channel, Connector, Transport, TransportError},
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("kernel is dead")]
    KernelDead,
    #[error("kernel has not been started")]
    NotStarted,
    #[error("kernel terminated before replying")]
    KernelTerminated,
    #[error("no reply to {0} within {1:?}")]
    Timeout(String, Duration),
    #[error("unexpected reply {0}")]
    UnexpectedReply(String),
    #[error("kernel is not waiting for input")]
    NoPendingInput,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

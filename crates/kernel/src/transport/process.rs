use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    process::{Child, Command},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{zmq, Connector, Transport, TransportError};
use crate::{config::SessionConfig, connection::ConnectionInfo};

/// Placeholder in the kernel command line replaced by the connection file path.
pub const CONNECTION_FILE_ARG: &str = "{connection_file}";

/// Launches a kernel as a child process of this client.
pub struct LocalProcess {
    argv: Vec<String>,
    ip: String,
    runtime_dir: PathBuf,
    startup_timeout: Duration,
    kill_grace: Duration,
}

impl LocalProcess {
    /// `argv` is the kernel command line, e.g.
    /// `["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"]`.
    pub fn new(argv: Vec<String>, config: &SessionConfig) -> Self {
        Self {
            argv,
            ip: config.ip.clone(),
            runtime_dir: config.runtime_dir(),
            startup_timeout: config.startup_timeout(),
            kill_grace: config.kill_grace(),
        }
    }

    fn command(&self, connection_file: &Path) -> io::Result<Command> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty kernel command line")
        })?;
        let connection_file = connection_file.to_string_lossy();

        let mut command = Command::new(program);
        command
            .args(
                args.iter()
                    .map(|arg| arg.replace(CONNECTION_FILE_ARG, &connection_file)),
            )
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl Connector for LocalProcess {
    async fn connect(&self, session_id: &str) -> Result<Transport, TransportError> {
        let info = ConnectionInfo::allocate(&self.ip)?;
        let connection_file = info.write_to(&self.runtime_dir, session_id)?;

        let mut child = match self.command(&connection_file).and_then(|mut c| c.spawn()) {
            Ok(child) => child,
            Err(error) => {
                remove_connection_file(&connection_file);
                return Err(error.into());
            }
        };
        info!(pid = child.id(), argv = ?self.argv, "kernel process started");

        let (mut transport, wires) = Transport::wire(info.codec()?);

        let opened = tokio::select! {
            opened = timeout(self.startup_timeout, zmq::open(&info, &mut transport, wires)) => {
                opened.unwrap_or(Err(TransportError::StartupTimeout(self.startup_timeout)))
            }
            status = child.wait() => {
                warn!(?status, "kernel process exited during startup");
                Err(TransportError::KernelTerminated)
            }
        };
        if let Err(error) = opened {
            // The child is killed when dropped.
            remove_connection_file(&connection_file);
            return Err(error);
        }

        let terminator = transport.terminator();
        let closing = transport.closing();
        transport.spawn(watch_process(
            child,
            connection_file,
            self.kill_grace,
            terminator,
            closing,
        ));

        Ok(transport)
    }
}

/// Waits for the child to exit, or for the transport to close, at which point
/// the child gets `grace` to exit on its own before being killed.
async fn watch_process(
    mut child: Child,
    connection_file: PathBuf,
    grace: Duration,
    terminated: CancellationToken,
    closing: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => {
            warn!(?status, "kernel process exited");
        }
        _ = closing.cancelled() => {
            match timeout(grace, child.wait()).await {
                Ok(status) => debug!(?status, "kernel process exited after shutdown"),
                Err(_) => {
                    warn!(?grace, "kernel process still running, killing it");
                    if let Err(error) = child.kill().await {
                        warn!(%error, "could not kill kernel process");
                    }
                }
            }
        }
    }

    remove_connection_file(&connection_file);
    terminated.cancel();
}

fn remove_connection_file(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        debug!(path = %path.display(), %error, "could not remove connection file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[googletest::test]
    fn connection_file_placeholder_is_substituted() {
        let process = LocalProcess::new(
            vec![
                "python3".to_string(),
                "-m".to_string(),
                "ipykernel_launcher".to_string(),
                "-f".to_string(),
                CONNECTION_FILE_ARG.to_string(),
            ],
            &SessionConfig::default(),
        );

        let command = process.command(Path::new("/run/kernel-1.json")).unwrap();
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        expect_that!(
            args,
            elements_are![
                eq("-m"),
                eq("ipykernel_launcher"),
                eq("-f"),
                eq("/run/kernel-1.json")
            ]
        );
    }

    #[googletest::test]
    fn empty_command_line_is_rejected() {
        let process = LocalProcess::new(Vec::new(), &SessionConfig::default());

        expect_that!(process.command(Path::new("k.json")).is_err(), eq(true));
    }

    #[googletest::test]
    #[tokio::test]
    async fn kernel_that_exits_immediately_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            runtime_dir: Some(dir.path().to_path_buf()),
            startup_timeout_ms: 5_000,
            ..SessionConfig::default()
        };
        let process = LocalProcess::new(vec!["true".to_string()], &config);

        let result = process.connect("exits").await;

        expect_that!(result.is_err(), eq(true));
        expect_that!(dir.path().join("kernel-exits.json").exists(), eq(false));
    }
}

use std::{
    fs,
    net::TcpListener,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    codec::{Codec, CodecError, SIGNATURE_SCHEME},
    transport::Channel,
};

/// The contents of a kernel connection file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_transport")]
    pub transport: String,
    pub ip: String,
    pub shell_port: u16,
    pub control_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

impl ConnectionInfo {
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(std::io::Error::from)
    }

    /// Picks five free TCP ports on `ip` and a fresh signing key, for a kernel
    /// this client is about to launch.
    pub fn allocate(ip: &str) -> std::io::Result<Self> {
        // Listeners stay bound until all five ports are chosen so none repeat.
        let listeners = (0..5)
            .map(|_| TcpListener::bind((ip, 0)))
            .collect::<std::io::Result<Vec<_>>>()?;
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|addr| addr.port()))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            transport: default_transport(),
            ip: ip.to_string(),
            shell_port: ports[0],
            control_port: ports[1],
            iopub_port: ports[2],
            stdin_port: ports[3],
            hb_port: ports[4],
            key: Uuid::new_v4().to_string(),
            signature_scheme: default_signature_scheme(),
            kernel_name: None,
        })
    }

    pub fn write_to(&self, dir: impl AsRef<Path>, name: &str) -> std::io::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("kernel-{name}.json"));
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn codec(&self) -> Result<Codec, CodecError> {
        Codec::with_scheme(&self.signature_scheme, self.key.as_bytes())
    }

    pub fn endpoint(&self, channel: Channel) -> String {
        let port = match channel {
            Channel::Shell => self.shell_port,
            Channel::Control => self.control_port,
            Channel::IoPub => self.iopub_port,
            Channel::Stdin => self.stdin_port,
        };
        self.endpoint_for(port)
    }

    pub fn heartbeat_endpoint(&self) -> String {
        self.endpoint_for(self.hb_port)
    }

    fn endpoint_for(&self, port: u16) -> String {
        if self.transport == "ipc" {
            format!("ipc://{}-{}", self.ip, port)
        } else {
            format!("{}://{}:{}", self.transport, self.ip, port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    const CONNECTION_FILE: &str = r#"{
        "shell_port": 53794,
        "iopub_port": 53795,
        "stdin_port": 53796,
        "control_port": 53797,
        "hb_port": 53798,
        "ip": "127.0.0.1",
        "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
        "transport": "tcp",
        "signature_scheme": "hmac-sha256",
        "kernel_name": "python3"
    }"#;

    #[googletest::test]
    fn connection_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        fs::write(&path, CONNECTION_FILE).unwrap();

        let info = ConnectionInfo::from_file(&path).unwrap();

        expect_that!(info.shell_port, eq(53794));
        expect_that!(info.kernel_name, some(eq("python3")));
        expect_that!(info.endpoint(Channel::IoPub), eq("tcp://127.0.0.1:53795"));
        expect_that!(info.heartbeat_endpoint(), eq("tcp://127.0.0.1:53798"));
    }

    #[googletest::test]
    fn ipc_endpoints_use_the_ip_as_path_prefix() {
        let mut info: ConnectionInfo = serde_json::from_str(CONNECTION_FILE).unwrap();
        info.transport = "ipc".to_string();
        info.ip = "/tmp/kernel".to_string();

        expect_that!(info.endpoint(Channel::Shell), eq("ipc:///tmp/kernel-53794"));
    }

    #[googletest::test]
    fn allocated_ports_are_distinct_and_written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let info = ConnectionInfo::allocate("127.0.0.1").unwrap();

        let mut ports = vec![
            info.shell_port,
            info.control_port,
            info.iopub_port,
            info.stdin_port,
            info.hb_port,
        ];
        ports.sort_unstable();
        ports.dedup();
        expect_that!(ports.len(), eq(5));

        let path = info.write_to(dir.path(), "abc").unwrap();
        expect_that!(ConnectionInfo::from_file(path).unwrap(), eq(info));
    }
}

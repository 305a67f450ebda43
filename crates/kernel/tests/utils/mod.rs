#![allow(dead_code)]

use std::time::Duration;

use orrery_kernel::{
    kernel::{self, KernelSession, KernelStatus},
    ExecutionHandle, ExecutionResult, ExecutionSnapshot, ExecutionStatus, SessionConfig,
};
use tokio::time::{sleep, timeout};

use crate::mock_kernel::MockKernel;

const PATIENCE: Duration = Duration::from_secs(5);

pub fn test_config() -> SessionConfig {
    SessionConfig {
        request_timeout_ms: 2_000,
        interrupt_timeout_ms: 2_000,
        shutdown_timeout_ms: 500,
        ..SessionConfig::default()
    }
}

pub async fn launch_mock(mock: &MockKernel) -> KernelSession {
    launch_mock_with(mock, test_config()).await
}

pub async fn launch_mock_with(mock: &MockKernel, config: SessionConfig) -> KernelSession {
    let session = kernel::launch(mock.connector(), config).await.unwrap();
    wait_for_status(&session, KernelStatus::Idle).await;
    session
}

pub async fn wait_for_status(session: &KernelSession, status: KernelStatus) {
    let mut updates = session.status_updates();
    timeout(PATIENCE, updates.wait_for(|current| *current == status))
        .await
        .expect("kernel status did not change in time")
        .unwrap();
}

pub async fn finished(handle: &ExecutionHandle) -> ExecutionSnapshot {
    timeout(PATIENCE, handle.wait())
        .await
        .expect("execution did not finish in time")
}

/// Polls the handle until `ready` holds for its snapshot.
pub async fn wait_until(handle: &ExecutionHandle, ready: impl Fn(&ExecutionSnapshot) -> bool) {
    timeout(PATIENCE, async {
        while !ready(&handle.snapshot()) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("execution did not reach the expected state in time");
}

pub async fn transitions(handle: &ExecutionHandle) -> Vec<ExecutionStatus> {
    let mut updates = handle.updates();
    let mut seen = Vec::new();
    while let Some(status) = timeout(PATIENCE, updates.next()).await.unwrap() {
        seen.push(status);
    }
    seen
}

pub fn plain_texts(result: &ExecutionResult) -> Vec<String> {
    result
        .outputs
        .iter()
        .filter_map(|output| output.plain_text())
        .collect()
}

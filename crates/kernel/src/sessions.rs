use std::{collections::HashMap, sync::Arc};

use tracing::warn;

use crate::{
    config::SessionConfig,
    kernel::{self, KernelSession},
    transport::Connector,
    SessionError,
};

/// Sessions owned by one caller, keyed by session id.
#[derive(Default)]
pub struct KernelSessions {
    sessions: HashMap<String, KernelSession>,
}

impl KernelSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches a kernel and keeps its session, returning the session id.
    pub async fn launch(
        &mut self,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Result<String, SessionError> {
        let session = kernel::launch(connector, config).await?;
        Ok(self.insert(session))
    }

    pub fn insert(&mut self, session: KernelSession) -> String {
        let session_id = session.session_id().to_string();
        self.sessions.insert(session_id.clone(), session);
        session_id
    }

    pub fn get(&self, session_id: &str) -> Option<&KernelSession> {
        self.sessions.get(session_id)
    }

    /// Hands the session back to the caller; dropping it shuts the kernel down.
    pub fn remove(&mut self, session_id: &str) -> Option<KernelSession> {
        self.sessions.remove(session_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Shuts every session down concurrently and empties the set. Sessions
    /// whose kernel did not shut down cleanly are reported with their error.
    pub async fn shutdown_all(&mut self) -> Vec<(String, SessionError)> {
        let mut tasks = tokio::task::JoinSet::new();
        for (session_id, session) in self.sessions.drain() {
            tasks.spawn(async move {
                let result = session.shutdown().await;
                (session_id, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((session_id, Err(error))) => {
                    warn!(%session_id, %error, "session did not shut down cleanly");
                    failures.push((session_id, error));
                }
                Err(error) => warn!(%error, "shutdown task failed"),
            }
        }
        failures
    }
}

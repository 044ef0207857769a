// ABOUTME: Ephemeral registry of exec sessions and open log/exec/copy streams
// ABOUTME: Stream guards release their entry on drop; cancellation reaches every open stream

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AdapterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Created,
    Running,
    /// `None` when the channel broke or was cancelled before an exit code arrived.
    Exited(Option<i32>),
}

#[derive(Debug, Clone)]
pub struct ExecSession {
    pub id: String,
    pub container_id: String,
    pub command: Vec<String>,
    /// `KEY=VALUE` entries applied to the remote command.
    pub env: Vec<String>,
    pub tty: bool,
    pub state: ExecState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInfo {
    pub id: String,
    pub container_id: String,
    pub running: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, ExecSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exec specification. Session ids are random UUIDs and never
    /// collide with container ids.
    pub async fn create(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    ) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let session = ExecSession {
            id: id.clone(),
            container_id: container_id.to_string(),
            command,
            env,
            tty,
            state: ExecState::Created,
            created_at: Utc::now(),
        };
        self.sessions.write().await.insert(id.clone(), session);
        debug!("Created exec session {} for container {}", id, container_id);
        id
    }

    pub async fn get(&self, id: &str) -> Result<ExecSession> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("exec session {}", id)))
    }

    /// Move a session from Created to Running. A session starts at most once.
    pub async fn begin(&self, id: &str) -> Result<ExecSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AdapterError::NotFound(format!("exec session {}", id)))?;
        if session.state != ExecState::Created {
            return Err(AdapterError::Conflict(format!(
                "exec session {} was already started",
                id
            )));
        }
        session.state = ExecState::Running;
        Ok(session.clone())
    }

    pub async fn finish(&self, id: &str, exit_code: Option<i32>) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.state = ExecState::Exited(exit_code);
        }
    }

    pub async fn info(&self, id: &str) -> Result<ExecInfo> {
        let session = self.get(id).await?;
        let (running, exit_code) = match session.state {
            ExecState::Created => (false, None),
            ExecState::Running => (true, None),
            ExecState::Exited(code) => (false, code),
        };
        Ok(ExecInfo {
            id: session.id,
            container_id: session.container_id,
            running,
            exit_code,
        })
    }

    /// Drop every session that targets `container_id`.
    pub async fn forget_container(&self, container_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.container_id != container_id);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Logs,
    Exec,
    CopyArchive,
}

#[derive(Debug)]
struct StreamEntry {
    container_id: String,
    kind: StreamKind,
    token: CancellationToken,
    opened_at: DateTime<Utc>,
}

type StreamMap = Arc<Mutex<HashMap<u64, StreamEntry>>>;

/// Open streaming channels keyed by a process-local stream id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: StreamMap,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new stream. Its token is a child of `caller`, so either the
    /// caller disconnecting or [`StreamRegistry::cancel_container`] ends it.
    pub fn open(
        &self,
        container_id: &str,
        kind: StreamKind,
        caller: &CancellationToken,
    ) -> StreamGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = caller.child_token();
        lock(&self.streams).insert(
            id,
            StreamEntry {
                container_id: container_id.to_string(),
                kind,
                token: token.clone(),
                opened_at: Utc::now(),
            },
        );
        debug!(
            "Opened {:?} stream {} for container {}",
            kind, id, container_id
        );
        StreamGuard {
            id,
            token,
            streams: self.streams.clone(),
        }
    }

    /// Cancel every open stream for `container_id`. Returns how many were cancelled.
    pub fn cancel_container(&self, container_id: &str) -> usize {
        let streams = lock(&self.streams);
        let mut cancelled = 0;
        for (id, entry) in streams.iter() {
            if entry.container_id == container_id {
                debug!(
                    "Cancelling {:?} stream {} (open since {})",
                    entry.kind, id, entry.opened_at
                );
                entry.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn active(&self) -> usize {
        lock(&self.streams).len()
    }

    pub fn active_for(&self, container_id: &str) -> usize {
        lock(&self.streams)
            .values()
            .filter(|e| e.container_id == container_id)
            .count()
    }
}

fn lock(streams: &StreamMap) -> std::sync::MutexGuard<'_, HashMap<u64, StreamEntry>> {
    streams
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a stream registered for as long as it lives.
#[derive(Debug)]
pub struct StreamGuard {
    id: u64,
    token: CancellationToken,
    streams: StreamMap,
}

impl StreamGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if lock(&self.streams).remove(&self.id).is_some() {
            debug!("Released stream {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let id = registry
            .create("c1", vec!["echo".into(), "hi".into()], vec![], false)
            .await;
        assert_eq!(id.len(), 32);

        let info = registry.info(&id).await.unwrap();
        assert!(!info.running);
        assert_eq!(info.exit_code, None);

        registry.begin(&id).await.unwrap();
        assert!(registry.info(&id).await.unwrap().running);

        let again = registry.begin(&id).await.unwrap_err();
        assert!(matches!(again, AdapterError::Conflict(_)));

        registry.finish(&id, Some(0)).await;
        let info = registry.info(&id).await.unwrap();
        assert!(!info.running);
        assert_eq!(info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.info("nope").await.unwrap_err(),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            registry.begin("nope").await.unwrap_err(),
            AdapterError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_forget_container() {
        let registry = SessionRegistry::new();
        registry.create("c1", vec!["a".into()], vec![], false).await;
        registry.create("c1", vec!["b".into()], vec![], true).await;
        registry.create("c2", vec!["c".into()], vec![], false).await;

        assert_eq!(registry.forget_container("c1").await, 2);
        assert_eq!(registry.len().await, 1);
    }

    #[test]
    fn test_guard_releases_entry_on_drop() {
        let registry = StreamRegistry::new();
        let caller = CancellationToken::new();

        let guard = registry.open("c1", StreamKind::Logs, &caller);
        assert_eq!(registry.active(), 1);
        drop(guard);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_caller_cancellation_reaches_stream() {
        let registry = StreamRegistry::new();
        let caller = CancellationToken::new();
        let guard = registry.open("c1", StreamKind::Exec, &caller);

        caller.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn test_cancel_container_only_hits_its_streams() {
        let registry = StreamRegistry::new();
        let caller = CancellationToken::new();
        let a = registry.open("c1", StreamKind::Logs, &caller);
        let b = registry.open("c1", StreamKind::CopyArchive, &caller);
        let c = registry.open("c2", StreamKind::Logs, &caller);

        assert_eq!(registry.cancel_container("c1"), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(!c.token().is_cancelled());
        assert!(!caller.is_cancelled());
        assert_eq!(registry.active_for("c1"), 2);
    }
}

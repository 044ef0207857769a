// ABOUTME: Cluster client capability injected into the adapter
// ABOUTME: Pod, port exposure, exec channel and log stream operations plus their value types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use kubedock_config::ImagePullPolicy;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ClusterError;

pub mod kubernetes;

pub use kubernetes::KubeClient;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Everything needed to create the pod backing one container.
#[derive(Debug, Clone, PartialEq)]
pub struct PodTemplate {
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub pull_policy: ImagePullPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A point-in-time view of a pod as the cluster reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct PodObservation {
    pub name: String,
    pub container_id: Option<String>,
    pub phase: PodPhase,
    pub ready: bool,
    /// Deletion has been requested and the pod is shutting down.
    pub terminating: bool,
    /// Why the main container is waiting, e.g. `ImagePullBackOff`.
    pub waiting_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl PodObservation {
    pub fn new(name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            container_id: None,
            phase,
            ready: false,
            terminating: false,
            waiting_reason: None,
            exit_code: None,
            message: None,
            created_at: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready && !self.terminating
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub pod: String,
    pub command: Vec<String>,
    pub stdin: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: Option<u32>,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type LogStream = BoxStream<'static, Result<String>>;

/// Tears down a remote-execution channel. Only the first call has an effect.
pub struct AbortHandle {
    abort: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl AbortHandle {
    pub fn new<F>(abort: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            abort: Mutex::new(Some(Box::new(abort))),
        }
    }

    pub fn abort(&self) {
        let abort = self
            .abort
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(abort) = abort {
            abort();
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

/// An open remote-execution channel into a pod.
pub struct ExecChannel {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    /// Resolves to the remote exit code once the command finishes.
    pub exit: BoxFuture<'static, Result<i32>>,
    pub abort: AbortHandle,
}

/// Control plane operations the adapter relies on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_pod(&self, template: &PodTemplate) -> Result<PodObservation>;

    /// Fails with [`ClusterError::NotFound`] when the pod does not exist.
    async fn get_pod(&self, name: &str) -> Result<PodObservation>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Pods created by kubedock, whether or not a container record still exists.
    async fn list_pods(&self) -> Result<Vec<PodObservation>>;

    /// Make `ports` reachable from outside the cluster. Calling this again for
    /// the same pod keeps previously assigned external ports.
    /// Returns container port -> external port.
    async fn expose_ports(&self, pod: &str, ports: &[u16]) -> Result<BTreeMap<u16, u16>>;

    async fn remove_exposure(&self, pod: &str) -> Result<()>;

    async fn exec(&self, request: &ExecRequest) -> Result<ExecChannel>;

    async fn logs(&self, pod: &str, options: &LogOptions) -> Result<LogStream>;
}

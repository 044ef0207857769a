// ABOUTME: Runs kubedock containers as Kubernetes pods and bridges their I/O streams
// ABOUTME: Adapter, cluster client capability, status mapping and exec/log/archive sessions

pub mod adapter;
pub mod client;
pub mod error;
pub mod locks;
pub mod pod;
pub mod sessions;
pub mod shadow;
pub mod status;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapter::{AdapterConfig, AdapterLogStream, ClusterAdapter, ExecIo, ReapReport};
pub use client::{
    AbortHandle, ClusterClient, ExecChannel, ExecRequest, KubeClient, LogOptions, LogStream,
    PodObservation, PodPhase, PodTemplate,
};
pub use error::{AdapterError, ClusterError, ErrorKind, Result};
pub use sessions::{ExecInfo, ExecState, StreamKind};
pub use shadow::ShadowState;
pub use status::{derive_state, ContainerState, Health, Status};

// ABOUTME: Normalized container status derived from observed pod state
// ABOUTME: Absent pods and terminal phases map to non-running states, never to errors

use kubedock_storage::ContainerPhase;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::client::{PodObservation, PodPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Running,
    Exited,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
    None,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    pub status: Status,
    pub running: bool,
    pub health: Health,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl ContainerState {
    /// The state as the flat key/value map handed to protocol responses.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("Status".into(), json!(self.status.as_str()));
        map.insert("Running".into(), json!(self.running));
        map.insert("Health".into(), json!(self.health.as_str()));
        map.insert(
            "Message".into(),
            json!(self.message.clone().unwrap_or_default()),
        );
        if let Some(code) = self.exit_code {
            map.insert("ExitCode".into(), json!(code));
        }
        map
    }
}

/// Map an observed pod (or its absence) onto a container state.
///
/// * no pod: `created` if the record was never started, otherwise `exited`
/// * pending, or running but not ready: `created`, health `starting`
/// * running and ready: `running`
/// * succeeded, failed or unknown: `exited` with the diagnostic text
pub fn derive_state(observed: Option<&PodObservation>, phase: ContainerPhase) -> ContainerState {
    let Some(pod) = observed else {
        let status = if phase == ContainerPhase::Created {
            Status::Created
        } else {
            Status::Exited
        };
        return ContainerState {
            status,
            running: false,
            health: Health::None,
            exit_code: None,
            message: None,
        };
    };

    match pod.phase {
        PodPhase::Running if pod.ready && !pod.terminating => ContainerState {
            status: Status::Running,
            running: true,
            health: Health::Healthy,
            exit_code: None,
            message: None,
        },
        PodPhase::Pending | PodPhase::Running => ContainerState {
            status: Status::Created,
            running: false,
            health: Health::Starting,
            exit_code: None,
            message: pod.waiting_reason.clone().or_else(|| pod.message.clone()),
        },
        PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown => ContainerState {
            status: Status::Exited,
            running: false,
            health: if pod.phase == PodPhase::Succeeded {
                Health::None
            } else {
                Health::Unhealthy
            },
            exit_code: pod.exit_code,
            message: pod.message.clone(),
        },
    }
}

// ABOUTME: Derives pod names, labels and pod templates from container records
// ABOUTME: Also builds the remote command lines used for exec and archive extraction

use kubedock_config::ImagePullPolicy;
use kubedock_storage::Container;
use std::collections::BTreeMap;

use crate::client::PodTemplate;

pub const MANAGED_LABEL: &str = "kubedock.managed";
pub const ID_LABEL: &str = "kubedock.id";
/// Selector key tying a NodePort service to its pod.
pub const POD_LABEL: &str = "kubedock.pod";
pub const NAME_ANNOTATION: &str = "kubedock.name";
pub const LABEL_ANNOTATION_PREFIX: &str = "kubedock.label/";

/// Name of the single container inside every pod.
pub const MAIN_CONTAINER: &str = "main";

const POD_NAME_PREFIX: &str = "kubedock-";
const POD_ID_CHARS: usize = 12;

pub fn pod_name(container_id: &str) -> String {
    let end = container_id.len().min(POD_ID_CHARS);
    format!("{}{}", POD_NAME_PREFIX, &container_id[..end])
}

/// Label selector matching every pod kubedock created.
pub fn managed_selector() -> String {
    format!("{}=true", MANAGED_LABEL)
}

pub fn pod_labels(container_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (ID_LABEL.to_string(), container_id.to_string()),
        (POD_LABEL.to_string(), pod_name(container_id)),
    ])
}

pub fn pod_template(container: &Container, pull_policy: ImagePullPolicy) -> PodTemplate {
    // Client labels carry arbitrary values, so they travel as annotations.
    let mut annotations: BTreeMap<String, String> = container
        .labels
        .iter()
        .filter(|(k, _)| is_annotation_name(k))
        .map(|(k, v)| (format!("{}{}", LABEL_ANNOTATION_PREFIX, k), v.clone()))
        .collect();
    if !container.name.is_empty() {
        annotations.insert(NAME_ANNOTATION.to_string(), container.name.clone());
    }

    PodTemplate {
        name: pod_name(&container.id),
        container_id: container.id.clone(),
        image: container.image.clone(),
        args: container.command.clone(),
        env: container.env.clone(),
        ports: container.exposed_ports.iter().copied().collect(),
        labels: pod_labels(&container.id),
        annotations,
        pull_policy,
    }
}

/// Kubernetes qualified-name rules for the part after the annotation prefix.
fn is_annotation_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Prefix `command` with `env KEY=VALUE ...` when there is anything to set.
pub fn exec_command(command: &[String], env: &[String]) -> Vec<String> {
    if env.is_empty() {
        return command.to_vec();
    }
    let mut full = Vec::with_capacity(command.len() + env.len() + 1);
    full.push("env".to_string());
    full.extend(env.iter().cloned());
    full.extend(command.iter().cloned());
    full
}

pub fn extract_command(destination: &str) -> Vec<String> {
    ["tar", "-x", "-f", "-", "-C", destination]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

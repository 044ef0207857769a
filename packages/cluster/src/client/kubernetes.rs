// ABOUTME: ClusterClient implementation backed by the Kubernetes API via kube-rs
// ABOUTME: Pods and NodePort services in one namespace, exec over websockets, streaming logs

use async_trait::async_trait;
use futures::{AsyncBufReadExt, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, EnvVar, Pod, PodSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use super::{
    AbortHandle, BoxedReader, BoxedWriter, ClusterClient, ExecChannel, ExecRequest, LogOptions,
    LogStream, PodObservation, PodPhase, PodTemplate, Result,
};
use crate::error::ClusterError;
use crate::pod::{managed_selector, ID_LABEL, MAIN_CONTAINER, MANAGED_LABEL, POD_LABEL};

const LOG_BUFFER: usize = 256;

pub struct KubeClient {
    pods: Api<Pod>,
    services: Api<Service>,
    namespace: String,
}

impl KubeClient {
    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        info!("Connected to Kubernetes, namespace '{}'", namespace);
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn to_pod(template: &PodTemplate) -> Pod {
        let env: Vec<EnvVar> = template
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        let ports: Vec<ContainerPort> = template
            .ports
            .iter()
            .map(|port| ContainerPort {
                container_port: i32::from(*port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(template.name.clone()),
                labels: Some(template.labels.clone()),
                annotations: Some(template.annotations.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![PodContainer {
                    name: MAIN_CONTAINER.to_string(),
                    image: Some(template.image.clone()),
                    image_pull_policy: Some(template.pull_policy.to_string()),
                    args: (!template.args.is_empty()).then(|| template.args.clone()),
                    env: (!env.is_empty()).then_some(env),
                    ports: (!ports.is_empty()).then_some(ports),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn to_service(pod: &str, ports: &[u16]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(pod.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(BTreeMap::from([(POD_LABEL.to_string(), pod.to_string())])),
                ports: Some(ports.iter().map(|p| service_port(*p)).collect()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn service_port(port: u16) -> ServicePort {
    ServicePort {
        name: Some(format!("tcp-{}", port)),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Container port -> node port for every port the service has assigned.
fn node_ports(service: &Service) -> BTreeMap<u16, u16> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = u16::try_from(p.port).ok()?;
                    let node_port = u16::try_from(p.node_port?).ok()?;
                    Some((port, node_port))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn observe_pod(pod: &Pod) -> PodObservation {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let status = pod.status.as_ref();
    let phase = PodPhase::parse(status.and_then(|s| s.phase.as_deref()));
    let mut observed = PodObservation::new(name, phase);

    observed.container_id = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ID_LABEL))
        .cloned();
    observed.terminating = pod.metadata.deletion_timestamp.is_some();
    observed.created_at = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
    observed.ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    let main = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == MAIN_CONTAINER));
    let state = main.and_then(|c| c.state.as_ref());

    if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
        observed.waiting_reason = waiting.reason.clone();
        observed.message = waiting.message.clone();
    }
    if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        observed.exit_code = Some(terminated.exit_code);
        observed.message = terminated
            .message
            .clone()
            .or_else(|| terminated.reason.clone());
    }
    if observed.message.is_none() {
        observed.message = status.and_then(|s| s.message.clone());
    }
    observed
}

/// Exit code carried by the status frame that ends an exec session.
fn exit_code(status: Option<Status>) -> Result<i32> {
    let status =
        status.ok_or_else(|| ClusterError::Stream("exec ended without a status".to_string()))?;
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse::<i32>().ok());

    match code {
        Some(code) => Ok(code),
        None => Err(ClusterError::Stream(
            status
                .message
                .unwrap_or_else(|| "exec failed without an exit code".to_string()),
        )),
    }
}

pub(crate) fn map_kube_error(error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::NotFound(response.message),
            409 => ClusterError::AlreadyExists(response.message),
            401 | 403 => ClusterError::Forbidden(response.message),
            500..=599 => ClusterError::Unavailable(response.message),
            _ => ClusterError::Api(format!("{} ({})", response.message, response.code)),
        },
        kube::Error::HyperError(e) => ClusterError::Unavailable(e.to_string()),
        kube::Error::Service(e) => ClusterError::Unavailable(e.to_string()),
        other => ClusterError::Api(other.to_string()),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create_pod(&self, template: &PodTemplate) -> Result<PodObservation> {
        let pod = Self::to_pod(template);
        let created = self
            .pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_error)?;
        debug!("Submitted pod {} in {}", template.name, self.namespace);
        Ok(observe_pod(&created))
    }

    async fn get_pod(&self, name: &str) -> Result<PodObservation> {
        let pod = self.pods.get(name).await.map_err(map_kube_error)?;
        Ok(observe_pod(&pod))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.pods
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodObservation>> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(&managed_selector()))
            .await
            .map_err(map_kube_error)?;
        Ok(pods.items.iter().map(observe_pod).collect())
    }

    async fn expose_ports(&self, pod: &str, ports: &[u16]) -> Result<BTreeMap<u16, u16>> {
        if ports.is_empty() {
            return Ok(BTreeMap::new());
        }

        let service = Self::to_service(pod, ports);
        let service = match self.services.create(&PostParams::default(), &service).await {
            Ok(created) => created,
            Err(e) => match map_kube_error(e) {
                ClusterError::AlreadyExists(_) => {
                    let mut existing = self.services.get(pod).await.map_err(map_kube_error)?;
                    let assigned = node_ports(&existing);
                    let missing: Vec<u16> = ports
                        .iter()
                        .copied()
                        .filter(|p| !assigned.contains_key(p))
                        .collect();
                    if missing.is_empty() {
                        existing
                    } else {
                        debug!("Adding ports {:?} to service {}", missing, pod);
                        if let Some(spec) = existing.spec.as_mut() {
                            spec.ports
                                .get_or_insert_with(Vec::new)
                                .extend(missing.into_iter().map(service_port));
                        }
                        self.services
                            .replace(pod, &PostParams::default(), &existing)
                            .await
                            .map_err(map_kube_error)?
                    }
                }
                other => return Err(other),
            },
        };

        let assigned = node_ports(&service);
        for port in ports {
            if !assigned.contains_key(port) {
                return Err(ClusterError::Api(format!(
                    "service {} has no node port for {}",
                    pod, port
                )));
            }
        }
        Ok(assigned)
    }

    async fn remove_exposure(&self, pod: &str) -> Result<()> {
        self.services
            .delete(pod, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecChannel> {
        let params = AttachParams::default()
            .container(MAIN_CONTAINER)
            .stdin(request.stdin)
            .stdout(true)
            .stderr(!request.tty)
            .tty(request.tty);

        let mut process = self
            .pods
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(map_kube_error)?;

        let stdin = process.stdin().map(|w| Box::new(w) as BoxedWriter);
        let stdout = process.stdout().map(|r| Box::new(r) as BoxedReader);
        let stderr = process.stderr().map(|r| Box::new(r) as BoxedReader);
        let status = process
            .take_status()
            .ok_or_else(|| ClusterError::Stream("exec status already taken".to_string()))?;

        let pod = request.pod.clone();
        let exit = status.map(exit_code).boxed();
        let abort = AbortHandle::new(move || {
            debug!("Aborting exec channel into {}", pod);
            process.abort();
        });

        Ok(ExecChannel {
            stdin,
            stdout,
            stderr,
            exit,
            abort,
        })
    }

    async fn logs(&self, pod: &str, options: &LogOptions) -> Result<LogStream> {
        // Surface a missing pod before handing out a stream.
        self.pods.get(pod).await.map_err(map_kube_error)?;

        let params = LogParams {
            container: Some(MAIN_CONTAINER.to_string()),
            follow: options.follow,
            tail_lines: options.tail_lines.map(i64::from),
            ..Default::default()
        };
        let api = self.pods.clone();
        let name = pod.to_string();
        let (tx, rx) = mpsc::channel(LOG_BUFFER);

        tokio::spawn(async move {
            let reader = match api.log_stream(&name, &params).await {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = tx.send(Err(map_kube_error(e))).await;
                    return;
                }
            };
            let mut lines = Box::pin(reader.lines());
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = lines.try_next() => next,
                };
                match next {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Error streaming logs for {}: {}", name, e);
                        let _ = tx.send(Err(ClusterError::Stream(e.to_string()))).await;
                        break;
                    }
                }
            }
            debug!("Log stream for {} closed", name);
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
    use kubedock_config::ImagePullPolicy;
    use pretty_assertions::assert_eq;

    fn template() -> PodTemplate {
        PodTemplate {
            name: "kubedock-abc".to_string(),
            container_id: "abc".to_string(),
            image: "redis:7".to_string(),
            args: vec!["--port".to_string(), "6380".to_string()],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            ports: vec![6380],
            labels: crate::pod::pod_labels("abc"),
            annotations: BTreeMap::new(),
            pull_policy: ImagePullPolicy::IfNotPresent,
        }
    }

    #[test]
    fn test_pod_spec_from_template() {
        let pod = KubeClient::to_pod(&template());
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let main = &spec.containers[0];
        assert_eq!(main.name, MAIN_CONTAINER);
        assert_eq!(main.image.as_deref(), Some("redis:7"));
        assert_eq!(main.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(main.args.as_ref().unwrap(), &vec!["--port", "6380"]);
        assert!(main.command.is_none());
        assert_eq!(main.ports.as_ref().unwrap()[0].container_port, 6380);
        assert_eq!(main.env.as_ref().unwrap()[0].name, "A");
    }

    #[test]
    fn test_empty_command_keeps_image_defaults() {
        let mut template = template();
        template.args.clear();
        template.env.clear();
        template.ports.clear();
        let pod = KubeClient::to_pod(&template);
        let main = &pod.spec.unwrap().containers[0];
        assert!(main.args.is_none());
        assert!(main.env.is_none());
        assert!(main.ports.is_none());
    }

    #[test]
    fn test_observe_running_ready_pod() {
        let mut pod = KubeClient::to_pod(&template());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let observed = observe_pod(&pod);
        assert_eq!(observed.phase, PodPhase::Running);
        assert!(observed.is_ready());
        assert_eq!(observed.container_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_observe_waiting_and_terminated() {
        let mut pod = KubeClient::to_pod(&template());
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: MAIN_CONTAINER.to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".to_string()),
                        message: Some("pull access denied".to_string()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let observed = observe_pod(&pod);
        assert!(!observed.is_ready());
        assert_eq!(observed.waiting_reason.as_deref(), Some("ImagePullBackOff"));

        pod.status = Some(PodStatus {
            phase: Some("Failed".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: MAIN_CONTAINER.to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 3,
                        reason: Some("Error".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let observed = observe_pod(&pod);
        assert_eq!(observed.phase, PodPhase::Failed);
        assert_eq!(observed.exit_code, Some(3));
        assert_eq!(observed.message.as_deref(), Some("Error"));
    }

    #[test]
    fn test_exit_code_from_status() {
        let success = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(success)).unwrap(), 0);

        let failure = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("42".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(failure)).unwrap(), 42);

        assert!(matches!(exit_code(None), Err(ClusterError::Stream(_))));
    }

    #[test]
    fn test_node_ports() {
        let mut service = KubeClient::to_service("kubedock-abc", &[80, 443]);
        assert_eq!(node_ports(&service), BTreeMap::new());

        for (port, node_port) in service
            .spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .iter_mut()
            .zip([30080, 30443])
        {
            port.node_port = Some(node_port);
        }
        assert_eq!(
            node_ports(&service),
            BTreeMap::from([(80, 30080), (443, 30443)])
        );
    }
}

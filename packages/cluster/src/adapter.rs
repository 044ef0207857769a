// ABOUTME: Cluster adapter translating container lifecycle verbs into pod operations
// ABOUTME: Start/delete with bounded waits, status mapping, exec, logs, archive copy and orphan reaping

use chrono::Utc;
use futures::stream::{BoxStream, Stream, StreamExt};
use kubedock_config::{Config, ImagePullPolicy};
use kubedock_storage::{Container, ContainerPhase, EntityStore};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{
    AbortHandle, BoxedReader, ClusterClient, ExecChannel, ExecRequest, LogOptions, LogStream,
    PodObservation,
};
use crate::error::{AdapterError, ClusterError, Result};
use crate::locks::ContainerLocks;
use crate::pod::{exec_command, extract_command, pod_name, pod_template, ID_LABEL};
use crate::sessions::{ExecInfo, SessionRegistry, StreamGuard, StreamKind, StreamRegistry};
use crate::shadow::{ShadowState, ShadowTable};
use crate::status::{derive_state, ContainerState};

/// Waiting reasons after which a pod will not become ready on its own.
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
    "CreateContainerConfigError",
    "CreateContainerError",
];

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub ready_timeout: Duration,
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
    pub image_pull_policy: ImagePullPolicy,
    pub reaper_max_age: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for AdapterConfig {
    fn from(config: &Config) -> Self {
        Self {
            ready_timeout: config.ready_timeout,
            delete_timeout: config.delete_timeout,
            poll_interval: config.poll_interval,
            image_pull_policy: config.image_pull_policy,
            reaper_max_age: config.reaper_max_age,
        }
    }
}

/// Caller-side ends of an exec session.
pub struct ExecIo {
    /// Forwarded to the remote stdin, which is closed once this reaches EOF.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    /// Ignored for tty sessions, where the remote side merges both streams.
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub found: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub type AdapterLogStream = BoxStream<'static, Result<String>>;

pub struct ClusterAdapter {
    client: Arc<dyn ClusterClient>,
    config: AdapterConfig,
    shadow: ShadowTable,
    locks: ContainerLocks,
    sessions: SessionRegistry,
    streams: StreamRegistry,
}

impl ClusterAdapter {
    pub fn new(client: Arc<dyn ClusterClient>, config: AdapterConfig) -> Self {
        Self {
            client,
            config,
            shadow: ShadowTable::new(),
            locks: ContainerLocks::new(),
            sessions: SessionRegistry::new(),
            streams: StreamRegistry::new(),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn shadow(&self) -> &ShadowTable {
        &self.shadow
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Current pod for `container`, or `None` when the cluster has none.
    async fn observe(&self, container: &Container) -> Result<Option<PodObservation>> {
        let name = pod_name(&container.id);
        match self.client.get_pod(&name).await {
            Ok(pod) => {
                self.shadow.observe(&container.id, &name, Some(&pod));
                Ok(Some(pod))
            }
            Err(ClusterError::NotFound(_)) => {
                self.shadow.observe(&container.id, &name, None);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the container's pod is running and ready. A missing pod is a
    /// plain `false`, not an error.
    pub async fn is_running(&self, container: &Container) -> Result<bool> {
        Ok(self
            .observe(container)
            .await?
            .map(|pod| pod.is_ready())
            .unwrap_or(false))
    }

    /// Enact the container as a pod and allocate its external ports.
    ///
    /// Safe to call repeatedly: a running pod is left alone and only missing
    /// port mappings are completed. On success the container record carries
    /// the mappings and the Running phase; persisting it is up to the caller.
    pub async fn start(&self, container: &mut Container) -> Result<()> {
        if container.phase == ContainerPhase::Deleted {
            return Err(AdapterError::Conflict(format!(
                "container {} is deleted",
                container.id
            )));
        }

        let _guard = self.locks.acquire(&container.id).await;
        let name = pod_name(&container.id);

        let pod = match self.observe(container).await? {
            Some(pod) if pod.is_ready() => {
                if container.unmapped_ports().is_empty() {
                    warn!(
                        "Container {} is already running as pod {}",
                        container.id, name
                    );
                    if container.phase != ContainerPhase::Running {
                        container.mark_running(&BTreeMap::new());
                    }
                    return Ok(());
                }
                info!(
                    "Pod {} is running, completing port mappings for container {}",
                    name, container.id
                );
                pod
            }
            Some(pod) if pod.terminating || pod.phase.is_terminal() => {
                info!(
                    "Replacing {} pod {} for container {}",
                    if pod.terminating { "terminating" } else { "exited" },
                    name,
                    container.id
                );
                self.remove_pod(&container.id, &name).await?;
                self.create_pod(container).await?;
                self.wait_ready(&container.id, &name).await?
            }
            Some(_) => {
                debug!("Pod {} exists but is not ready yet", name);
                self.wait_ready(&container.id, &name).await?
            }
            None => {
                self.create_pod(container).await?;
                self.wait_ready(&container.id, &name).await?
            }
        };

        let allocated = self.allocate_ports(container, &pod).await?;
        container.mark_running(&allocated);
        info!(
            "Started container {} as pod {} (ports: {:?})",
            container.id, name, container.mapped_ports
        );
        Ok(())
    }

    async fn create_pod(&self, container: &Container) -> Result<()> {
        let template = pod_template(container, self.config.image_pull_policy);
        match self.client.create_pod(&template).await {
            Ok(_) => {
                info!(
                    "Created pod {} for container {} ({})",
                    template.name, container.id, container.image
                );
            }
            Err(ClusterError::AlreadyExists(_)) => {
                debug!("Pod {} already exists, reusing it", template.name);
            }
            Err(e) => return Err(e.into()),
        }
        self.shadow.created(&container.id, &template.name);
        Ok(())
    }

    /// Poll until the pod is ready or has already run to completion.
    async fn wait_ready(&self, container_id: &str, name: &str) -> Result<PodObservation> {
        let poll = async {
            loop {
                let pod = match self.client.get_pod(name).await {
                    Ok(pod) => pod,
                    Err(ClusterError::NotFound(_)) => {
                        self.shadow.observe(container_id, name, None);
                        return Err(AdapterError::NotFound(format!(
                            "pod {} disappeared while starting",
                            name
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                self.shadow.observe(container_id, name, Some(&pod));

                if pod.is_ready() || pod.phase.is_terminal() {
                    return Ok(pod);
                }
                if let Some(reason) = pod.waiting_reason.as_deref() {
                    if FATAL_WAITING_REASONS.contains(&reason) {
                        let detail = pod.message.as_deref().unwrap_or(reason);
                        return Err(AdapterError::StartFailed(format!(
                            "pod {}: {}",
                            name, detail
                        )));
                    }
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.ready_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                what: format!("pod {} to become ready", name),
                seconds: self.config.ready_timeout.as_secs(),
            }),
        }
    }

    /// External port -> container port for every exposed port not mapped yet.
    async fn allocate_ports(
        &self,
        container: &Container,
        pod: &PodObservation,
    ) -> Result<BTreeMap<u16, u16>> {
        let missing = container.unmapped_ports();
        if missing.is_empty() {
            return Ok(BTreeMap::new());
        }

        let ports: Vec<u16> = container.exposed_ports.iter().copied().collect();
        let exposed = self
            .client
            .expose_ports(&pod.name, &ports)
            .await
            .map_err(|e| {
                warn!(
                    "Pod {} is up but port allocation for container {} failed: {}",
                    pod.name, container.id, e
                );
                AdapterError::from(e)
            })?;

        let mut allocated = BTreeMap::new();
        for port in missing {
            match exposed.get(&port) {
                Some(external) => {
                    allocated.insert(*external, port);
                }
                None => {
                    return Err(AdapterError::Cluster(ClusterError::Api(format!(
                        "no external port assigned for {}/{}",
                        pod.name, port
                    ))))
                }
            }
        }
        Ok(allocated)
    }

    pub async fn get_status(&self, container: &Container) -> Result<ContainerState> {
        let observed = self.observe(container).await?;
        Ok(derive_state(observed.as_ref(), container.phase))
    }

    /// Remove the pod and its port exposure, waiting until the cluster
    /// confirms the pod is gone. A container without a pod is a no-op.
    /// Open log, exec and copy streams for the container are cancelled.
    pub async fn delete(&self, container: &Container) -> Result<()> {
        let guard = self.locks.acquire(&container.id).await;
        let name = pod_name(&container.id);

        let cancelled = self.streams.cancel_container(&container.id);
        if cancelled > 0 {
            debug!(
                "Cancelled {} open streams for container {}",
                cancelled, container.id
            );
        }
        self.sessions.forget_container(&container.id).await;

        self.remove_pod(&container.id, &name).await?;
        match self.client.remove_exposure(&name).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.shadow.forget(&container.id);
        drop(guard);
        self.locks.release(&container.id);
        Ok(())
    }

    /// Delete the pod and wait for it to disappear. The NodePort service is
    /// left alone so a replacement pod keeps the same external ports.
    async fn remove_pod(&self, container_id: &str, name: &str) -> Result<()> {
        self.shadow.terminating(container_id, name);

        match self.client.delete_pod(name).await {
            Ok(()) => info!("Deleting pod {} for container {}", name, container_id),
            Err(ClusterError::NotFound(_)) => {
                debug!("Pod {} for container {} was already gone", name, container_id)
            }
            Err(e) => return Err(e.into()),
        }

        let wait = async {
            loop {
                let observed = match self.client.get_pod(name).await {
                    Ok(pod) => Some(pod),
                    Err(ClusterError::NotFound(_)) => None,
                    Err(e) => return Err(AdapterError::from(e)),
                };
                if self.shadow.observe(container_id, name, observed.as_ref()) == ShadowState::Gone
                    && observed.is_none()
                {
                    return Ok(());
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.delete_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                what: format!("pod {} to be removed", name),
                seconds: self.config.delete_timeout.as_secs(),
            }),
        }
    }

    /// Unpack a tar stream at `destination` inside the running pod.
    pub async fn copy_archive<R>(
        &self,
        container: &Container,
        mut archive: R,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let name = self.require_ready(container, "copy an archive into").await?;
        let guard = self
            .streams
            .open(&container.id, StreamKind::CopyArchive, cancel);

        let channel = self
            .client
            .exec(&ExecRequest {
                pod: name.clone(),
                command: extract_command(destination),
                stdin: true,
                tty: false,
            })
            .await?;
        let ExecChannel {
            stdin,
            stdout,
            stderr,
            exit,
            abort,
        } = channel;
        let abort = AbortOnDrop::new(abort);
        let mut stdin = stdin.ok_or_else(|| {
            AdapterError::Cluster(ClusterError::Stream(format!(
                "exec channel into {} has no stdin",
                name
            )))
        })?;

        let transfer = async {
            let feed = async move {
                tokio::io::copy(&mut archive, &mut stdin).await?;
                stdin.shutdown().await
            };
            let output = async {
                let (_, errors) = tokio::join!(read_all(stdout), read_all(stderr));
                (exit.await, errors)
            };
            let (fed, (code, errors)) = feed_until_done(feed, output).await;
            Ok::<_, AdapterError>((code?, fed, errors))
        };

        let outcome = tokio::select! {
            _ = guard.token().cancelled() => {
                abort.abort();
                debug!("Archive copy into {} cancelled", name);
                return Err(AdapterError::Cancelled(format!("archive copy into {}", name)));
            }
            outcome = transfer => outcome,
        };
        abort.disarm();

        let (code, fed, errors) = outcome?;
        if code != 0 {
            let stderr = String::from_utf8_lossy(&errors).trim().to_string();
            return Err(AdapterError::ArchiveFailed(format!(
                "tar exited with {} in {}: {}",
                code, name, stderr
            )));
        }
        match fed {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!("Archive stream into {} failed: {}", name, e);
                return Err(e.into());
            }
            None => debug!("tar in {} exited before the whole archive was sent", name),
        }
        debug!("Copied archive into {}:{}", name, destination);
        Ok(())
    }

    async fn require_ready(&self, container: &Container, verb: &str) -> Result<String> {
        match self.observe(container).await? {
            Some(pod) if pod.is_ready() => Ok(pod.name),
            _ => Err(AdapterError::Conflict(format!(
                "cannot {} container {}: it is not running",
                verb, container.id
            ))),
        }
    }

    /// Register a command to run inside the container's pod.
    pub async fn exec_create(
        &self,
        container: &Container,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    ) -> Result<String> {
        if command.is_empty() {
            return Err(AdapterError::Conflict("exec command is empty".to_string()));
        }
        Ok(self.sessions.create(&container.id, command, env, tty).await)
    }

    /// Attach to the session's command, pumping I/O until it exits or the
    /// caller cancels. Returns the exit code, which is also kept for
    /// [`ClusterAdapter::exec_info`].
    pub async fn exec_start(
        &self,
        session_id: &str,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let session = self.sessions.get(session_id).await?;
        let name = pod_name(&session.container_id);
        match self.client.get_pod(&name).await {
            Ok(pod) if pod.is_ready() => {}
            Ok(_) | Err(ClusterError::NotFound(_)) => {
                return Err(AdapterError::Conflict(format!(
                    "cannot exec in container {}: it is not running",
                    session.container_id
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let session = self.sessions.begin(session_id).await?;
        let guard = self
            .streams
            .open(&session.container_id, StreamKind::Exec, cancel);

        let request = ExecRequest {
            pod: name.clone(),
            command: exec_command(&session.command, &session.env),
            stdin: io.stdin.is_some(),
            tty: session.tty,
        };
        let channel = match self.client.exec(&request).await {
            Ok(channel) => channel,
            Err(e) => {
                self.sessions.finish(session_id, None).await;
                return Err(e.into());
            }
        };

        let result = pump_exec(channel, io, &guard).await;
        match &result {
            Ok(code) => {
                debug!("Exec session {} in {} exited with {}", session_id, name, code);
                self.sessions.finish(session_id, Some(*code)).await;
            }
            Err(e) => {
                debug!("Exec session {} in {} ended: {}", session_id, name, e);
                self.sessions.finish(session_id, None).await;
            }
        }
        result
    }

    pub async fn exec_info(&self, session_id: &str) -> Result<ExecInfo> {
        self.sessions.info(session_id).await
    }

    /// Log lines of the container's pod. With `follow` the stream stays open
    /// until the pod exits or `cancel` fires.
    pub async fn logs(
        &self,
        container: &Container,
        options: LogOptions,
        cancel: &CancellationToken,
    ) -> Result<AdapterLogStream> {
        let name = pod_name(&container.id);
        if self.observe(container).await?.is_none() {
            return Err(AdapterError::NotFound(format!(
                "no pod for container {}",
                container.id
            )));
        }

        let lines = self.client.logs(&name, &options).await?;
        let guard = self.streams.open(&container.id, StreamKind::Logs, cancel);
        let stopped = guard.token().clone().cancelled_owned();
        let stream = GuardedLogStream {
            inner: lines.take_until(stopped).boxed(),
            _guard: guard,
        };
        Ok(stream.map(|line| line.map_err(AdapterError::from)).boxed())
    }

    /// Remove managed pods with no matching container record that are older
    /// than the configured maximum age.
    pub async fn reap_orphans(&self, store: &EntityStore, dry_run: bool) -> Result<ReapReport> {
        let pods = self.client.list_pods().await?;
        info!("Found {} managed pods in the cluster", pods.len());

        let max_age = chrono::Duration::from_std(self.config.reaper_max_age)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();
        let mut report = ReapReport::default();

        for pod in pods {
            if let Some(created) = pod.created_at {
                if now.signed_duration_since(created) < max_age {
                    continue;
                }
            }

            let owned = match pod.container_id.as_deref() {
                Some(id) => match store.get_container(id).await {
                    Ok(_) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e.into()),
                },
                None => false,
            };
            if owned {
                continue;
            }

            report.found += 1;
            warn!(
                "Found orphaned pod {} ({}={})",
                pod.name,
                ID_LABEL,
                pod.container_id.as_deref().unwrap_or("<missing>")
            );
            if dry_run {
                continue;
            }

            let removed = match self.client.delete_pod(&pod.name).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => {
                    match self.client.remove_exposure(&pod.name).await {
                        Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => {
                    info!("Removed orphaned pod {}", pod.name);
                    report.removed += 1;
                }
                Err(e) => {
                    let message = format!("Failed to remove orphaned pod {}: {}", pod.name, e);
                    warn!("{}", message);
                    report.errors.push(message);
                }
            }
        }

        if dry_run {
            info!(
                "Dry run complete: found {} orphaned pods (none removed)",
                report.found
            );
        } else {
            info!(
                "Cleanup complete: found {} orphaned pods, removed {} (failed: {})",
                report.found,
                report.removed,
                report.errors.len()
            );
        }
        Ok(report)
    }
}

async fn pump_exec(channel: ExecChannel, io: ExecIo, guard: &StreamGuard) -> Result<i32> {
    let ExecChannel {
        stdin,
        stdout,
        stderr,
        exit,
        abort,
    } = channel;
    let abort = AbortOnDrop::new(abort);
    let ExecIo {
        stdin: input,
        stdout: mut out,
        stderr: mut err,
    } = io;

    let transfer = async {
        let feed = async move {
            if let (Some(mut input), Some(mut remote)) = (input, stdin) {
                tokio::io::copy(&mut input, &mut remote).await?;
                remote.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let output = async {
            let (forwarded_out, forwarded_err) =
                tokio::join!(forward(stdout, &mut out), forward(stderr, &mut err));
            forwarded_out?;
            forwarded_err?;
            out.flush().await?;
            err.flush().await?;
            Ok::<_, AdapterError>(exit.await?)
        };
        let (fed, code) = feed_until_done(feed, output).await;
        if let Some(Err(e)) = fed {
            // The command may exit without reading all of its input.
            debug!("Exec stdin closed early: {}", e);
        }
        code
    };

    let code = tokio::select! {
        _ = guard.token().cancelled() => {
            abort.abort();
            return Err(AdapterError::Cancelled("exec session".to_string()));
        }
        code = transfer => code?,
    };
    abort.disarm();
    Ok(code)
}

/// Poll `feed` alongside `output` and return as soon as `output` completes.
/// The feed result is `None` if it was still running at that point; it is
/// dropped then, which closes the remote stdin it owns.
async fn feed_until_done<F, O>(feed: F, output: O) -> (Option<std::io::Result<()>>, O::Output)
where
    F: Future<Output = std::io::Result<()>>,
    O: Future,
{
    tokio::pin!(feed);
    tokio::pin!(output);
    let mut fed = None;
    loop {
        tokio::select! {
            result = &mut feed, if fed.is_none() => fed = Some(result),
            value = &mut output => return (fed, value),
        }
    }
}

async fn forward<W>(source: Option<BoxedReader>, sink: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Some(mut source) = source {
        tokio::io::copy(&mut source, sink).await?;
    }
    Ok(())
}

async fn read_all(source: Option<BoxedReader>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut source) = source {
        if let Err(e) = source.read_to_end(&mut buf).await {
            debug!("Exec output stream ended with error: {}", e);
        }
    }
    buf
}

/// Aborts the remote channel unless the exchange completed normally. Covers
/// callers that drop the operation future mid-stream.
struct AbortOnDrop {
    handle: AbortHandle,
    armed: AtomicBool,
}

impl AbortOnDrop {
    fn new(handle: AbortHandle) -> Self {
        Self {
            handle,
            armed: AtomicBool::new(true),
        }
    }

    fn abort(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.handle.abort();
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            self.handle.abort();
        }
    }
}

/// Log stream that keeps its registry entry alive until dropped.
struct GuardedLogStream {
    inner: LogStream,
    _guard: StreamGuard,
}

impl Stream for GuardedLogStream {
    type Item = crate::client::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

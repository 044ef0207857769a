// ABOUTME: In-memory ClusterClient for exercising the adapter without a cluster
// ABOUTME: Simulates pod readiness, deletion, NodePort allocation, exec commands and logs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use crate::client::{
    AbortHandle, BoxedReader, BoxedWriter, ClusterClient, ExecChannel, ExecRequest, LogOptions,
    LogStream, PodObservation, PodPhase, PodTemplate, Result,
};
use crate::error::ClusterError;
use crate::pod::{pod_labels, ID_LABEL};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_NODE_PORT: u16 = 30000;

#[derive(Debug)]
struct FakePod {
    observation: PodObservation,
    image: String,
    labels: BTreeMap<String, String>,
    polls_until_ready: u32,
    polls_until_gone: Option<u32>,
    logs: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct FakeState {
    pods: HashMap<String, FakePod>,
    services: HashMap<String, BTreeMap<u16, u16>>,
    next_node_port: u16,
    ready_after: u32,
    delete_after: u32,
    create_calls: usize,
    failing_exposes: usize,
    unavailable: bool,
    broken_images: HashSet<String>,
    broken_programs: HashSet<String>,
    exec_commands: Vec<Vec<String>>,
    aborted: usize,
}

/// Cheap to clone; all clones share one simulated cluster.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Pods become ready on the second poll and disappear on the second poll
    /// after deletion.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                pods: HashMap::new(),
                services: HashMap::new(),
                next_node_port: FIRST_NODE_PORT,
                ready_after: 1,
                delete_after: 1,
                create_calls: 0,
                failing_exposes: 0,
                unavailable: false,
                broken_images: HashSet::new(),
                broken_programs: HashSet::new(),
                exec_commands: Vec::new(),
                aborted: 0,
            })),
        }
    }

    /// Number of `get_pod` polls a new pod stays Pending. `u32::MAX` never
    /// becomes ready.
    pub fn with_ready_after(self, polls: u32) -> Self {
        self.state().ready_after = polls;
        self
    }

    /// Number of `get_pod` polls a deleted pod lingers as terminating.
    pub fn with_delete_after(self, polls: u32) -> Self {
        self.state().delete_after = polls;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` port exposures with an unavailable error.
    pub fn fail_next_expose(&self, count: usize) {
        self.state().failing_exposes = count;
    }

    /// Make every API call fail as if the control plane were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Pods for `image` stay Pending with `ErrImagePull`.
    pub fn fail_image(&self, image: &str) {
        self.state().broken_images.insert(image.to_string());
    }

    /// Exec connections running `program` drop after the first read from
    /// stdin, before an exit code is sent. Simulates an evicted pod.
    pub fn break_connection(&self, program: &str) {
        self.state().broken_programs.insert(program.to_string());
    }

    /// Force a pod into `phase`, as if its main container changed state.
    pub fn set_phase(&self, pod: &str, phase: PodPhase) {
        if let Some(pod) = self.state().pods.get_mut(pod) {
            pod.polls_until_ready = 0;
            pod.observation.phase = phase;
            pod.observation.ready = phase == PodPhase::Running;
            pod.observation.exit_code = match phase {
                PodPhase::Succeeded => Some(0),
                PodPhase::Failed => Some(1),
                _ => None,
            };
        }
    }

    pub fn set_logs<I, S>(&self, pod: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(pod) = self.state().pods.get_mut(pod) {
            pod.logs = lines.into_iter().map(Into::into).collect();
        }
    }

    /// Add a running managed pod that no kubedock process created, labelled
    /// with `container_id`.
    pub fn insert_pod(&self, name: &str, container_id: &str, created_at: DateTime<Utc>) {
        let mut observation = PodObservation::new(name, PodPhase::Running);
        observation.ready = true;
        observation.container_id = Some(container_id.to_string());
        observation.created_at = Some(created_at);
        self.state().pods.insert(
            name.to_string(),
            FakePod {
                observation,
                image: "busybox".to_string(),
                labels: pod_labels(container_id),
                polls_until_ready: 0,
                polls_until_gone: None,
                logs: Vec::new(),
                files: BTreeMap::new(),
            },
        );
    }

    pub fn pod_count(&self) -> usize {
        self.state().pods.len()
    }

    pub fn has_pod(&self, pod: &str) -> bool {
        self.state().pods.contains_key(pod)
    }

    pub fn pod_image(&self, pod: &str) -> Option<String> {
        self.state().pods.get(pod).map(|p| p.image.clone())
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn has_service(&self, pod: &str) -> bool {
        self.state().services.contains_key(pod)
    }

    pub fn node_ports(&self, pod: &str) -> BTreeMap<u16, u16> {
        self.state().services.get(pod).cloned().unwrap_or_default()
    }

    /// Contents of a file unpacked into the pod by `tar`.
    pub fn file(&self, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .pods
            .get(pod)
            .and_then(|p| p.files.get(path).cloned())
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state().exec_commands.clone()
    }

    /// How many exec channels were torn down before their command finished.
    pub fn aborted(&self) -> usize {
        self.state().aborted
    }

    fn check_available(&self) -> Result<()> {
        if self.state().unavailable {
            return Err(ClusterError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, template: &PodTemplate) -> Result<PodObservation> {
        self.check_available()?;
        let mut state = self.state();
        state.create_calls += 1;
        if state.pods.contains_key(&template.name) {
            return Err(ClusterError::AlreadyExists(format!(
                "pods \"{}\" already exists",
                template.name
            )));
        }

        let mut observation = PodObservation::new(&template.name, PodPhase::Pending);
        observation.container_id = template.labels.get(ID_LABEL).cloned();
        observation.created_at = Some(Utc::now());
        if state.broken_images.contains(&template.image) {
            observation.waiting_reason = Some("ErrImagePull".to_string());
            observation.message = Some(format!("pull access denied for {}", template.image));
        }

        let polls_until_ready = state.ready_after;
        state.pods.insert(
            template.name.clone(),
            FakePod {
                observation: observation.clone(),
                image: template.image.clone(),
                labels: template.labels.clone(),
                polls_until_ready,
                polls_until_gone: None,
                logs: Vec::new(),
                files: BTreeMap::new(),
            },
        );
        Ok(observation)
    }

    async fn get_pod(&self, name: &str) -> Result<PodObservation> {
        self.check_available()?;
        let mut state = self.state();
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{}\" not found", name)))?;

        match pod.polls_until_gone {
            Some(0) => {
                state.pods.remove(name);
                return Err(ClusterError::NotFound(format!("pods \"{}\" not found", name)));
            }
            Some(left) => {
                pod.polls_until_gone = Some(left - 1);
                return Ok(pod.observation.clone());
            }
            None => {}
        }

        if pod.observation.phase == PodPhase::Pending && pod.observation.waiting_reason.is_none()
        {
            if pod.polls_until_ready == 0 {
                pod.observation.phase = PodPhase::Running;
                pod.observation.ready = true;
            } else if pod.polls_until_ready != u32::MAX {
                pod.polls_until_ready -= 1;
            }
        }
        Ok(pod.observation.clone())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state();
        let delete_after = state.delete_after;
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{}\" not found", name)))?;
        if pod.polls_until_gone.is_some() {
            return Ok(());
        }
        if delete_after == 0 {
            state.pods.remove(name);
        } else {
            pod.observation.terminating = true;
            pod.observation.ready = false;
            pod.polls_until_gone = Some(delete_after);
        }
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodObservation>> {
        self.check_available()?;
        let state = self.state();
        let mut pods: Vec<PodObservation> = state
            .pods
            .values()
            .filter(|p| p.labels.contains_key(ID_LABEL))
            .map(|p| p.observation.clone())
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pods)
    }

    async fn expose_ports(&self, pod: &str, ports: &[u16]) -> Result<BTreeMap<u16, u16>> {
        self.check_available()?;
        let mut state = self.state();
        if state.failing_exposes > 0 {
            state.failing_exposes -= 1;
            return Err(ClusterError::Unavailable(
                "service creation timed out".to_string(),
            ));
        }

        let mut next = state.next_node_port;
        let service = state.services.entry(pod.to_string()).or_default();
        for port in ports {
            service.entry(*port).or_insert_with(|| {
                next += 1;
                next - 1
            });
        }
        let assigned = service.clone();
        state.next_node_port = next;
        Ok(assigned)
    }

    async fn remove_exposure(&self, pod: &str) -> Result<()> {
        self.check_available()?;
        self.state()
            .services
            .remove(pod)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("services \"{}\" not found", pod)))
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecChannel> {
        self.check_available()?;
        {
            let mut state = self.state();
            let pod = state.pods.get(&request.pod).ok_or_else(|| {
                ClusterError::NotFound(format!("pods \"{}\" not found", request.pod))
            })?;
            if !pod.observation.is_ready() {
                return Err(ClusterError::Api(format!(
                    "container not found in pod {}",
                    request.pod
                )));
            }
            state.exec_commands.push(request.command.clone());
        }

        let (stdin_client, stdin_server) = if request.stdin {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            (Some(client), Some(server))
        } else {
            (None, None)
        };
        let (stdout_server, stdout_client) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_server, stderr_client) = if request.tty {
            (None, None)
        } else {
            let (server, client) = tokio::io::duplex(PIPE_CAPACITY);
            (Some(server), Some(client))
        };

        let (tx, rx) = oneshot::channel();
        let process = Process {
            cluster: self.clone(),
            pod: request.pod.clone(),
            stdin: stdin_server,
            stdout: stdout_server,
            stderr: stderr_server,
        };
        let command = request.command.clone();
        let task = tokio::spawn(async move {
            if let Some(code) = process.run(command).await {
                let _ = tx.send(code);
            }
        });

        let cluster = self.clone();
        let abort = AbortHandle::new(move || {
            if !task.is_finished() {
                cluster.state().aborted += 1;
            }
            task.abort();
        });
        let exit = rx
            .map(|code| code.map_err(|_| ClusterError::Stream("exec channel closed".to_string())))
            .boxed();

        Ok(ExecChannel {
            stdin: stdin_client.map(|w| Box::new(w) as BoxedWriter),
            stdout: Some(Box::new(stdout_client) as BoxedReader),
            stderr: stderr_client.map(|r| Box::new(r) as BoxedReader),
            exit,
            abort,
        })
    }

    async fn logs(&self, pod: &str, options: &LogOptions) -> Result<LogStream> {
        self.check_available()?;
        let state = self.state();
        let pod = state
            .pods
            .get(pod)
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{}\" not found", pod)))?;

        let skip = match options.tail_lines {
            Some(tail) => pod.logs.len().saturating_sub(tail as usize),
            None => 0,
        };
        let lines: Vec<Result<String>> = pod.logs[skip..].iter().cloned().map(Ok).collect();
        let lines = stream::iter(lines);
        if options.follow && !pod.observation.phase.is_terminal() {
            Ok(lines.chain(stream::pending()).boxed())
        } else {
            Ok(lines.boxed())
        }
    }
}

/// Server side of one simulated exec.
struct Process {
    cluster: FakeCluster,
    pod: String,
    stdin: Option<DuplexStream>,
    stdout: DuplexStream,
    stderr: Option<DuplexStream>,
}

impl Process {
    /// Exit code, or `None` when the connection drops before one is sent.
    async fn run(mut self, command: Vec<String>) -> Option<i32> {
        let (env, argv) = split_env(&command);
        let Some((program, args)) = argv.split_first() else {
            return Some(127);
        };

        if self.cluster.state().broken_programs.contains(program) {
            if let Some(stdin) = self.stdin.as_mut() {
                let mut chunk = [0u8; 512];
                let _ = stdin.read(&mut chunk).await;
            }
            return None;
        }

        match program.as_str() {
            "echo" => {
                let line = format!("{}\n", args.join(" "));
                self.stdout.write_all(line.as_bytes()).await.ok()?;
                Some(0)
            }
            "printenv" => match args.first().and_then(|name| env.get(name)) {
                Some(value) => {
                    let line = format!("{}\n", value);
                    self.stdout.write_all(line.as_bytes()).await.ok()?;
                    Some(0)
                }
                None => Some(1),
            },
            "cat" => {
                if let Some(mut stdin) = self.stdin.take() {
                    tokio::io::copy(&mut stdin, &mut self.stdout).await.ok()?;
                }
                Some(0)
            }
            "sh" if args.len() == 2 && args[0] == "-c" => {
                match args[1].strip_prefix("exit ").map(str::parse::<i32>) {
                    Some(Ok(code)) => Some(code),
                    _ => {
                        self.error(b"sh: unsupported script\n").await;
                        Some(2)
                    }
                }
            }
            "sleep" => {
                std::future::pending::<()>().await;
                Some(0)
            }
            "disconnect" => {
                self.stdout.write_all(b"partial").await.ok()?;
                None
            }
            "tar" => self.untar(args).await,
            other => {
                let message = format!("{}: command not found\n", other);
                self.error(message.as_bytes()).await;
                Some(127)
            }
        }
    }

    async fn error(&mut self, message: &[u8]) {
        let sink: &mut (dyn AsyncWrite + Send + Unpin) = match self.stderr.as_mut() {
            Some(stderr) => stderr,
            None => &mut self.stdout,
        };
        let _ = sink.write_all(message).await;
    }

    /// `tar -x -f - -C <dir>`: unpack stdin into the pod's file map.
    async fn untar(&mut self, args: &[String]) -> Option<i32> {
        let destination = args
            .windows(2)
            .find(|pair| pair[0] == "-C")
            .map(|pair| pair[1].trim_end_matches('/').to_string())
            .unwrap_or_default();

        let mut archive = Vec::new();
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.read_to_end(&mut archive).await.ok()?;
        }

        match unpack(&archive, &destination) {
            Ok(files) if !files.is_empty() => {
                let mut state = self.cluster.state();
                if let Some(pod) = state.pods.get_mut(&self.pod) {
                    pod.files.extend(files);
                }
                Some(0)
            }
            Ok(_) => {
                self.error(b"tar: This does not look like a tar archive\n")
                    .await;
                Some(2)
            }
            Err(e) => {
                let message = format!("tar: {}\n", e);
                self.error(message.as_bytes()).await;
                Some(2)
            }
        }
    }
}

fn unpack(archive: &[u8], destination: &str) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(format!("{}/{}", destination, path), contents);
    }
    Ok(files)
}

/// Split a leading `env KEY=VALUE ...` prefix off a command line.
fn split_env(command: &[String]) -> (HashMap<String, String>, &[String]) {
    let mut env = HashMap::new();
    if command.first().map(String::as_str) != Some("env") {
        return (env, command);
    }
    let mut rest = &command[1..];
    while let Some((first, tail)) = rest.split_first() {
        match first.split_once('=') {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
                rest = tail;
            }
            None => break,
        }
    }
    (env, rest)
}

/// Build an in-memory tar archive from `(path, contents)` pairs.
pub fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *contents)
            .unwrap_or_else(|e| panic!("failed to append {}: {}", path, e));
    }
    builder
        .into_inner()
        .unwrap_or_else(|e| panic!("failed to finish archive: {}", e))
}

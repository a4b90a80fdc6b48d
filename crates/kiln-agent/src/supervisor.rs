use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use kiln_process::{
    AggregateUsage, InstancePatch, InstanceStatus, PlayerCount, SupervisorEvent, UsageSample,
};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin},
    sync::{Mutex, OwnedMutexGuard, mpsc, watch},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    config::SupervisorConfig,
    error::{Result, SupervisorError, format_error_chain},
    launch,
    liveness::LivenessChecker,
    locator::ArtifactLocator,
    multiplexer::OutputMultiplexer,
    platform::ProcessControl,
    scanner,
    store::ConfigStore,
    usage,
};

// How long an unexpected exit waits for the last output before reporting it.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
}

/// Live worker owned by the supervisor. Clones share the same stdin and completion signal.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Distinguishes successive spawns of the same instance.
    pub generation: Uuid,
    pub started_at: Instant,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exit: watch::Receiver<Option<Exit>>,
}

impl ProcessHandle {
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.borrow().and_then(|e| e.code)
    }

    /// `true` if the worker exited within `timeout`.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit.clone();
        // A dropped sender means the exit watcher is gone, which only happens after exit.
        tokio::time::timeout(timeout, rx.wait_for(|e| e.is_some()))
            .await
            .is_ok()
    }

    /// Writes one line to the worker, giving up after `timeout` (waiting for stdin included).
    ///
    /// `Ok(false)` when stdin is already closed; `TimedOut` when the pipe stays full.
    pub async fn write_line(&self, text: &str, timeout: Duration) -> std::io::Result<bool> {
        match tokio::time::timeout(timeout, self.write_line_unbounded(text)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "worker stdin did not accept input in time",
            )),
        }
    }

    async fn write_line_unbounded(&self, text: &str) -> std::io::Result<bool> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Ok(false);
        };

        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let res = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        match res {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                *guard = None;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// `false` if another writer kept stdin busy past `timeout`.
    async fn close_stdin(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.stdin.lock()).await {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(_) => false,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: SupervisorConfig,
    pub(crate) store: Arc<dyn ConfigStore>,
    pub(crate) locator: Arc<dyn ArtifactLocator>,
    pub(crate) liveness: LivenessChecker,
    pub(crate) handles: Mutex<HashMap<String, ProcessHandle>>,
    pub(crate) usage: Mutex<HashMap<String, UsageSample>>,
    // Instances with a stop/kill in flight; their exits are expected.
    stopping: Mutex<HashSet<String>>,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) output: OutputMultiplexer,
}

/// Owns every live worker and is the only writer of transient state (status, pid) to the store.
///
/// Operations on one instance are serialized by a per-instance lock; different
/// instances never wait on each other.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn ConfigStore>,
        locator: Arc<dyn ArtifactLocator>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        let liveness = LivenessChecker::new(control, config.liveness_ttl);
        let output = OutputMultiplexer::new(config.flush_delay);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                locator,
                liveness,
                handles: Mutex::new(HashMap::new()),
                usage: Mutex::new(HashMap::new()),
                stopping: Mutex::new(HashSet::new()),
                op_locks: Mutex::new(HashMap::new()),
                output,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub(crate) async fn lock_instance(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.op_locks.lock().await;
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// `None` while another operation on `id` is in flight.
    pub(crate) async fn try_lock_instance(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.inner.op_locks.lock().await;
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }

    /// Artifact lookup touches the filesystem, so it runs on the blocking pool.
    pub(crate) async fn locate(&self, id: &str) -> Option<PathBuf> {
        let locator = self.inner.locator.clone();
        let id = id.to_string();
        match tokio::task::spawn_blocking(move || locator.locate_executable(&id)).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "artifact lookup task failed");
                None
            }
        }
    }

    pub(crate) async fn discover(&self) -> Vec<String> {
        let locator = self.inner.locator.clone();
        match tokio::task::spawn_blocking(move || locator.discover()).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "artifact discovery task failed");
                Vec::new()
            }
        }
    }

    /// Ids whose operation lock is currently held.
    pub(crate) async fn busy_instances(&self) -> HashSet<String> {
        let locks = self.inner.op_locks.lock().await;
        locks
            .iter()
            .filter(|(_, l)| l.try_lock().is_err())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Installs the push channel toward the UI, replacing any previous subscriber.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.output.set_sink(tx).await;
        rx
    }

    /// The live worker for `id`, if one is tracked.
    pub async fn handle(&self, id: &str) -> Option<ProcessHandle> {
        self.inner
            .handles
            .lock()
            .await
            .get(id)
            .filter(|h| !h.has_exited())
            .cloned()
    }

    pub async fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn start(&self, id: &str, ram_override_mb: Option<u32>) -> Result<u32> {
        let _op = self.lock_instance(id).await;
        let inner = &self.inner;

        let instance = inner
            .store
            .get(id)
            .await
            .map_err(SupervisorError::Store)?
            .ok_or_else(|| SupervisorError::UnknownInstance(id.to_string()))?;

        let existing = inner.handles.lock().await.get(id).cloned();
        if let Some(h) = existing {
            if !h.has_exited() {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }
            // Exited, but its watcher is still queued behind our lock.
            self.evict(id, h.generation).await;
        }
        if let Some(pid) = instance.last_known_pid
            && inner.liveness.probe_fresh(pid).await
        {
            tracing::info!(instance_id = %id, pid, "refusing start: persisted pid is still alive");
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }

        let artifact = self
            .locate(id)
            .await
            .ok_or_else(|| SupervisorError::MissingArtifact(id.to_string()))?;
        let ram_mb = ram_override_mb
            .filter(|v| *v > 0)
            .unwrap_or(instance.desired_ram_mb);
        let spec = launch::resolve_launch_spec(&inner.config.java_command, &artifact, ram_mb)
            .map_err(|e| {
                tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "artifact is not launchable");
                SupervisorError::MissingArtifact(id.to_string())
            })?;

        inner
            .store
            .put(id, InstancePatch::status(InstanceStatus::Starting))
            .await
            .map_err(SupervisorError::Store)?;

        tracing::info!(
            instance_id = %id,
            exec = %spec.exec,
            args = %spec.args.join(" "),
            cwd = %spec.cwd.display(),
            "spawning worker"
        );
        let mut child = match launch::command(&spec).spawn() {
            Ok(c) => c,
            Err(source) => {
                tracing::warn!(instance_id = %id, error = %source, "spawn failed");
                self.persist_stopped(id).await;
                return Err(SupervisorError::Spawn {
                    id: id.to_string(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            self.persist_stopped(id).await;
            return Err(SupervisorError::Spawn {
                id: id.to_string(),
                source: std::io::Error::other("worker exited before its pid could be read"),
            });
        };

        let generation = Uuid::new_v4();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            pid,
            generation,
            started_at: Instant::now(),
            stdin: Arc::new(Mutex::new(child.stdin.take())),
            exit: exit_rx,
        };
        inner
            .handles
            .lock()
            .await
            .insert(id.to_string(), handle.clone());
        inner
            .output
            .attach(id, child.stdout.take(), child.stderr.take())
            .await;
        self.spawn_exit_watcher(id, generation, child, exit_tx);

        if let Err(e) = inner
            .store
            .put(id, InstancePatch::status(InstanceStatus::Starting).with_pid(pid))
            .await
        {
            tracing::warn!(instance_id = %id, pid, error = %format_error_chain(&e), "failed to persist pid; terminating worker");
            self.force_terminate(id, &handle).await;
            self.clear_tracking(id).await;
            return Err(SupervisorError::Store(e));
        }

        self.spawn_usage_sampler(id, pid, generation, ram_mb);
        self.spawn_running_upgrade(id, generation);

        tracing::info!(instance_id = %id, pid, ram_mb, %generation, "worker started");
        Ok(pid)
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.shutdown(id, true).await
    }

    /// Like [`Supervisor::stop`] without the graceful phase.
    pub async fn kill(&self, id: &str) -> Result<()> {
        self.shutdown(id, false).await
    }

    pub async fn restart(&self, id: &str, ram_override_mb: Option<u32>) -> Result<u32> {
        self.stop(id).await?;
        tokio::time::sleep(self.inner.config.restart_delay).await;
        self.start(id, ram_override_mb).await
    }

    pub async fn stop_all(&self) {
        let ids = self.tracked().await;
        let results =
            futures_util::future::join_all(ids.iter().map(|id| self.stop(id.as_str()))).await;
        for (id, res) in ids.iter().zip(results) {
            if let Err(e) = res {
                tracing::warn!(instance_id = %id, error = %e, "stop failed during shutdown");
            }
        }
    }

    pub async fn send_input(&self, id: &str, text: &str) -> Result<()> {
        let Some(handle) = self.handle(id).await else {
            return Err(SupervisorError::NotRunning(id.to_string()));
        };
        match handle.write_line(text, self.inner.config.input_timeout).await {
            Ok(true) => {
                tracing::debug!(instance_id = %id, "input sent");
                Ok(())
            }
            Ok(false) => Err(SupervisorError::NotRunning(id.to_string())),
            Err(source) => Err(SupervisorError::Io {
                id: id.to_string(),
                source,
            }),
        }
    }

    pub async fn usage(&self, id: &str) -> Result<UsageSample> {
        if let Some(s) = self.inner.usage.lock().await.get(id).copied() {
            return Ok(s);
        }
        let inst = self
            .inner
            .store
            .get(id)
            .await
            .map_err(SupervisorError::Store)?
            .ok_or_else(|| SupervisorError::UnknownInstance(id.to_string()))?;
        Ok(UsageSample {
            cpu_percent: 0.0,
            ram_mb: 0,
            configured_ram_mb: inst.desired_ram_mb,
        })
    }

    pub async fn aggregate_usage(&self) -> AggregateUsage {
        let per_instance: BTreeMap<String, UsageSample> = self
            .inner
            .usage
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        AggregateUsage {
            total_cpu_percent: per_instance.values().map(|s| s.cpu_percent).sum(),
            total_ram_mb: per_instance.values().map(|s| s.ram_mb).sum(),
            per_instance,
        }
    }

    /// Last status-line count seen in the output, else `max-players` from `server.properties`.
    pub async fn player_count(&self, id: &str) -> Result<PlayerCount> {
        if let Some(c) = self.inner.output.player_count(id).await {
            return Ok(c);
        }
        let dir = self
            .locate(id)
            .await
            .and_then(|artifact| artifact.parent().map(Path::to_path_buf));
        let dir = match dir {
            Some(d) => d,
            None => {
                self.inner
                    .store
                    .get(id)
                    .await
                    .map_err(SupervisorError::Store)?
                    .ok_or_else(|| SupervisorError::UnknownInstance(id.to_string()))?;
                self.inner.config.instances_dir().join(id)
            }
        };
        let max = tokio::task::spawn_blocking(move || scanner::read_max_players(&dir))
            .await
            .map_err(|e| SupervisorError::Io {
                id: id.to_string(),
                source: std::io::Error::other(e),
            })?;
        Ok(PlayerCount { online: 0, max })
    }

    async fn shutdown(&self, id: &str, graceful: bool) -> Result<()> {
        let _op = self.lock_instance(id).await;
        let handle = self.inner.handles.lock().await.get(id).cloned();
        let record = match self.inner.store.get(id).await {
            Ok(r) => r,
            Err(e) if handle.is_none() => return Err(SupervisorError::Store(e)),
            Err(e) => {
                tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "store read failed; stopping tracked worker anyway");
                None
            }
        };
        if handle.is_none() && record.is_none() {
            return Err(SupervisorError::UnknownInstance(id.to_string()));
        }

        self.inner.stopping.lock().await.insert(id.to_string());
        match (&handle, record.and_then(|r| r.last_known_pid)) {
            (Some(h), _) => self.terminate_handle(id, h, graceful).await,
            (None, Some(pid)) => self.terminate_orphan(id, pid).await,
            (None, None) => {
                tracing::debug!(instance_id = %id, "nothing running; clearing state");
            }
        }
        self.clear_tracking(id).await;
        self.inner.stopping.lock().await.remove(id);
        Ok(())
    }

    async fn terminate_handle(&self, id: &str, h: &ProcessHandle, graceful: bool) {
        if h.has_exited() {
            return;
        }
        let cfg = &self.inner.config;
        if graceful {
            let deadline = Instant::now() + cfg.graceful_timeout;
            match h.write_line(&cfg.shutdown_command, cfg.graceful_timeout).await {
                Ok(true) => tracing::debug!(instance_id = %id, pid = h.pid, "sent graceful shutdown command"),
                Ok(false) => tracing::debug!(instance_id = %id, pid = h.pid, "stdin closed; waiting without a shutdown command"),
                Err(e) => tracing::warn!(instance_id = %id, pid = h.pid, error = %e, "failed to write shutdown command"),
            }
            // Drop stdin so the worker also sees EOF.
            if !h.close_stdin(deadline.saturating_duration_since(Instant::now())).await {
                tracing::debug!(instance_id = %id, pid = h.pid, "stdin still busy; leaving it open");
            }

            if h.wait_exit(deadline.saturating_duration_since(Instant::now())).await {
                tracing::info!(instance_id = %id, pid = h.pid, exit_code = ?h.exit_code(), "worker stopped gracefully");
                return;
            }
            tracing::warn!(
                instance_id = %id,
                pid = h.pid,
                timeout_ms = cfg.graceful_timeout.as_millis() as u64,
                "worker ignored graceful shutdown; terminating process tree"
            );
        }
        self.force_terminate(id, h).await;
    }

    async fn force_terminate(&self, id: &str, h: &ProcessHandle) {
        if h.has_exited() {
            return;
        }
        if let Err(e) = self.inner.liveness.control().terminate_tree(h.pid).await {
            tracing::warn!(instance_id = %id, pid = h.pid, error = %e, "terminate_tree failed");
        }
        if h.wait_exit(self.inner.config.forced_timeout).await {
            tracing::info!(instance_id = %id, pid = h.pid, "worker killed");
        } else {
            tracing::warn!(instance_id = %id, pid = h.pid, "worker still alive after forced termination");
        }
    }

    /// A pid persisted by an earlier agent run: no stdin to talk to, so kill it outright.
    async fn terminate_orphan(&self, id: &str, pid: u32) {
        let liveness = &self.inner.liveness;
        if !liveness.probe_fresh(pid).await {
            tracing::debug!(instance_id = %id, pid, "persisted pid already gone");
            return;
        }
        tracing::info!(instance_id = %id, pid, "terminating worker left over from a previous run");
        if let Err(e) = liveness.control().terminate_tree(pid).await {
            tracing::warn!(instance_id = %id, pid, error = %e, "terminate_tree failed");
        }

        let deadline = Instant::now() + self.inner.config.forced_timeout;
        while liveness.probe_fresh(pid).await {
            if Instant::now() >= deadline {
                tracing::warn!(instance_id = %id, pid, "orphaned worker still alive after forced termination");
                break;
            }
            tokio::time::sleep(ORPHAN_POLL_INTERVAL).await;
        }
    }

    async fn persist_stopped(&self, id: &str) {
        if let Err(e) = self.inner.store.put(id, InstancePatch::stopped()).await {
            tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "failed to persist STOPPED");
        }
    }

    /// Forgets everything transient about `id` and records it as stopped.
    async fn clear_tracking(&self, id: &str) {
        self.inner.handles.lock().await.remove(id);
        self.inner.usage.lock().await.remove(id);
        self.inner.output.discard(id).await;
        self.persist_stopped(id).await;
    }

    /// Drops the in-memory state of one specific spawn. Returns whether it was still registered.
    pub(crate) async fn evict(&self, id: &str, generation: Uuid) -> bool {
        {
            let mut handles = self.inner.handles.lock().await;
            if handles.get(id).map(|h| h.generation) != Some(generation) {
                return false;
            }
            handles.remove(id);
        }
        self.inner.usage.lock().await.remove(id);
        self.inner.output.discard(id).await;
        true
    }

    async fn current_generation(&self, id: &str) -> Option<Uuid> {
        self.inner.handles.lock().await.get(id).map(|h| h.generation)
    }

    fn spawn_exit_watcher(
        &self,
        id: &str,
        generation: Uuid,
        mut child: Child,
        exit_tx: watch::Sender<Option<Exit>>,
    ) {
        let sup = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "wait on worker failed");
                    None
                }
            };
            // Read before publishing: a stop in progress clears the flag right after it sees the exit.
            let unexpected = !sup.inner.stopping.lock().await.contains(&id);
            let _ = exit_tx.send(Some(Exit { code }));
            sup.on_exit(&id, generation, code, unexpected).await;
        });
    }

    async fn on_exit(&self, id: &str, generation: Uuid, code: Option<i32>, unexpected: bool) {
        if unexpected {
            if self.current_generation(id).await == Some(generation) {
                self.inner.output.drain(id, EXIT_DRAIN_TIMEOUT).await;
            }
            tracing::warn!(instance_id = %id, exit_code = ?code, %generation, "worker exited unexpectedly");
        } else {
            tracing::info!(instance_id = %id, exit_code = ?code, %generation, "worker exited");
        }
        self.inner
            .output
            .emit(SupervisorEvent::Exited {
                instance_id: id.to_string(),
                exit_code: code,
                unexpected,
            })
            .await;

        let _op = self.lock_instance(id).await;
        if self.current_generation(id).await == Some(generation) {
            self.clear_tracking(id).await;
        }
    }

    fn spawn_running_upgrade(&self, id: &str, generation: Uuid) {
        let sup = self.clone();
        let id = id.to_string();
        let delay = self.inner.config.running_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _op = sup.lock_instance(&id).await;
            let live = sup
                .inner
                .handles
                .lock()
                .await
                .get(&id)
                .is_some_and(|h| h.generation == generation && !h.has_exited());
            if !live {
                tracing::debug!(instance_id = %id, %generation, "worker gone before it reached RUNNING");
                return;
            }
            match sup
                .inner
                .store
                .put(&id, InstancePatch::status(InstanceStatus::Running))
                .await
            {
                Ok(_) => tracing::info!(instance_id = %id, "worker running"),
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "failed to persist RUNNING")
                }
            }
        });
    }

    fn spawn_usage_sampler(&self, id: &str, pid: u32, generation: Uuid, configured_ram_mb: u32) {
        let inner = self.inner.clone();
        let id = id.to_string();
        let interval = self.inner.config.usage_interval;
        tokio::spawn(async move {
            let mut cpu = usage::CpuTracker::default();
            loop {
                let Some(raw) = usage::read_usage(pid).await else {
                    break;
                };
                let sample = UsageSample {
                    cpu_percent: cpu.percent(&raw, Instant::now()),
                    ram_mb: usage::bytes_to_mb(raw.rss_bytes),
                    configured_ram_mb,
                };

                {
                    // Held across the insert so a concurrent cleanup can't be undone.
                    let handles = inner.handles.lock().await;
                    if !handles.get(&id).is_some_and(|h| h.generation == generation) {
                        break;
                    }
                    inner.usage.lock().await.insert(id.clone(), sample);
                }

                tokio::time::sleep(interval).await;
            }
        });
    }
}

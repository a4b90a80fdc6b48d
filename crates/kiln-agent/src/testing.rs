//! Fakes for the OS-facing seams, shared by the module tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::{config::SupervisorConfig, locator::ArtifactLocator, platform::ProcessControl};

#[derive(Default)]
pub(crate) struct FakeControl {
    alive: Mutex<HashSet<u32>>,
    probes: AtomicUsize,
    probe_delay: Option<Duration>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeControl {
    pub(crate) fn with_probe_delay(delay: Duration) -> Self {
        Self {
            probe_delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) async fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock().await;
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) async fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().await.clone()
    }
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn is_alive(&self, pid: u32) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.probe_delay {
            tokio::time::sleep(d).await;
        }
        self.alive.lock().await.contains(&pid)
    }

    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        self.terminated.lock().await.push(pid);
        self.alive.lock().await.remove(&pid);
        Ok(())
    }
}

/// Real OS control that remembers when each forced termination was issued.
pub(crate) struct RecordingControl {
    inner: Arc<dyn ProcessControl>,
    terminated_at: Mutex<Vec<(u32, Instant)>>,
}

impl RecordingControl {
    pub(crate) fn new(inner: Arc<dyn ProcessControl>) -> Self {
        Self {
            inner,
            terminated_at: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn terminations(&self) -> Vec<(u32, Instant)> {
        self.terminated_at.lock().await.clone()
    }
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn is_alive(&self, pid: u32) -> bool {
        self.inner.is_alive(pid).await
    }

    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        self.terminated_at.lock().await.push((pid, Instant::now()));
        self.inner.terminate_tree(pid).await
    }
}

/// Real OS control whose first liveness probe stalls, holding a caller mid-check.
pub(crate) struct StallingControl {
    inner: Arc<dyn ProcessControl>,
    stall: Duration,
    stalled: AtomicBool,
}

impl StallingControl {
    pub(crate) fn new(inner: Arc<dyn ProcessControl>, stall: Duration) -> Self {
        Self {
            inner,
            stall,
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProcessControl for StallingControl {
    async fn is_alive(&self, pid: u32) -> bool {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.is_alive(pid).await
    }

    async fn terminate_tree(&self, pid: u32) -> std::io::Result<()> {
        self.inner.terminate_tree(pid).await
    }
}

#[derive(Default)]
pub(crate) struct StaticLocator {
    artifacts: HashMap<String, PathBuf>,
}

impl StaticLocator {
    pub(crate) fn with(mut self, id: &str, artifact: PathBuf) -> Self {
        self.artifacts.insert(id.to_string(), artifact);
        self
    }
}

impl ArtifactLocator for StaticLocator {
    fn locate_executable(&self, id: &str) -> Option<PathBuf> {
        self.artifacts.get(id).cloned()
    }

    fn discover(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.artifacts.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Stands in for the JVM: echoes its args, answers `list`, exits on `stop` or EOF.
#[cfg(unix)]
pub(crate) const RESPONSIVE_WORKER: &str = r#"echo "args: $*"
echo "Done (1.234s)! For help, type \"help\""
while IFS= read -r line; do
  case "$line" in
    stop) echo "Stopping the server"; exit 0 ;;
    list) echo "There are 2 of a max of 20 players online: alex, steve" ;;
    *) echo "Unknown command: $line" >&2 ;;
  esac
done
"#;

/// Ignores stdin and SIGTERM; only a forced kill ends it.
#[cfg(unix)]
pub(crate) const STUBBORN_WORKER: &str = r#"trap '' TERM
echo "not listening"
while true; do sleep 1; done
"#;

#[cfg(unix)]
pub(crate) const CRASHING_WORKER: &str = r#"echo "Exception in server tick loop" >&2
exit 3
"#;

/// Writes an executable `/bin/sh` script posing as `java` and returns its path.
#[cfg(unix)]
pub(crate) fn fake_java(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-java");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// `<dir>/instances/<id>/server.jar` (empty placeholder).
pub(crate) fn fake_artifact(dir: &Path, id: &str) -> PathBuf {
    let inst = dir.join("instances").join(id);
    std::fs::create_dir_all(&inst).unwrap();
    let jar = inst.join("server.jar");
    std::fs::write(&jar, b"").unwrap();
    jar
}

pub(crate) fn fast_config(dir: &Path, java: &Path) -> SupervisorConfig {
    SupervisorConfig {
        data_root: dir.to_path_buf(),
        java_command: java.display().to_string(),
        graceful_timeout: Duration::from_millis(1500),
        forced_timeout: Duration::from_millis(1500),
        input_timeout: Duration::from_millis(1000),
        running_delay: Duration::from_millis(200),
        restart_delay: Duration::from_millis(50),
        flush_delay: Duration::from_millis(20),
        liveness_ttl: Duration::from_millis(100),
        usage_interval: Duration::from_millis(250),
        ..SupervisorConfig::default()
    }
}

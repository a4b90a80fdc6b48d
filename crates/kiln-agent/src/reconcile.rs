use std::{collections::HashMap, time::Duration};

use kiln_process::{Instance, InstancePatch, InstanceStatus};

use crate::{
    error::{Result, SupervisorError, format_error_chain},
    supervisor::{ProcessHandle, Supervisor},
};

impl Supervisor {
    /// Every known instance, with persisted status corrected against what is actually running.
    ///
    /// Liveness is probed in one batch up front; each correction is then decided and
    /// written under that instance's operation lock against a freshly read record, so a
    /// start or stop that finished in the meantime is never overwritten. Instances with
    /// an operation in flight are returned as stored. Corrective writes are best-effort.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let inner = &self.inner;
        let mut records = inner.store.list_all().await.map_err(SupervisorError::Store)?;

        for id in self.discover().await {
            if records.contains_key(&id) {
                continue;
            }
            let inst = Instance::synthesized(
                &id,
                inner.config.default_ram_mb,
                inner.config.default_port,
            );
            match inner.store.create(inst.clone()).await {
                Ok(()) => {
                    tracing::info!(instance_id = %id, "registered instance discovered on disk");
                    records.insert(id, inst);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "failed to register discovered instance");
                }
            }
        }

        let busy = self.busy_instances().await;
        let tracked: HashMap<String, ProcessHandle> = inner.handles.lock().await.clone();

        let tracked_pids: Vec<u32> = records
            .keys()
            .filter(|id| !busy.contains(*id))
            .filter_map(|id| tracked.get(id).map(|h| h.pid))
            .collect();
        let persisted_pids: Vec<u32> = records
            .iter()
            .filter(|(id, _)| !busy.contains(*id) && !tracked.contains_key(*id))
            .filter_map(|(_, r)| r.last_known_pid)
            .collect();
        let (fresh, cached) = tokio::join!(
            inner.liveness.probe_many_fresh(tracked_pids),
            inner.liveness.check_many(persisted_pids),
        );

        let mut out = Vec::with_capacity(records.len());
        for (id, snapshot) in records {
            let Some(_op) = self.try_lock_instance(&id).await else {
                out.push(snapshot);
                continue;
            };
            let inst = match inner.store.get(&id).await {
                Ok(Some(current)) => current,
                Ok(None) => snapshot,
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "failed to re-read instance; returning it as listed");
                    out.push(snapshot);
                    continue;
                }
            };
            let handle = inner.handles.lock().await.get(&id).cloned();
            out.push(self.reconcile_one(inst, handle, &fresh, &cached).await);
        }

        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Caller holds the operation lock for `inst.id`. Pids missing from the batch
    /// results (a worker started after they were taken) are probed here.
    async fn reconcile_one(
        &self,
        mut inst: Instance,
        handle: Option<ProcessHandle>,
        fresh: &HashMap<u32, bool>,
        cached: &HashMap<u32, bool>,
    ) -> Instance {
        let inner = &self.inner;
        let id = inst.id.clone();

        let patch = match (handle, inst.last_known_pid) {
            (Some(h), _) => {
                let alive = !h.has_exited()
                    && match fresh.get(&h.pid) {
                        Some(alive) => *alive,
                        None => inner.liveness.probe_fresh(h.pid).await,
                    };
                if alive {
                    tracked_repair(&inst, &h, inner.config.running_delay)
                } else if self.evict(&id, h.generation).await {
                    tracing::info!(instance_id = %id, pid = h.pid, generation = %h.generation, "tracked worker is gone; evicted");
                    Some(InstancePatch::stopped())
                } else {
                    None
                }
            }
            (None, Some(pid)) => {
                let alive = match cached.get(&pid) {
                    Some(alive) => *alive,
                    None => inner.liveness.is_alive(Some(pid)).await,
                };
                if alive {
                    (inst.status != InstanceStatus::Running).then(|| {
                        tracing::info!(instance_id = %id, pid, "untracked worker still alive; marking RUNNING");
                        InstancePatch::status(InstanceStatus::Running)
                    })
                } else {
                    tracing::info!(instance_id = %id, pid, "persisted pid is dead; marking STOPPED");
                    Some(InstancePatch::stopped())
                }
            }
            (None, None) => (inst.status != InstanceStatus::Stopped).then(|| {
                tracing::info!(instance_id = %id, status = ?inst.status, "no worker behind status; marking STOPPED");
                InstancePatch::stopped()
            }),
        };

        if let Some(patch) = patch {
            if let Err(e) = inner.store.put(&id, patch.clone()).await {
                tracing::warn!(instance_id = %id, error = %format_error_chain(&e), "failed to persist reconciled status");
            }
            inst.apply(&patch);
        }
        inst
    }
}

/// A live tracked worker must be on record with its pid and a non-STOPPED status.
fn tracked_repair(inst: &Instance, h: &ProcessHandle, running_delay: Duration) -> Option<InstancePatch> {
    let status = match inst.status {
        InstanceStatus::Stopped if h.started_at.elapsed() >= running_delay => InstanceStatus::Running,
        InstanceStatus::Stopped => InstanceStatus::Starting,
        other => other,
    };
    if status == inst.status && inst.last_known_pid == Some(h.pid) {
        return None;
    }
    tracing::info!(instance_id = %inst.id, pid = h.pid, ?status, "record disagrees with live worker; repairing");
    Some(InstancePatch::status(status).with_pid(h.pid))
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
    };

    use tokio::time::Instant;

    use super::*;
    use crate::{
        config::SupervisorConfig,
        locator::ArtifactLocator,
        platform::ProcessControl,
        store::{ConfigStore, MemoryConfigStore},
        testing::{FakeControl, StaticLocator, fake_artifact},
    };

    async fn seed(store: &MemoryConfigStore, id: &str, status: InstanceStatus, pid: Option<u32>) {
        store
            .create(Instance::synthesized(id, 2048, 25565))
            .await
            .unwrap();
        let mut patch = InstancePatch::status(status);
        patch.last_known_pid = Some(pid);
        store.put(id, patch).await.unwrap();
    }

    fn supervisor(store: Arc<MemoryConfigStore>, locator: StaticLocator, control: Arc<FakeControl>) -> Supervisor {
        Supervisor::new(
            SupervisorConfig::default(),
            store,
            Arc::new(locator),
            control,
        )
    }

    fn find<'a>(list: &'a [Instance], id: &str) -> &'a Instance {
        list.iter().find(|i| i.id == id).unwrap()
    }

    #[tokio::test]
    async fn stale_statuses_converge_to_reality() {
        let store = Arc::new(MemoryConfigStore::new());
        let fake = Arc::new(FakeControl::default());
        seed(&store, "ghost", InstanceStatus::Running, Some(999_999)).await;
        seed(&store, "adopted", InstanceStatus::Stopped, Some(4242)).await;
        seed(&store, "steady", InstanceStatus::Running, Some(4343)).await;
        seed(&store, "half-started", InstanceStatus::Starting, None).await;
        seed(&store, "idle", InstanceStatus::Stopped, None).await;
        fake.set_alive(4242, true).await;
        fake.set_alive(4343, true).await;

        let sup = supervisor(store.clone(), StaticLocator::default(), fake);
        let list = sup.list().await.unwrap();

        let ids: Vec<&str> = list.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["adopted", "ghost", "half-started", "idle", "steady"]);

        let expect = [
            ("ghost", InstanceStatus::Stopped, None),
            ("adopted", InstanceStatus::Running, Some(4242)),
            ("steady", InstanceStatus::Running, Some(4343)),
            ("half-started", InstanceStatus::Stopped, None),
            ("idle", InstanceStatus::Stopped, None),
        ];
        for (id, status, pid) in expect {
            let returned = find(&list, id);
            assert_eq!((returned.status, returned.last_known_pid), (status, pid), "{id}");
            let stored = store.get(id).await.unwrap().unwrap();
            assert_eq!((stored.status, stored.last_known_pid), (status, pid), "{id} stored");
        }

        // A second pass has nothing left to fix.
        assert_eq!(sup.list().await.unwrap(), list);
    }

    #[tokio::test]
    async fn artifacts_without_records_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryConfigStore::new());
        seed(&store, "known", InstanceStatus::Stopped, None).await;
        let locator = StaticLocator::default()
            .with("known", fake_artifact(dir.path(), "known"))
            .with("fresh-1", fake_artifact(dir.path(), "fresh-1"));

        let sup = supervisor(store.clone(), locator, Arc::new(FakeControl::default()));
        let list = sup.list().await.unwrap();

        let fresh = find(&list, "fresh-1");
        let defaults = SupervisorConfig::default();
        assert_eq!(fresh.status, InstanceStatus::Stopped);
        assert_eq!(fresh.desired_ram_mb, defaults.default_ram_mb);
        assert_eq!(fresh.listen_port, defaults.default_port);
        assert_eq!(store.get("fresh-1").await.unwrap().as_ref(), Some(fresh));
    }

    #[tokio::test]
    async fn instances_with_an_operation_in_flight_are_left_alone() {
        let store = Arc::new(MemoryConfigStore::new());
        seed(&store, "busy", InstanceStatus::Running, Some(999_999)).await;
        seed(&store, "ghost", InstanceStatus::Running, Some(888_888)).await;

        let sup = supervisor(store.clone(), StaticLocator::default(), Arc::new(FakeControl::default()));
        let guard = sup.lock_instance("busy").await;
        let list = sup.list().await.unwrap();

        let busy = find(&list, "busy");
        assert_eq!((busy.status, busy.last_known_pid), (InstanceStatus::Running, Some(999_999)));
        assert_eq!(find(&list, "ghost").status, InstanceStatus::Stopped);

        drop(guard);
        let list = sup.list().await.unwrap();
        assert_eq!(find(&list, "busy").status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn liveness_checks_run_concurrently() {
        let store = Arc::new(MemoryConfigStore::new());
        let fake = Arc::new(FakeControl::with_probe_delay(Duration::from_millis(200)));
        for n in 0..8u32 {
            seed(&store, &format!("w-{n}"), InstanceStatus::Running, Some(5000 + n)).await;
            fake.set_alive(5000 + n, true).await;
        }

        let sup = supervisor(store, StaticLocator::default(), fake.clone());
        let started = Instant::now();
        let list = sup.list().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
        assert_eq!(fake.probe_count(), 8);
        assert!(list.iter().all(|i| i.status == InstanceStatus::Running));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tracked_worker_reported_dead_is_evicted() {
        use crate::testing::{STUBBORN_WORKER, fake_java, fast_config};

        let dir = tempfile::tempdir().unwrap();
        let java = fake_java(dir.path(), STUBBORN_WORKER);
        let store = Arc::new(MemoryConfigStore::new());
        store
            .create(Instance::synthesized("survival-1", 2048, 25565))
            .await
            .unwrap();
        let locator = StaticLocator::default().with("survival-1", fake_artifact(dir.path(), "survival-1"));
        // The fake never reports the spawned pid alive.
        let fake = Arc::new(FakeControl::default());
        let sup = Supervisor::new(fast_config(dir.path(), Path::new(&java)), store.clone(), Arc::new(locator), fake);

        let pid = sup.start("survival-1", None).await.unwrap();
        let list = sup.list().await.unwrap();

        let inst = find(&list, "survival-1");
        assert_eq!((inst.status, inst.last_known_pid), (InstanceStatus::Stopped, None));
        assert!(sup.handle("survival-1").await.is_none());
        assert!(sup.tracked().await.is_empty());

        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }

    /// Disk stand-in whose every lookup blocks the calling thread.
    struct SlowDiskLocator(Duration);

    impl ArtifactLocator for SlowDiskLocator {
        fn locate_executable(&self, _id: &str) -> Option<PathBuf> {
            std::thread::sleep(self.0);
            None
        }

        fn discover(&self) -> Vec<String> {
            std::thread::sleep(self.0);
            Vec::new()
        }
    }

    async fn tick_after(delay: Duration) -> Instant {
        tokio::time::sleep(delay).await;
        Instant::now()
    }

    #[tokio::test]
    async fn artifact_scans_do_not_stall_the_runtime() {
        let store = Arc::new(MemoryConfigStore::new());
        seed(&store, "idle", InstanceStatus::Stopped, None).await;
        let sup = Supervisor::new(
            SupervisorConfig::default(),
            store,
            Arc::new(SlowDiskLocator(Duration::from_millis(300))),
            Arc::new(FakeControl::default()),
        );

        let t0 = Instant::now();
        let (listed, ticked) = tokio::join!(sup.list(), tick_after(Duration::from_millis(20)));
        assert_eq!(listed.unwrap().len(), 1);
        assert!(ticked.duration_since(t0) < Duration::from_millis(200));

        let t0 = Instant::now();
        let (count, ticked) = tokio::join!(sup.player_count("idle"), tick_after(Duration::from_millis(20)));
        assert_eq!(count.unwrap().max, 20);
        assert!(ticked.duration_since(t0) < Duration::from_millis(200));
    }

    #[cfg(unix)]
    async fn worker_rig(
        worker: &str,
        control: Arc<dyn ProcessControl>,
    ) -> (tempfile::TempDir, Arc<MemoryConfigStore>, Supervisor) {
        use crate::testing::{fake_java, fast_config};

        let dir = tempfile::tempdir().unwrap();
        let java = fake_java(dir.path(), worker);
        let store = Arc::new(MemoryConfigStore::new());
        store
            .create(Instance::synthesized("survival-1", 2048, 25565))
            .await
            .unwrap();
        let locator = StaticLocator::default().with("survival-1", fake_artifact(dir.path(), "survival-1"));
        let sup = Supervisor::new(fast_config(dir.path(), &java), store.clone(), Arc::new(locator), control);
        (dir, store, sup)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_landing_during_a_pass_is_not_overwritten() {
        use crate::{platform::platform_control, testing::{RESPONSIVE_WORKER, StallingControl}};

        let control = Arc::new(StallingControl::new(platform_control(), Duration::from_millis(500)));
        let (_dir, store, sup) = worker_rig(RESPONSIVE_WORKER, control).await;
        store
            .put(
                "survival-1",
                InstancePatch::status(InstanceStatus::Running).with_pid(999_999),
            )
            .await
            .unwrap();

        // The pass stalls on its liveness batch while the start runs to completion.
        let pass = tokio::spawn({
            let sup = sup.clone();
            async move { sup.list().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pid = sup.start("survival-1", None).await.unwrap();

        let listed = pass.await.unwrap().unwrap();
        let inst = find(&listed, "survival-1");
        assert_eq!(inst.last_known_pid, Some(pid));
        assert_ne!(inst.status, InstanceStatus::Stopped);

        let again = sup.list().await.unwrap();
        assert_eq!(find(&again, "survival-1").last_known_pid, Some(pid));
        let stored = store.get("survival-1").await.unwrap().unwrap();
        assert_eq!(stored.last_known_pid, Some(pid));
        assert_ne!(stored.status, InstanceStatus::Stopped);
        assert_eq!(sup.handle("survival-1").await.map(|h| h.pid), Some(pid));

        sup.kill("survival-1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_disagreeing_with_live_worker_is_repaired() {
        use crate::{platform::platform_control, testing::RESPONSIVE_WORKER};

        let (_dir, store, sup) = worker_rig(RESPONSIVE_WORKER, platform_control()).await;
        let pid = sup.start("survival-1", None).await.unwrap();
        store.put("survival-1", InstancePatch::stopped()).await.unwrap();

        let listed = sup.list().await.unwrap();
        let inst = find(&listed, "survival-1");
        assert_eq!(inst.last_known_pid, Some(pid));
        assert_ne!(inst.status, InstanceStatus::Stopped);

        let stored = store.get("survival-1").await.unwrap().unwrap();
        assert_eq!(stored.last_known_pid, Some(pid));
        assert_ne!(stored.status, InstanceStatus::Stopped);

        sup.kill("survival-1").await.unwrap();
    }
}

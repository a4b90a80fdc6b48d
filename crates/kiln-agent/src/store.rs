use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use kiln_process::{Instance, InstancePatch};
use tokio::{io::AsyncWriteExt, sync::Mutex};

const INSTANCE_FILE: &str = "instance.json";

/// Durable record of what the user asked to run, keyed by instance id.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Instance>>;
    /// Merge `patch` into the stored record and return the result.
    async fn put(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance>;
    async fn list_all(&self) -> anyhow::Result<BTreeMap<String, Instance>>;
    /// Insert a full record; fails if one already exists.
    async fn create(&self, instance: Instance) -> anyhow::Result<()>;
}

pub fn validate_instance_id(id: &str) -> anyhow::Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("instance_id must be non-empty");
    }

    // Keep instance ids safe for filesystem paths.
    if id.starts_with('.')
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!("invalid instance_id: {id}");
    }

    Ok(id)
}

/// One `instance.json` per instance under `<root>/<id>/`.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    // Serializes read-modify-write cycles per instance.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn record_lock(&self, id: &str) -> anyhow::Result<Arc<Mutex<()>>> {
        let id = validate_instance_id(id)?;
        let mut locks = self.write_locks.lock().await;
        Ok(locks.entry(id.to_string()).or_default().clone())
    }

    fn record_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        let id = validate_instance_id(id)?;
        Ok(self.root.join(id).join(INSTANCE_FILE))
    }

    async fn load(path: &Path) -> anyhow::Result<Option<Instance>> {
        let raw = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let inst = serde_json::from_slice::<Instance>(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(inst))
    }

    async fn save(&self, inst: &Instance) -> anyhow::Result<()> {
        let path = self.record_path(&inst.id)?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("instance path has no parent"))?;
        tokio::fs::create_dir_all(dir)
            .await
            .context("create instance dir")?;

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(inst).context("serialize instance config")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create instance.json.tmp")?;
        f.write_all(&data).await.context("write instance.json.tmp")?;
        f.flush().await.context("flush instance.json.tmp")?;
        drop(f);
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist instance.json")?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        let path = self.record_path(id)?;
        Self::load(&path).await
    }

    async fn put(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance> {
        let lock = self.record_lock(id).await?;
        let _guard = lock.lock().await;
        let path = self.record_path(id)?;
        let mut inst = Self::load(&path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("instance not found: {id}"))?;
        inst.apply(&patch);
        self.save(&inst).await?;
        Ok(inst)
    }

    async fn list_all(&self) -> anyhow::Result<BTreeMap<String, Instance>> {
        let mut out = BTreeMap::new();
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(e).with_context(|| format!("read_dir {}", self.root.display()));
            }
        };

        while let Some(entry) = rd.next_entry().await.context("read_dir entry")? {
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_instance_id(&name).is_err() {
                continue;
            }
            let path = entry.path().join(INSTANCE_FILE);
            match Self::load(&path).await {
                Ok(Some(inst)) if inst.id == name => {
                    out.insert(name, inst);
                }
                Ok(Some(inst)) => {
                    tracing::warn!(dir = %name, id = %inst.id, "instance.json id does not match its directory; skipping");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %name, error = %e, "skipping unreadable instance record");
                }
            }
        }
        Ok(out)
    }

    async fn create(&self, instance: Instance) -> anyhow::Result<()> {
        let lock = self.record_lock(&instance.id).await?;
        let _guard = lock.lock().await;
        let path = self.record_path(&instance.id)?;
        if Self::load(&path).await?.is_some() {
            anyhow::bail!("instance already exists: {}", instance.id);
        }
        self.save(&instance).await
    }
}

/// In-process store for embedding hosts without durable state and for tests.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    inner: Mutex<BTreeMap<String, Instance>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        Ok(self.inner.lock().await.get(id).cloned())
    }

    async fn put(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance> {
        let mut map = self.inner.lock().await;
        let inst = map
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("instance not found: {id}"))?;
        inst.apply(&patch);
        Ok(inst.clone())
    }

    async fn list_all(&self) -> anyhow::Result<BTreeMap<String, Instance>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn create(&self, instance: Instance) -> anyhow::Result<()> {
        validate_instance_id(&instance.id)?;
        let mut map = self.inner.lock().await;
        if map.contains_key(&instance.id) {
            anyhow::bail!("instance already exists: {}", instance.id);
        }
        map.insert(instance.id.clone(), instance);
        Ok(())
    }
}

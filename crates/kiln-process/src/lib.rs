use std::collections::BTreeMap;

use specta::Type;

/// Opaque software tag (e.g. `paper`, `velocity`) owned by the version resolver.
///
/// NOTE: The supervisor never interprets this value; it only carries it through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct SoftwareKind(pub String);

impl Default for SoftwareKind {
    fn default() -> Self {
        Self("unknown".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
}

/// Durable, user-visible unit of work: one configured worker and its last known status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct Instance {
    pub id: String,
    pub display_name: String,
    pub desired_ram_mb: u32,
    pub listen_port: u16,
    #[serde(default)]
    pub software_kind: SoftwareKind,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub last_known_pid: Option<u32>,
}

impl Instance {
    /// Record for an instance that exists on disk but was never stored.
    pub fn synthesized(id: &str, desired_ram_mb: u32, listen_port: u16) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            desired_ram_mb: desired_ram_mb.max(1),
            listen_port: listen_port.max(1),
            software_kind: SoftwareKind::default(),
            status: InstanceStatus::Stopped,
            last_known_pid: None,
        }
    }

    pub fn apply(&mut self, patch: &InstancePatch) {
        if let Some(v) = &patch.display_name {
            self.display_name = v.clone();
        }
        if let Some(v) = patch.desired_ram_mb {
            self.desired_ram_mb = v.max(1);
        }
        if let Some(v) = patch.listen_port {
            self.listen_port = v.max(1);
        }
        if let Some(v) = &patch.software_kind {
            self.software_kind = v.clone();
        }
        if let Some(v) = patch.status {
            self.status = v;
        }
        if let Some(v) = patch.last_known_pid {
            self.last_known_pid = v;
        }
    }
}

/// Partial update with merge semantics: `None` leaves the stored field untouched.
///
/// `last_known_pid: Some(None)` clears the pid.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstancePatch {
    pub display_name: Option<String>,
    pub desired_ram_mb: Option<u32>,
    pub listen_port: Option<u16>,
    pub software_kind: Option<SoftwareKind>,
    pub status: Option<InstanceStatus>,
    pub last_known_pid: Option<Option<u32>>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: Some(InstanceStatus::Stopped),
            last_known_pid: Some(None),
            ..Self::default()
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.last_known_pid = Some(Some(pid));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct OutputBatch {
    pub instance_id: String,
    pub stream: StreamKind,
    pub text: String,
}

/// Everything pushed toward the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Output(OutputBatch),
    Exited {
        instance_id: String,
        exit_code: Option<i32>,
        // true when no stop/kill was in progress, i.e. the worker crashed or quit on its own.
        unexpected: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct UsageSample {
    pub cpu_percent: f64,
    pub ram_mb: u64,
    pub configured_ram_mb: u32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct AggregateUsage {
    pub total_cpu_percent: f64,
    pub total_ram_mb: u64,
    pub per_instance: BTreeMap<String, UsageSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PlayerCount {
    pub online: u32,
    pub max: u32,
}

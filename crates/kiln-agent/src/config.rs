use std::{path::PathBuf, time::Duration};

const DEFAULT_JAVA_COMMAND: &str = "java";
const DEFAULT_SHUTDOWN_COMMAND: &str = "stop";
const DEFAULT_RAM_MB: u32 = 2048;
const DEFAULT_PORT: u16 = 25565;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

pub fn data_root() -> PathBuf {
    let raw = env_string("KILN_DATA_ROOT").unwrap_or_else(|| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Tunables for the supervisor. Every field has an env override (`KILN_*`).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_root: PathBuf,
    /// JVM launcher used for `.jar` artifacts.
    pub java_command: String,
    /// Line written to the worker's stdin to request a clean shutdown.
    pub shutdown_command: String,
    pub graceful_timeout: Duration,
    pub forced_timeout: Duration,
    /// Upper bound on one `send_input` write into a worker that isn't draining stdin.
    pub input_timeout: Duration,
    /// Delay between spawn and the STARTING -> RUNNING upgrade.
    pub running_delay: Duration,
    pub restart_delay: Duration,
    pub flush_delay: Duration,
    pub liveness_ttl: Duration,
    pub usage_interval: Duration,
    pub default_ram_mb: u32,
    pub default_port: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            java_command: DEFAULT_JAVA_COMMAND.to_string(),
            shutdown_command: DEFAULT_SHUTDOWN_COMMAND.to_string(),
            graceful_timeout: Duration::from_secs(10),
            forced_timeout: Duration::from_secs(5),
            input_timeout: Duration::from_secs(5),
            running_delay: Duration::from_secs(3),
            restart_delay: Duration::from_secs(1),
            flush_delay: Duration::from_millis(50),
            liveness_ttl: Duration::from_millis(1500),
            usage_interval: Duration::from_secs(2),
            default_ram_mb: DEFAULT_RAM_MB,
            default_port: DEFAULT_PORT,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_root: data_root(),
            java_command: env_string("KILN_JAVA_COMMAND").unwrap_or(d.java_command),
            shutdown_command: env_string("KILN_SHUTDOWN_COMMAND").unwrap_or(d.shutdown_command),
            graceful_timeout: env_millis("KILN_GRACEFUL_TIMEOUT_MS", 500, 5 * 60 * 1000, 10_000),
            forced_timeout: env_millis("KILN_FORCED_TIMEOUT_MS", 500, 60_000, 5000),
            input_timeout: env_millis("KILN_INPUT_TIMEOUT_MS", 100, 60_000, 5000),
            running_delay: env_millis("KILN_RUNNING_DELAY_MS", 0, 60_000, 3000),
            restart_delay: env_millis("KILN_RESTART_DELAY_MS", 0, 60_000, 1000),
            flush_delay: env_millis("KILN_FLUSH_DELAY_MS", 5, 2000, 50),
            liveness_ttl: env_millis("KILN_LIVENESS_TTL_MS", 0, 10_000, 1500),
            usage_interval: env_millis("KILN_USAGE_INTERVAL_MS", 250, 60_000, 2000),
            default_ram_mb: env_u64("KILN_DEFAULT_RAM_MB")
                .map(|v| v.clamp(256, 1024 * 1024) as u32)
                .unwrap_or(DEFAULT_RAM_MB),
            default_port: env_u64("KILN_DEFAULT_PORT")
                .map(|v| v.clamp(1, u16::MAX as u64) as u16)
                .unwrap_or(DEFAULT_PORT),
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let c = SupervisorConfig::default();
        assert_eq!(c.graceful_timeout, Duration::from_secs(10));
        assert_eq!(c.forced_timeout, Duration::from_secs(5));
        assert_eq!(c.flush_delay, Duration::from_millis(50));
        assert_eq!(c.instances_dir(), PathBuf::from("./data").join("instances"));
    }

    #[test]
    fn env_millis_clamps_and_falls_back() {
        // Unique names so parallel tests don't interfere.
        unsafe {
            std::env::set_var("KILN_TEST_CLAMP_HIGH_MS", "999999");
            std::env::set_var("KILN_TEST_GARBAGE_MS", "soon");
        }
        assert_eq!(
            env_millis("KILN_TEST_CLAMP_HIGH_MS", 10, 100, 50),
            Duration::from_millis(100)
        );
        assert_eq!(
            env_millis("KILN_TEST_GARBAGE_MS", 10, 100, 50),
            Duration::from_millis(50)
        );
        assert_eq!(
            env_millis("KILN_TEST_UNSET_MS", 10, 100, 50),
            Duration::from_millis(50)
        );
    }
}

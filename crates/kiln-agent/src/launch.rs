use std::path::{Path, PathBuf};

use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Heap flags are bound to the effective RAM; the JVM runs from the artifact's directory.
pub fn resolve_launch_spec(java: &str, artifact: &Path, memory_mb: u32) -> anyhow::Result<LaunchSpec> {
    let cwd = artifact
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow::anyhow!("artifact has no parent directory: {}", artifact.display()))?;
    let file_name = artifact
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("artifact has no file name: {}", artifact.display()))?;

    let memory_mb = memory_mb.max(1);
    Ok(LaunchSpec {
        exec: java.to_string(),
        args: vec![
            format!("-Xms{memory_mb}M"),
            format!("-Xmx{memory_mb}M"),
            "-jar".to_string(),
            file_name,
            "nogui".to_string(),
        ],
        cwd: cwd.to_path_buf(),
    })
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent process dies (crash/kill), ensure the child is terminated.
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Piped stdio; on Unix the worker leads its own session so the whole tree can be signalled.
pub fn command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.exec);
    cmd.current_dir(&spec.cwd)
        .args(&spec.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_flags_follow_effective_ram() {
        let spec =
            resolve_launch_spec("java", Path::new("/srv/kiln/instances/survival-1/server.jar"), 4096)
                .unwrap();
        assert_eq!(spec.exec, "java");
        assert_eq!(
            spec.args,
            vec!["-Xms4096M", "-Xmx4096M", "-jar", "server.jar", "nogui"]
        );
        assert_eq!(spec.cwd, PathBuf::from("/srv/kiln/instances/survival-1"));
    }

    #[test]
    fn bare_file_name_is_rejected() {
        assert!(resolve_launch_spec("java", Path::new("server.jar"), 1024).is_err());
    }
}

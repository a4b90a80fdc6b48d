#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("instance {0} is already running")]
    AlreadyRunning(String),
    #[error("no launchable executable found for instance {0}")]
    MissingArtifact(String),
    #[error("failed to spawn instance {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("instance {0} is not running")]
    NotRunning(String),
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("input to instance {id} failed: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config store: {0:#}")]
    Store(anyhow::Error),
}

impl SupervisorError {
    /// Stable machine-readable code for the UI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "already_running",
            Self::MissingArtifact(_) => "missing_artifact",
            Self::Spawn { .. } => "spawn_failed",
            Self::NotRunning(_) => "not_running",
            Self::UnknownInstance(_) => "unknown_instance",
            Self::Io { .. } => "io_failed",
            Self::Store(_) => "store_failed",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::AlreadyRunning(_) => Some("Stop the instance first, then try again."),
            Self::MissingArtifact(_) => {
                Some("Download or import a server build for this instance, then try again.")
            }
            Self::Spawn { .. } => {
                Some("Ensure Java is installed and the instance directory is writable.")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn error_chain_skips_duplicates() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write instance.json")
            .context("write instance.json")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "write instance.json: disk full");
    }

    #[test]
    fn spawn_error_keeps_os_text() {
        let err = SupervisorError::Spawn {
            id: "survival-1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.code(), "spawn_failed");
        assert!(err.to_string().starts_with("failed to spawn instance survival-1"));
        assert!(err.hint().is_some());
    }
}

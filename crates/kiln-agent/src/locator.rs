use std::path::{Path, PathBuf};

use crate::store::validate_instance_id;

const PREFERRED_ARTIFACT: &str = "server.jar";

/// Read-only view of the artifact resolver (download/version logic lives elsewhere).
///
/// Implementations may block on disk; the supervisor calls them from the blocking pool.
pub trait ArtifactLocator: Send + Sync {
    fn locate_executable(&self, id: &str) -> Option<PathBuf>;
    /// Instance ids that have a launchable artifact on disk.
    fn discover(&self) -> Vec<String>;
}

/// Looks for `server.jar` (or else the first `*.jar` by name) in `<root>/<id>/`.
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    root: PathBuf,
}

impl DirectoryLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn is_jar(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jar"))
}

fn best_candidate(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
    candidates.into_iter().next()
}

fn find_artifact(dir: &Path) -> Option<PathBuf> {
    let preferred = dir.join(PREFERRED_ARTIFACT);
    if preferred.is_file() {
        return Some(preferred);
    }

    let rd = std::fs::read_dir(dir).ok()?;
    let mut jars = Vec::<PathBuf>::new();
    for e in rd.flatten() {
        let path = e.path();
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_file() && is_jar(&path) {
            jars.push(path);
        }
    }
    best_candidate(jars)
}

impl ArtifactLocator for DirectoryLocator {
    fn locate_executable(&self, id: &str) -> Option<PathBuf> {
        let id = validate_instance_id(id).ok()?;
        find_artifact(&self.root.join(id))
    }

    fn discover(&self) -> Vec<String> {
        let rd = match std::fs::read_dir(&self.root) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for e in rd.flatten() {
            let name = e.file_name().to_string_lossy().to_string();
            if validate_instance_id(&name).is_err() || !e.path().is_dir() {
                continue;
            }
            if find_artifact(&e.path()).is_some() {
                out.push(name);
            }
        }
        out.sort();
        out
    }
}

//! Project routing: maps the `PROJECT_PATH` header to a registered workspace.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A registered workspace the navigation tools operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Normalized path used as the routing key.
    pub path: String,
    /// Filesystem root for tool handlers.
    pub root: PathBuf,
}

/// A successful routing decision.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub workspace: Arc<Workspace>,
    pub project_path: String,
}

/// Resolves project path headers to workspaces.
pub trait ProjectRouter: Send + Sync {
    /// Pick the workspace for a request. An absent header is only valid when
    /// exactly one workspace is registered.
    fn resolve_project(&self, project_path_header: Option<&str>) -> Result<ResolvedProject>;

    /// Canonical form of a project path, or `None` if it is unusable.
    fn normalize_project_path(&self, path: &str) -> Option<String>;

    fn find_project_by_path(&self, normalized_path: &str) -> Option<Arc<Workspace>>;
}

/// In-process registry of open workspaces.
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    projects: DashMap<String, Arc<Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workspace root. Returns the normalized key.
    pub fn register(&self, root: impl AsRef<Path>) -> Result<String> {
        let root = root.as_ref();
        let raw = root.to_string_lossy();
        let key = normalize_path(&raw).ok_or_else(|| Error::InvalidProjectPath(raw.to_string()))?;
        self.projects.insert(
            key.clone(),
            Arc::new(Workspace {
                path: key.clone(),
                root: root.to_path_buf(),
            }),
        );
        info!("Registered project: {}", key);
        Ok(key)
    }

    /// Unregister a workspace root. Returns whether it was registered.
    pub fn unregister(&self, root: impl AsRef<Path>) -> bool {
        let raw = root.as_ref().to_string_lossy();
        let Some(key) = normalize_path(&raw) else {
            return false;
        };
        let removed = self.projects.remove(&key).is_some();
        if removed {
            debug!("Unregistered project: {}", key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Registered keys, sorted.
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl ProjectRouter for WorkspaceRegistry {
    fn resolve_project(&self, project_path_header: Option<&str>) -> Result<ResolvedProject> {
        let explicit = project_path_header.and_then(normalize_path);

        let project_path = match explicit {
            Some(path) => {
                if !self.projects.contains_key(&path) {
                    return Err(Error::UnknownProjectPath);
                }
                path
            }
            None => {
                let paths = self.registered_paths();
                match paths.len() {
                    0 => return Err(Error::NoProjectRegistered),
                    1 => paths.into_iter().next().ok_or(Error::NoProjectRegistered)?,
                    _ => return Err(Error::ProjectPathRequired),
                }
            }
        };

        // The entry can vanish between the lookup above and here.
        let workspace = self
            .find_project_by_path(&project_path)
            .ok_or(Error::NoProjectRegistered)?;

        Ok(ResolvedProject {
            workspace,
            project_path,
        })
    }

    fn normalize_project_path(&self, path: &str) -> Option<String> {
        normalize_path(path)
    }

    fn find_project_by_path(&self, normalized_path: &str) -> Option<Arc<Workspace>> {
        self.projects.get(normalized_path).map(|e| e.value().clone())
    }
}

/// Trim, unify separators, drop trailing slashes; lowercase on Windows.
pub fn normalize_path(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unified = trimmed.replace('\\', "/");
    let normalized = unified.trim_end_matches('/');
    if normalized.is_empty() {
        return None;
    }
    if cfg!(windows) {
        Some(normalized.to_lowercase())
    } else {
        Some(normalized.to_string())
    }
}

//! Working-directory resolution for new sessions.
//!
//! Boundary enforcement is delegated to a [`BoundaryFs`] collaborator. The
//! resolver itself never fails: any rejection falls back to the home
//! directory so a terminal always starts somewhere valid.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by a [`BoundaryFs`] implementation.
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// The path is outside every allowed root.
    #[error("path is outside allowed boundaries: {0}")]
    OutsideBoundary(PathBuf),

    /// The path does not exist.
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary-enforcing filesystem access.
pub trait BoundaryFs: Send + Sync {
    /// Resolves `path` to a canonical absolute path inside the allowed roots.
    fn resolve(&self, path: &Path) -> Result<PathBuf, BoundaryError>;

    /// Returns metadata for a path previously returned by [`resolve`](Self::resolve).
    fn stat(&self, path: &Path) -> Result<fs::Metadata, BoundaryError>;
}

/// [`BoundaryFs`] backed by the local filesystem and a list of allowed roots.
#[derive(Debug, Clone, Default)]
pub struct RootBoundary {
    /// Allowed roots. Empty means all paths allowed.
    allowed_roots: Vec<PathBuf>,
}

impl RootBoundary {
    /// Creates a boundary restricted to `allowed_roots`.
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    /// Creates a boundary that allows all paths.
    pub fn allow_all() -> Self {
        Self::default()
    }
}

fn map_io(path: &Path, e: std::io::Error) -> BoundaryError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BoundaryError::NotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => BoundaryError::PermissionDenied(path.to_path_buf()),
        _ => BoundaryError::Io(e),
    }
}

impl BoundaryFs for RootBoundary {
    fn resolve(&self, path: &Path) -> Result<PathBuf, BoundaryError> {
        let canonical = fs::canonicalize(path).map_err(|e| map_io(path, e))?;

        if self.allowed_roots.is_empty() {
            return Ok(canonical);
        }

        for root in &self.allowed_roots {
            let root = match fs::canonicalize(root) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if canonical.starts_with(&root) {
                return Ok(canonical);
            }
        }

        Err(BoundaryError::OutsideBoundary(path.to_path_buf()))
    }

    fn stat(&self, path: &Path) -> Result<fs::Metadata, BoundaryError> {
        fs::metadata(path).map_err(|e| map_io(path, e))
    }
}

/// Resolves the starting directory of a session.
#[derive(Clone)]
pub struct WorkingDirResolver {
    boundary: Arc<dyn BoundaryFs>,
    home: PathBuf,
}

impl WorkingDirResolver {
    /// Creates a resolver that falls back to `home`.
    pub fn new(boundary: Arc<dyn BoundaryFs>, home: PathBuf) -> Self {
        Self { boundary, home }
    }

    /// Creates a resolver that falls back to the current user's home directory.
    pub fn with_home_dir(boundary: Arc<dyn BoundaryFs>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self::new(boundary, home)
    }

    /// The fallback directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Resolves `requested` to a validated absolute directory.
    pub fn resolve(&self, requested: Option<&str>) -> PathBuf {
        let Some(raw) = requested.filter(|r| !r.is_empty()) else {
            return self.home.clone();
        };

        if raw.contains('\0') {
            tracing::warn!("Rejecting working directory containing a null byte");
            return self.home.clone();
        }

        let candidate = absolutize(Path::new(collapse_leading_separators(raw)));

        match self.validate(&candidate) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(
                    requested = %raw,
                    error = %e,
                    "Invalid working directory, falling back to home"
                );
                self.home.clone()
            }
        }
    }

    fn validate(&self, candidate: &Path) -> Result<PathBuf, BoundaryError> {
        let resolved = self.boundary.resolve(candidate)?;
        let metadata = self.boundary.stat(&resolved)?;
        if !metadata.is_dir() {
            return Err(BoundaryError::NotFound(resolved));
        }
        Ok(resolved)
    }
}

/// Collapses a doubled leading separator (`//tmp` becomes `/tmp`).
///
/// A Windows UNC prefix (`\\server\share`) is kept verbatim.
fn collapse_leading_separators(raw: &str) -> &str {
    if cfg!(windows) && raw.starts_with(r"\\") {
        return raw;
    }
    if raw.starts_with("//") {
        let rest = raw.trim_start_matches('/');
        return &raw[raw.len() - rest.len() - 1..];
    }
    raw
}

/// Makes `path` absolute against the process working directory and removes
/// `.` and `..` components lexically.
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

//! Lexical path confinement.

use std::path::{Component, Path, PathBuf};

use super::{FileError, Result};

/// A fixed root directory that user-supplied paths are resolved against.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    base: PathBuf,
}

impl PathSandbox {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: normalize(base.as_ref()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `requested` under the sandbox root, or fail with `AccessDenied`.
    pub fn resolve(&self, requested: impl AsRef<Path>) -> Result<PathBuf> {
        resolve(&self.base, requested)
    }

    /// Path of `absolute` relative to the root, `/`-separated, no leading slash.
    pub fn relative(&self, absolute: &Path) -> String {
        let rel = absolute.strip_prefix(&self.base).unwrap_or(absolute);
        rel.components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Join `requested` onto `base`, collapse `.` and `..`, and require the result
/// to stay under `base`.
///
/// A leading `/` in `requested` is treated as relative to `base`. The check is
/// purely lexical; nothing on disk is consulted.
pub fn resolve(base: &Path, requested: impl AsRef<Path>) -> Result<PathBuf> {
    let requested = requested.as_ref();
    let base = normalize(base);

    let mut joined = base.clone();
    for component in requested.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {}
            other => joined.push(other.as_os_str()),
        }
    }

    let resolved = normalize(&joined);
    if resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(FileError::AccessDenied {
            path: requested.display().to_string(),
        })
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

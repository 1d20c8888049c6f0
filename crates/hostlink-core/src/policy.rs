//! Host-side execution policy: the command whitelist and worktree
//! confinement.
//!
//! Both checks run before any process is spawned. Whitelisting is the only
//! access control; confinement only decides the working directory.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Where the worktree is mounted inside the sandbox.
pub const DEFAULT_MOUNT_PREFIX: &str = "/workspace";

/// Rejections produced by [`ExecPolicy::authorize`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("empty command")]
    EmptyCommand,

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("path {} escapes worktree root {}", path.display(), root.display())]
    PathEscape { path: PathBuf, root: PathBuf },
}

/// Immutable set of command names allowed to run on the host.
///
/// Matching is exact: no globs, no prefixes, no path lookups.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    commands: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains(command)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Allowed commands in sorted order.
    pub fn sorted(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.iter().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<S: Into<String>> FromIterator<S> for Whitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Maps sandbox-visible paths onto the host worktree and refuses anything
/// that would land outside it.
#[derive(Debug, Clone)]
pub struct Confinement {
    root: PathBuf,
    mount_prefix: PathBuf,
}

impl Confinement {
    /// Build a confinement rooted at `root`, made absolute and cleaned.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        Ok(Self {
            root: clean_path(&root),
            mount_prefix: PathBuf::from(DEFAULT_MOUNT_PREFIX),
        })
    }

    /// Override the sandbox mount prefix (default `/workspace`).
    #[must_use]
    pub fn with_mount_prefix(mut self, prefix: impl AsRef<Path>) -> Self {
        self.mount_prefix = clean_path(prefix.as_ref());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_prefix(&self) -> &Path {
        &self.mount_prefix
    }

    /// Translate a sandbox working directory into a host path under the root.
    ///
    /// A path under the mount prefix is re-rooted onto the worktree. A path
    /// without the prefix falls back to the worktree root itself rather than
    /// being trusted as a host path. The result must be the root or lie
    /// under it component-wise; if it exists on disk the same holds after
    /// symlinks are resolved.
    pub fn translate_cwd(&self, sandbox_path: &str) -> Result<PathBuf, PolicyError> {
        let candidate = match Path::new(sandbox_path).strip_prefix(&self.mount_prefix) {
            Ok(rest) => self.root.join(rest),
            Err(_) => {
                debug!(
                    sandbox_path,
                    mount_prefix = %self.mount_prefix.display(),
                    "cwd outside mount prefix, using worktree root"
                );
                self.root.clone()
            }
        };

        let resolved = clean_path(&candidate);
        if !resolved.starts_with(&self.root) {
            return Err(self.escape(resolved));
        }

        if let (Ok(real), Ok(real_root)) = (resolved.canonicalize(), self.root.canonicalize()) {
            if !real.starts_with(&real_root) {
                return Err(self.escape(real));
            }
        }

        Ok(resolved)
    }

    fn escape(&self, path: PathBuf) -> PolicyError {
        PolicyError::PathEscape {
            path,
            root: self.root.clone(),
        }
    }
}

/// Lexically normalise a path: drop `.`, let `..` pop one component.
/// `..` at the filesystem root stays at the root.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whitelist plus confinement, fixed at construction and shared read-only
/// by every session.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    whitelist: Whitelist,
    confinement: Confinement,
}

impl ExecPolicy {
    pub const fn new(whitelist: Whitelist, confinement: Confinement) -> Self {
        Self {
            whitelist,
            confinement,
        }
    }

    pub const fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub const fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    pub fn worktree_root(&self) -> &Path {
        self.confinement.root()
    }

    /// Decide whether `command` may run in sandbox directory `cwd`.
    ///
    /// Returns the host working directory on success.
    pub fn authorize(&self, command: &str, cwd: &str) -> Result<PathBuf, PolicyError> {
        if command.is_empty() {
            return Err(PolicyError::EmptyCommand);
        }
        if !self.whitelist.contains(command) {
            return Err(PolicyError::CommandNotAllowed(command.to_string()));
        }
        self.confinement.translate_cwd(cwd)
    }
}

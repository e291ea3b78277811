//! Tool setup directives
//!
//! A directive is one step of preparing a test's workspace before the
//! build tool runs: write a file, unpack fixtures, export a variable.
//! Directives are applied in order and the first failure aborts setup.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{ErrorKind, SetupError};

/// The isolated directories a test's directives operate on.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    tmp: PathBuf,
    env: Vec<(String, String)>,
}

impl Workspace {
    pub fn new(root: PathBuf, tmp: PathBuf) -> Self {
        Self {
            root,
            tmp,
            env: Vec::new(),
        }
    }

    /// The working directory the build tool runs in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory outside the working tree.
    pub fn tmp(&self) -> &Path {
        &self.tmp
    }

    /// Environment variables exported by directives, in the order set.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub(crate) fn into_env(self) -> Vec<(String, String)> {
        self.env
    }

    /// Set an environment variable for processes started by the test.
    /// A later value for the same key replaces the earlier one.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.env.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.env.push((key, value));
        }
    }

    /// Resolve `path` against the root, rejecting anything that would land
    /// outside it (`..` traversal or a foreign absolute path).
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SetupError> {
        let root = clean_path(&self.root);
        let p = Path::new(path);
        let resolved = if p.is_absolute() {
            clean_path(p)
        } else {
            clean_path(&root.join(p))
        };
        if !resolved.starts_with(&root) {
            return Err(SetupError::path_escape(path, &self.root));
        }
        Ok(resolved)
    }

    /// Write a file, creating parent directories.
    pub fn write_file(&self, path: &str, content: impl AsRef<[u8]>) -> Result<PathBuf, SetupError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)
            .map_err(|e| SetupError::new(ErrorKind::Io, format!("{}: {}", path, e)))?;
        Ok(target)
    }

    pub fn read_file(&self, path: &str) -> Result<String, SetupError> {
        let target = self.resolve(path)?;
        std::fs::read_to_string(&target)
            .map_err(|e| SetupError::new(ErrorKind::Io, format!("{}: {}", path, e)))
    }

    pub fn create_dir(&self, path: &str) -> Result<PathBuf, SetupError> {
        let target = self.resolve(path)?;
        std::fs::create_dir_all(&target)
            .map_err(|e| SetupError::new(ErrorKind::Io, format!("{}: {}", path, e)))?;
        Ok(target)
    }
}

/// One ordered step of workspace preparation.
pub trait ToolsSetup: Send + Sync {
    /// Short description used in error messages and logs
    fn name(&self) -> String;

    /// Apply this step to the workspace
    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError>;
}

/// Apply directives in order, stopping at the first failure.
pub fn apply_all(
    tools: &[Box<dyn ToolsSetup>],
    workspace: &mut Workspace,
) -> Result<(), SetupError> {
    for tool in tools {
        debug!(directive = %tool.name(), "applying setup directive");
        tool.apply(workspace).map_err(|e| e.with_directive(tool.name()))?;
    }
    Ok(())
}

/// Write a file into the workspace.
pub struct WriteFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl WriteFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

impl ToolsSetup for WriteFile {
    fn name(&self) -> String {
        format!("write {}", self.path)
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        workspace.write_file(&self.path, &self.content)?;
        Ok(())
    }
}

/// Create a directory (and its parents) in the workspace.
pub struct CreateDir(pub String);

impl ToolsSetup for CreateDir {
    fn name(&self) -> String {
        format!("mkdir {}", self.0)
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        workspace.create_dir(&self.0)?;
        Ok(())
    }
}

/// Export an environment variable to processes the test runs.
pub struct SetEnv {
    pub key: String,
    pub value: String,
}

impl SetEnv {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl ToolsSetup for SetEnv {
    fn name(&self) -> String {
        format!("env {}", self.key)
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        if self.key.is_empty() || self.key.contains('=') {
            return Err(SetupError::directive(format!("invalid variable name {:?}", self.key)));
        }
        workspace.set_env(&self.key, &self.value);
        Ok(())
    }
}

/// Unpack a txtar archive into the workspace. The archive comment is ignored.
pub struct TxtarFixture {
    pub name: String,
    pub source: String,
}

impl TxtarFixture {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Load the archive text from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            SetupError::new(ErrorKind::Fixture, format!("{}: {}", path.display(), e))
        })?;
        Ok(Self::new(path.display().to_string(), source))
    }
}

impl ToolsSetup for TxtarFixture {
    fn name(&self) -> String {
        format!("fixture {}", self.name)
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        let archive = emx_txtar::Decoder::new()
            .decode(&self.source)
            .map_err(|e| {
                SetupError::new(ErrorKind::Fixture, format!("failed to parse txtar: {}", e))
            })?;
        for file in &archive.files {
            workspace.write_file(&file.name, &file.data)?;
        }
        Ok(())
    }
}

/// Write the default workspace bootstrap document.
pub struct DefaultWorkspaceFile;

impl ToolsSetup for DefaultWorkspaceFile {
    fn name(&self) -> String {
        format!("write {}", crate::workspace::DEFAULT_WORKSPACE_FILE)
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        workspace.write_file(
            crate::workspace::DEFAULT_WORKSPACE_FILE,
            crate::workspace::workspace_with_default_repos(),
        )?;
        Ok(())
    }
}

/// A named closure directive.
pub struct FnSetup<F> {
    name: String,
    f: F,
}

impl<F> FnSetup<F>
where
    F: Fn(&mut Workspace) -> Result<(), SetupError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> ToolsSetup for FnSetup<F>
where
    F: Fn(&mut Workspace) -> Result<(), SetupError> + Send + Sync,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn apply(&self, workspace: &mut Workspace) -> Result<(), SetupError> {
        (self.f)(workspace)
    }
}

/// Clean a path by resolving `.` and `..` components lexically, without
/// touching the filesystem. `..` above the root is dropped.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push(component);
                }
            }
            Component::Normal(_) => out.push(component),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

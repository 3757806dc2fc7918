//! Application environment descriptor.

use std::path::{Path, PathBuf};

/// Immutable description of the supervised application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEnv {
    root: PathBuf,
    app_name: String,
}

impl AppEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let app_name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        Self { root, app_name }
    }

    /// Describe the current working directory.
    pub fn current() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Resolve a path relative to the application root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

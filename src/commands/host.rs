//! Runtime hosts for commands.
//!
//! A [`CommandHost`] is what a command manipulates: a load path, required
//! resources, argv and entry points. [`ExecHost`] accumulates that state and
//! finally replaces the current process with the configured interpreter.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

/// Failure to load a resource.
#[derive(thiserror::Error, Debug)]
pub enum PreloadError {
    #[error("cannot load such file -- {0}")]
    NotFound(String),
}

pub trait CommandHost {
    /// Add a directory in front of the load path.
    fn prepend_load_path(&mut self, dir: &str);

    /// Load an application resource, resolved through the load path.
    fn require(&mut self, resource: &str) -> Result<(), PreloadError>;

    /// Load a library the runtime resolves itself (installed packages).
    fn require_library(&mut self, name: &str);

    /// Expand `path` against the application root.
    fn expand_path(&self, path: &str) -> PathBuf;

    fn replace_args(&mut self, args: Vec<String>);

    fn set_program_name(&mut self, name: &str);

    /// Queue an entry point to evaluate once everything is loaded.
    fn invoke(&mut self, entry: &str);

    fn warn(&mut self, message: &str);
}

/// Host that execs `interpreter` with the accumulated state:
/// `interpreter -I<dir>... -r<file>... -e <entries> -- <argv>`.
pub struct ExecHost {
    interpreter: String,
    root: PathBuf,
    load_path: Vec<String>,
    requires: Vec<String>,
    argv: Vec<String>,
    program_name: Option<String>,
    entries: Vec<String>,
    stderr: Box<dyn Write + Send>,
}

impl ExecHost {
    pub fn new(interpreter: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            root: root.into(),
            load_path: Vec::new(),
            requires: Vec::new(),
            argv: Vec::new(),
            program_name: None,
            entries: Vec::new(),
            stderr: Box::new(std::io::stderr()),
        }
    }

    pub fn with_stderr(mut self, stderr: Box<dyn Write + Send>) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// Find `resource` as given, then under each load path entry, with or
    /// without a `.rb` suffix.
    fn resolve(&self, resource: &str) -> Option<PathBuf> {
        let direct = Path::new(resource);
        let mut bases = Vec::new();
        if direct.is_absolute() {
            bases.push(direct.to_path_buf());
        } else {
            for dir in &self.load_path {
                bases.push(self.expand_path(dir).join(resource));
            }
        }

        bases.into_iter().find_map(|base| {
            if base.is_file() {
                return Some(base);
            }
            let with_ext = base.with_extension("rb");
            with_ext.is_file().then_some(with_ext)
        })
    }

    /// The process this host would exec.
    pub fn command(&self) -> ProcessCommand {
        let mut cmd = ProcessCommand::new(&self.interpreter);
        cmd.current_dir(&self.root);
        for dir in &self.load_path {
            cmd.arg(format!("-I{}", dir));
        }
        for resource in &self.requires {
            cmd.arg(format!("-r{}", resource));
        }

        let mut script = Vec::new();
        if let Some(name) = &self.program_name {
            script.push(format!("$0 = {:?}", name));
        }
        script.extend(self.entries.iter().cloned());
        cmd.arg("-e").arg(script.join("; "));
        cmd.arg("--").args(&self.argv);
        cmd
    }

    /// Replace the current process. Only returns on failure.
    pub fn exec(self) -> anyhow::Error {
        let err = self.command().exec();
        anyhow::anyhow!("failed to exec '{}': {}", self.interpreter, err)
    }
}

impl CommandHost for ExecHost {
    fn prepend_load_path(&mut self, dir: &str) {
        self.load_path.insert(0, dir.to_string());
    }

    fn require(&mut self, resource: &str) -> Result<(), PreloadError> {
        let path = self
            .resolve(resource)
            .ok_or_else(|| PreloadError::NotFound(resource.to_string()))?;
        let path = path.to_string_lossy().into_owned();
        if !self.requires.contains(&path) {
            self.requires.push(path);
        }
        Ok(())
    }

    fn require_library(&mut self, name: &str) {
        if !self.requires.iter().any(|r| r == name) {
            self.requires.push(name.to_string());
        }
    }

    fn expand_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn replace_args(&mut self, args: Vec<String>) {
        self.argv = args;
    }

    fn set_program_name(&mut self, name: &str) {
        self.program_name = Some(name.to_string());
    }

    fn invoke(&mut self, entry: &str) {
        self.entries.push(entry.to_string());
    }

    fn warn(&mut self, message: &str) {
        let _ = self.stderr.write_all(message.as_bytes());
        let _ = self.stderr.flush();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// In-memory host for command tests.
    #[derive(Default)]
    pub(crate) struct RecordingHost {
        pub resources: Vec<String>,
        pub root: PathBuf,
        pub load_path: Vec<String>,
        pub required: Vec<String>,
        pub libraries: Vec<String>,
        pub argv: Option<Vec<String>>,
        pub program_name: Option<String>,
        pub entries: Vec<String>,
        pub warnings: Vec<String>,
    }

    impl RecordingHost {
        pub fn with_resources(resources: &[&str]) -> Self {
            Self {
                resources: resources.iter().map(|r| r.to_string()).collect(),
                root: PathBuf::from("/app"),
                ..Self::default()
            }
        }

        pub fn stderr(&self) -> String {
            self.warnings.concat()
        }
    }

    impl CommandHost for RecordingHost {
        fn prepend_load_path(&mut self, dir: &str) {
            self.load_path.insert(0, dir.to_string());
        }
        fn require(&mut self, resource: &str) -> Result<(), PreloadError> {
            if self.resources.iter().any(|r| r == resource) {
                self.required.push(resource.to_string());
                Ok(())
            } else {
                Err(PreloadError::NotFound(resource.to_string()))
            }
        }
        fn require_library(&mut self, name: &str) {
            self.libraries.push(name.to_string());
        }
        fn expand_path(&self, path: &str) -> PathBuf {
            self.root.join(path)
        }
        fn replace_args(&mut self, args: Vec<String>) {
            self.argv = Some(args);
        }
        fn set_program_name(&mut self, name: &str) {
            self.program_name = Some(name.to_string());
        }
        fn invoke(&mut self, entry: &str) {
            self.entries.push(entry.to_string());
        }
        fn warn(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }
    }

    #[test]
    fn test_exec_host_resolves_through_load_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("test")).unwrap();
        fs::write(dir.path().join("test/test_helper.rb"), "").unwrap();

        let mut host = ExecHost::new("ruby", dir.path());
        assert!(matches!(host.require("test_helper"), Err(PreloadError::NotFound(_))));

        host.prepend_load_path("test");
        host.require("test_helper").unwrap();
        host.require("test_helper").unwrap();
        assert_eq!(host.requires().len(), 1);
        assert!(host.requires()[0].ends_with("test/test_helper.rb"));
    }

    #[test]
    fn test_exec_host_command_line() {
        let mut host = ExecHost::new("ruby", "/app");
        host.prepend_load_path("spec");
        host.require_library("rspec/core");
        host.set_program_name("rspec");
        host.invoke("exit RSpec::Core::Runner.run(ARGV)");
        host.replace_args(vec!["spec/models".into()]);

        let cmd = host.command();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "ruby");
        assert_eq!(
            args,
            [
                "-Ispec",
                "-rrspec/core",
                "-e",
                "$0 = \"rspec\"; exit RSpec::Core::Runner.run(ARGV)",
                "--",
                "spec/models",
            ]
        );
    }

    #[test]
    fn test_exec_host_warn_writes_stderr() {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut host = ExecHost::new("ruby", "/app").with_stderr(Box::new(Shared(buffer.clone())));
        host.warn("careful\n");
        assert_eq!(&*buffer.lock().unwrap(), b"careful\n");
    }
}

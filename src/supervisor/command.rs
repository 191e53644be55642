use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::config::WatcherConfig;

/// Package the runner executes.
pub const TAILWIND_CLI: &str = "@tailwindcss/cli";

/// Directory under the content root that receives the generated stylesheet.
pub const OUTPUT_DIR: &str = "wwwroot";

/// Where the watcher reads from and writes to.
///
/// Inputs are resolved against the content root, the stylesheet lands in
/// `<content root>/wwwroot`, and the process runs from the content root's
/// parent (the project root, where `node_modules` usually lives).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    content_root: PathBuf,
}

impl ProjectLayout {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
        }
    }

    /// Build a layout with the content root made absolute against the
    /// current directory.
    pub fn resolve(content_root: &Path) -> std::io::Result<Self> {
        let root = if content_root.is_absolute() {
            content_root.to_path_buf()
        } else {
            std::env::current_dir()?.join(content_root)
        };
        Ok(Self::new(root))
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn output_dir(&self) -> PathBuf {
        self.content_root.join(OUTPUT_DIR)
    }

    pub fn working_dir(&self) -> &Path {
        self.content_root.parent().unwrap_or(&self.content_root)
    }

    pub fn input_path(&self, config: &WatcherConfig) -> PathBuf {
        self.content_root.join(&config.input_path)
    }

    pub fn output_path(&self, config: &WatcherConfig) -> PathBuf {
        self.output_dir().join(config.artifact_name())
    }
}

/// Argument list handed to the package runner.
///
/// Order matters to the CLI's own parser: generated flags first, then the
/// configured extra arguments verbatim.
pub fn build_arguments(config: &WatcherConfig, layout: &ProjectLayout) -> Vec<String> {
    let mut args = vec![
        TAILWIND_CLI.to_string(),
        "-i".to_string(),
        layout.input_path(config).to_string_lossy().into_owned(),
        "-o".to_string(),
        layout.output_path(config).to_string_lossy().into_owned(),
        "--watch".to_string(),
    ];

    if let Some(config_path) = config.config_path.as_deref().filter(|p| !p.is_empty()) {
        args.push("--config".to_string());
        args.push(config_path.to_string());
    }

    if config.enable_minify {
        args.push("--minify".to_string());
    }

    args.extend(config.additional_arguments.iter().cloned());
    args
}

/// A fully-resolved command line for the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The Tailwind watch command, run through `runner` (e.g. `npx`).
    pub fn tailwind(runner: &str, config: &WatcherConfig, layout: &ProjectLayout) -> Self {
        Self::new(runner, build_arguments(config, layout)).with_working_dir(layout.working_dir())
    }

    /// Build the tokio command: piped output, no stdin, own process group so
    /// the whole tree can be signalled at shutdown.
    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

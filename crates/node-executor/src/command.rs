//! Command building utilities.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Executable not found: {0}")]
    NotFound(String),
    #[error("Program is empty")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Render as a shell-quoted command line, for logging.
    ///
    /// # Errors
    /// Returns error if an argument cannot be quoted (it contains a NUL byte).
    pub fn to_command_line(&self) -> Result<String, CommandBuildError> {
        let words =
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for constructing commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Executable, either a path or a name looked up on `PATH`.
    pub base: String,
    /// Parameters placed before every invocation's own arguments.
    pub params: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Replace the leading parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Build an invocation with the given trailing arguments.
    ///
    /// # Errors
    /// Returns error if the base program is blank.
    pub fn build<I>(&self, args: I) -> Result<CommandParts, CommandBuildError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let program = self.base.trim();
        if program.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let mut all = self.params.clone();
        all.extend(args.into_iter().map(Into::into));
        Ok(CommandParts::new(program.to_string(), all))
    }
}

/// Resolve an executable by name or path.
///
/// Explicit paths (absolute, or containing a separator) are accepted when
/// they point at a file; bare names are looked up on `PATH` via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

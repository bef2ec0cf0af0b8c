//! Executor for the Xray binary.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use node_core::{ConfigDocument, Executor, ExecutorError, NodeSettings, SpawnedProcess};
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

use crate::command::{CommandBuildError, CommandBuilder};

/// Environment variable through which Xray finds its geo data.
pub const ASSET_ENV: &str = "XRAY_LOCATION_ASSET";

/// Config source understood by `xray run -config` for piped input.
const STDIN_SOURCE: &str = "stdin:";

/// Default bound on handing the config to the core over stdin.
pub const DEFAULT_STDIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Log levels too quiet for the agent to detect startup or report crashes.
const QUIET_LOG_LEVELS: [&str; 2] = ["none", "error"];

/// Runs `xray run` with the config piped through stdin, or written to a
/// file first when a config path is set.
#[derive(Debug, Clone)]
pub struct XrayExecutor {
    command: CommandBuilder,
    assets_path: PathBuf,
    config_path: Option<PathBuf>,
    stdin_timeout: Duration,
}

impl XrayExecutor {
    /// Create an executor for the given program and asset directory.
    #[must_use]
    pub fn new(executable: impl Into<String>, assets_path: impl Into<PathBuf>) -> Self {
        Self::with_command(CommandBuilder::new(executable), assets_path)
    }

    /// Create an executor from a pre-built command (program plus leading params).
    #[must_use]
    pub fn with_command(command: CommandBuilder, assets_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            assets_path: assets_path.into(),
            config_path: None,
            stdin_timeout: DEFAULT_STDIN_TIMEOUT,
        }
    }

    /// Executor configured from the node settings.
    #[must_use]
    pub fn from_settings(settings: &NodeSettings) -> Self {
        Self::new(
            settings.executable_path.to_string_lossy(),
            settings.assets_path.clone(),
        )
        .config_path(settings.config_path.clone())
        .stdin_timeout(settings.startup_timeout)
    }

    /// Write configs to `path` instead of piping them.
    #[must_use]
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Give up on a core that does not read its piped config within `limit`.
    #[must_use]
    pub fn stdin_timeout(mut self, limit: Duration) -> Self {
        self.stdin_timeout = limit;
        self
    }

    async fn resolve(
        &self,
        args: &[&str],
    ) -> Result<(PathBuf, Vec<String>), ExecutorError> {
        let parts = self.command.build(args.iter().copied()).map_err(build_error)?;
        if let Ok(line) = parts.to_command_line() {
            tracing::debug!(command = %line, "prepared xray command");
        }
        parts.into_resolved().await.map_err(build_error)
    }
}

fn build_error(e: CommandBuildError) -> ExecutorError {
    match e {
        CommandBuildError::NotFound(program) => ExecutorError::ExecutableNotFound(program),
        other => ExecutorError::CommandBuild(other.to_string()),
    }
}

#[async_trait]
impl Executor for XrayExecutor {
    async fn spawn(&self, config: &ConfigDocument) -> Result<SpawnedProcess, ExecutorError> {
        let mut config = config.clone();
        raise_quiet_log_level(&mut config);
        let json = config.to_json();

        let source = match &self.config_path {
            Some(path) => {
                tokio::fs::write(path, json.as_bytes()).await?;
                path.to_string_lossy().into_owned()
            }
            None => STDIN_SOURCE.to_string(),
        };
        let piped = self.config_path.is_none();

        let (program, args) = self.resolve(&["run", "-config", &source]).await?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .env(ASSET_ENV, &self.assets_path)
            .stdin(if piped { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .group_spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {e}", program.display())))?;

        tracing::info!(pid = ?child.id(), executable = %program.display(), "xray spawned");

        if let Some(mut stdin) = child.inner().stdin.take() {
            let delivery = async {
                stdin.write_all(json.as_bytes()).await?;
                stdin.shutdown().await
            };
            match timeout(self.stdin_timeout, delivery).await {
                Ok(Ok(())) => {}
                // A core that dies on a bad config closes the pipe early; the
                // exit itself is reported by whoever waits on the child.
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to deliver config over stdin"),
                Err(_) => {
                    tracing::error!(
                        pid = ?child.id(),
                        limit = ?self.stdin_timeout,
                        "xray did not read its config, killing it"
                    );
                    if child.start_kill().is_ok() {
                        let _ = child.wait().await;
                    }
                    return Err(ExecutorError::SpawnFailed(format!(
                        "config not consumed within {:?}",
                        self.stdin_timeout
                    )));
                }
            }
        }

        Ok(SpawnedProcess { child })
    }

    async fn version(&self) -> Result<String, ExecutorError> {
        let (program, args) = self.resolve(&["version"]).await?;
        let output = Command::new(&program)
            .args(&args)
            .env(ASSET_ENV, &self.assets_path)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout).ok_or_else(|| ExecutorError::VersionParse(stdout.trim().to_string()))
    }

    fn is_ready_line(&self, line: &str, version: Option<&str>) -> bool {
        match version {
            Some(v) => line.contains(&format!("Xray {v} started")),
            None => line
                .find("Xray ")
                .is_some_and(|at| line[at..].trim_end().ends_with(" started")),
        }
    }
}

/// Extract `X.Y.Z` from the first line of `xray version` output
/// (`Xray 1.8.4 (Xray, Penetrates Everything.) ...`).
#[must_use]
pub fn parse_version(output: &str) -> Option<String> {
    let first = output.lines().next()?.trim_start();
    let candidate = first.strip_prefix("Xray ")?.split_whitespace().next()?;

    let numeric = candidate.split('.').count() == 3
        && candidate
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    numeric.then(|| candidate.to_string())
}

fn raise_quiet_log_level(config: &mut ConfigDocument) {
    let Some(Value::Object(log)) = config.as_map_mut().get_mut("log") else {
        return;
    };
    for key in ["loglevel", "logLevel"] {
        if let Some(Value::String(level)) = log.get_mut(key) {
            if QUIET_LOG_LEVELS.contains(&level.as_str()) {
                tracing::debug!(from = %level, "raising xray log level to warning");
                *level = "warning".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    const FAKE_XRAY: &str = r#"
if [ "$1" = "version" ]; then
    echo "Xray 1.8.4 (Xray, Penetrates Everything.) 0bfe6e6 (go1.21.1 linux/amd64)"
    echo "A unified platform for anti-censorship."
    exit 0
fi
if [ "$3" = "stdin:" ]; then
    config=$(cat)
else
    config=$(cat "$3")
fi
echo "asset=$XRAY_LOCATION_ASSET"
echo "config=$config"
echo "Xray 1.8.4 started"
"#;

    fn fake_executor(dir: &Path) -> XrayExecutor {
        let script = dir.join("xray.sh");
        std::fs::write(&script, FAKE_XRAY).unwrap();
        let command = CommandBuilder::new("/bin/sh").params([script.to_string_lossy()]);
        XrayExecutor::with_command(command, "/srv/assets")
    }

    async fn collect_stdout(mut process: SpawnedProcess) -> Vec<String> {
        let stdout = process.child.inner().stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        tokio::time::timeout(Duration::from_secs(5), process.child.wait())
            .await
            .unwrap()
            .unwrap();
        out
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("Xray 1.8.4 (Xray, Penetrates Everything.) 0bfe6e6\nmore"),
            Some("1.8.4".into())
        );
        assert_eq!(parse_version("Xray 25.1.30 (Xray)"), Some("25.1.30".into()));
        assert_eq!(parse_version("V2Ray 5.1.0"), None);
        assert_eq!(parse_version("Xray 1.8"), None);
        assert_eq!(parse_version("Xray v1.8.4"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_ready_line_detection() {
        let exec = XrayExecutor::new("xray", "/srv/assets");
        let line = "2024/01/01 00:00:00 [Warning] core: Xray 1.8.4 started";
        assert!(exec.is_ready_line(line, Some("1.8.4")));
        assert!(!exec.is_ready_line(line, Some("1.8.5")));
        assert!(exec.is_ready_line(line, None));
        assert!(!exec.is_ready_line("[Info] transport started", None));
    }

    #[test]
    fn test_quiet_log_levels_are_raised() {
        let mut doc =
            ConfigDocument::from_value(json!({"log": {"loglevel": "error"}, "inbounds": []}))
                .unwrap();
        raise_quiet_log_level(&mut doc);
        assert_eq!(doc.as_map()["log"]["loglevel"], "warning");

        let mut doc =
            ConfigDocument::from_value(json!({"log": {"loglevel": "debug"}})).unwrap();
        raise_quiet_log_level(&mut doc);
        assert_eq!(doc.as_map()["log"]["loglevel"], "debug");
    }

    #[tokio::test]
    async fn test_version_from_fake_binary() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fake_executor(dir.path());
        assert_eq!(exec.version().await.unwrap(), "1.8.4");
    }

    #[tokio::test]
    async fn test_spawn_pipes_config_and_exports_assets() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fake_executor(dir.path());
        let doc = ConfigDocument::from_value(json!({"log": {"loglevel": "none"}})).unwrap();

        let lines = collect_stdout(exec.spawn(&doc).await.unwrap()).await;
        assert_eq!(lines[0], "asset=/srv/assets");
        assert!(lines[1].contains(r#""loglevel":"warning""#));
        assert_eq!(lines[2], "Xray 1.8.4 started");
    }

    #[tokio::test]
    async fn test_spawn_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("config.json");
        let exec = fake_executor(dir.path()).config_path(Some(config_file.clone()));
        let doc = ConfigDocument::from_value(json!({"inbounds": []})).unwrap();

        let lines = collect_stdout(exec.spawn(&doc).await.unwrap()).await;
        assert_eq!(lines[1], r#"config={"inbounds":[]}"#);
        assert!(config_file.is_file());
    }

    #[tokio::test]
    async fn test_core_not_reading_stdin_is_killed() {
        let command = CommandBuilder::new("/bin/sh").params(["-c", "exec sleep 30", "xray"]);
        let exec = XrayExecutor::with_command(command, "/srv/assets")
            .stdin_timeout(Duration::from_millis(200));
        // Larger than a pipe buffer, so the write cannot complete unread.
        let doc = ConfigDocument::from_value(json!({"padding": "x".repeat(1 << 20)})).unwrap();

        let spawned = tokio::time::timeout(Duration::from_secs(5), exec.spawn(&doc))
            .await
            .expect("spawn must not hang on a stuck core");
        assert!(matches!(spawned, Err(ExecutorError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let exec = XrayExecutor::new("/nonexistent/xray", "/srv/assets");
        let doc = ConfigDocument::from_value(json!({})).unwrap();
        assert!(matches!(
            exec.spawn(&doc).await,
            Err(ExecutorError::ExecutableNotFound(_))
        ));
        assert!(matches!(
            exec.version().await,
            Err(ExecutorError::ExecutableNotFound(_))
        ));
    }
}

use std::process::Stdio;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::StageError;
use crate::pipeline::{RunContext, Stage};

/// Runs a stage as an external program inside the run directory.
///
/// The program learns about the run through `BOOKREEL_*` environment
/// variables and reports its artifact as the last non-empty stdout line.
#[derive(Debug, Clone)]
pub struct CommandStage {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Exit code meaning "do not retry".
    pub fatal_exit_code: Option<i32>,
}

#[async_trait]
impl Stage for CommandStage {
    async fn run(&self, ctx: &RunContext) -> Result<Option<String>, StageError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&ctx.root)
            .env("BOOKREEL_RUN_ID", &ctx.run_id)
            .env("BOOKREEL_RUN_DIR", &ctx.root)
            .env("BOOKREEL_STAGE", &self.name)
            .env("BOOKREEL_TITLE", &ctx.title)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(author) = ctx.author.as_deref() {
            cmd.env("BOOKREEL_AUTHOR", author);
        }
        for (stage, artifact) in &ctx.artifacts {
            cmd.env(artifact_env_var(stage), artifact);
        }

        tracing::debug!(stage = %self.name, command = %self.program, args = ?self.args, "stage exec");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("spawn stage command: {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = anyhow::anyhow!(
                "stage command failed: {} ({}): {}",
                self.program,
                output.status,
                stderr_tail(&stderr, 20)
            );
            let fatal = self
                .fatal_exit_code
                .is_some_and(|code| output.status.code() == Some(code));
            return Err(if fatal {
                StageError::Fatal(err)
            } else {
                StageError::Transient(err)
            });
        }

        let stdout =
            String::from_utf8(output.stdout).context("stage stdout is not valid UTF-8")?;
        Ok(last_non_empty_line(&stdout))
    }
}

/// `BOOKREEL_ARTIFACT_<STAGE>`, stage upper-cased with non-alphanumerics as `_`.
pub fn artifact_env_var(stage: &str) -> String {
    let suffix: String = stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("BOOKREEL_ARTIFACT_{suffix}")
}

fn last_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_owned)
}

fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn ctx(root: &std::path::Path) -> RunContext {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("render".to_owned(), "video.mp4".to_owned());
        RunContext {
            run_id: "20260101_000000_abcd1234".into(),
            root: root.to_path_buf(),
            title: "Deep Work".into(),
            author: Some("Cal Newport".into()),
            artifacts,
        }
    }

    fn sh(script: &str, fatal_exit_code: Option<i32>) -> CommandStage {
        CommandStage {
            name: "upload".into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            fatal_exit_code,
        }
    }

    #[test]
    fn artifact_env_var_is_shell_safe() {
        assert_eq!(artifact_env_var("upload_short"), "BOOKREEL_ARTIFACT_UPLOAD_SHORT");
        assert_eq!(artifact_env_var("tts-v2"), "BOOKREEL_ARTIFACT_TTS_V2");
    }

    #[test]
    fn last_non_empty_line_ignores_trailing_blank_lines() {
        assert_eq!(
            last_non_empty_line("progress 50%\nvid-123\n\n  \n").as_deref(),
            Some("vid-123")
        );
        assert_eq!(last_non_empty_line("\n \n"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_stage_reports_last_stdout_line_and_sees_env() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stage = sh(
            r#"echo "uploading $BOOKREEL_TITLE by $BOOKREEL_AUTHOR"; echo "id-for-$BOOKREEL_ARTIFACT_RENDER""#,
            None,
        );
        let artifact = stage.run(&ctx(temp.path())).await?;
        assert_eq!(artifact.as_deref(), Some("id-for-video.mp4"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_stage_runs_in_run_directory() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stage = sh("echo done > marker.txt", None);
        let artifact = stage.run(&ctx(temp.path())).await?;
        assert_eq!(artifact, None);
        assert!(temp.path().join("marker.txt").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_stage_maps_exit_codes() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;

        let err = sh("echo quota >&2; exit 1", Some(2))
            .run(&ctx(temp.path()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("quota"));

        let err = sh("echo bad input >&2; exit 2", Some(2))
            .run(&ctx(temp.path()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn missing_program_is_transient() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stage = CommandStage {
            name: "search".into(),
            program: "bookreel-definitely-not-installed".into(),
            args: Vec::new(),
            fatal_exit_code: None,
        };
        let err = stage.run(&ctx(temp.path())).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("spawn stage command"));
        Ok(())
    }
}

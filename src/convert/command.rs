//! Converter delegating to an external program.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::Converter;
use crate::observer::ConvertError;

/// Runs `program args...` with `{source}` and `{output}` substituted.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(command: Vec<String>) -> Result<Self, ConvertError> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or(ConvertError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn expand_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{source}", &source).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        "command"
    }

    async fn convert(&self, source: &Path, output: &Path) -> Result<(), ConvertError> {
        let args = self.expand_args(source, output);
        crate::debug_event!("command", "running", "{} {}", self.program, args.join(" "));

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if result.status.success() {
            Ok(())
        } else {
            Err(ConvertError::CommandFailed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(
            CommandConverter::new(Vec::new()),
            Err(ConvertError::EmptyCommand)
        ));
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let converter = CommandConverter::new(vec![
            "ora2png".into(),
            "--in={source}".into(),
            "{output}".into(),
        ])
        .unwrap();

        let args = converter.expand_args(Path::new("/b/board.ora"), Path::new("/o/board.png"));

        assert_eq!(args, vec!["--in=/b/board.ora", "/o/board.png"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_program_and_reports_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("board.ora");
        let output = dir.path().join("board.png");
        std::fs::write(&source, b"layers").unwrap();

        let copy = CommandConverter::new(vec!["cp".into(), "{source}".into(), "{output}".into()])
            .unwrap();
        copy.convert(&source, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"layers");

        let fail = CommandConverter::new(vec!["false".into()]).unwrap();
        let err = fail.convert(&source, &output).await.unwrap_err();
        assert!(matches!(err, ConvertError::CommandFailed { .. }));
    }
}

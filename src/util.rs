// HANDOFF: Coordinated Service Migration between Cache Replicas on an Emulated Testbed
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Utility module collection of functions

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::Stdio,
};

use itertools::Itertools;
use tokio::{io::AsyncWriteExt, process::Command};

const LOG_CONFIG: &str = "log4rs.yml";

/// Initialize logging from `log4rs.yml` in the working directory. Without that file (e.g., when
/// running from a different directory), log to stderr configured by `RUST_LOG`.
pub fn init_logging() {
    if Path::new(LOG_CONFIG).exists() {
        match log4rs::init_file(LOG_CONFIG, Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("Cannot load {LOG_CONFIG}: {e}. Falling back to env logger."),
        }
    }
    pretty_env_logger::init();
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("IO error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// Standard error output of a command that ran but failed.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            Self::Io { .. } => None,
        }
    }
}

/// Run an external command to completion and return its trimmed stdout.
pub async fn run_command<I, S>(program: &str, args: I) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_command_with_input(program, args, None).await
}

/// Same as `run_command`, but writes `input` to the command's stdin first.
pub async fn run_command_with_input<I, S>(
    program: &str,
    args: I,
    input: Option<&str>,
) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let command = format!(
        "{program} {}",
        args.iter().map(|a| a.to_string_lossy()).join(" ")
    );
    log::trace!("running `{command}`");

    let io_err = |source| CommandError::Io {
        command: command.clone(),
        source,
    };

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    }
    let mut child = cmd.spawn().map_err(io_err)?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await.map_err(io_err)?;
        // dropping stdin closes the pipe
    }

    let output = child.wait_with_output().await.map_err(io_err)?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        log::trace!("`{command}` returned {stdout:?}");
        Ok(stdout)
    } else {
        Err(CommandError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_run_command_stdout() {
        let out = run_command("echo", ["hello", "world"]).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_run_command_with_input() {
        let out = run_command_with_input("cat", Vec::<&str>::new(), Some("in_port=1\n"))
            .await
            .unwrap();
        assert_eq!(out, "in_port=1");
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        let err = run_command("sh", ["-c", "echo broken >&2; exit 3"])
            .await
            .unwrap_err();
        assert_eq!(err.stderr(), Some("broken"));
        assert!(matches!(err, CommandError::Failed { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let err = run_command("this-program-does-not-exist", ["x"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Io { .. }));
    }
}

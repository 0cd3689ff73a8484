//! Orchestration of external tooling
//!
//! Wraps the container builder (buildah) and the playbook executor
//! (ansible-playbook) behind traits so the build flow can be driven by
//! in-process fakes in tests.

mod buildah;
mod executor;
#[cfg(test)]
mod fake;
mod factory;
mod runtime;

pub use buildah::{BuildahBuilder, MIN_UNNAMED_COMMIT_VERSION};
pub use executor::{
    discover_ansible_playbook, AnsibleRunner, PlaybookExecutor, PlaybookRun, ENV_BUILD_ID,
    ENV_DB_PATH, ENV_HOOK_BIN,
};
pub use factory::{create_builder, BuilderBackend};
pub use runtime::ContainerBuilder;

#[cfg(test)]
pub(crate) use fake::FakeBuilder;

use crate::error::{StratumError, StratumResult};
use std::os::unix::fs::MetadataExt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Extract the useful tail of command output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `BUILD_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > BUILD_ERROR_TAIL_LINES {
        lines[total - BUILD_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines. Both pipes are drained concurrently so
/// a chatty child can't block on a full pipe. Lines are read as bytes, so
/// output that isn't valid UTF-8 is kept (lossily) instead of ending the drain.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> StratumResult<Vec<String>> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| StratumError::Internal("child stderr is not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StratumError::Internal("child stdout is not piped".to_string()))?;

    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_reader = BufReader::new(stdout);
    // Partial reads stay in the buffers when the other branch wins the select
    let mut stderr_buf = Vec::new();
    let mut stdout_buf = Vec::new();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            read = stderr_reader.read_until(b'\n', &mut stderr_buf), if !stderr_done => {
                match read.map_err(|e| StratumError::io("reading child stderr", e))? {
                    0 => stderr_done = true,
                    _ => emit_line(&mut stderr_buf, on_output, &mut all_output),
                }
            }
            read = stdout_reader.read_until(b'\n', &mut stdout_buf), if !stdout_done => {
                match read.map_err(|e| StratumError::io("reading child stdout", e))? {
                    0 => stdout_done = true,
                    _ => emit_line(&mut stdout_buf, on_output, &mut all_output),
                }
            }
        }
    }

    Ok(all_output)
}

/// Hand a raw line (without its terminator) to `on_output` and keep it
fn emit_line(buf: &mut Vec<u8>, on_output: &(dyn Fn(String) + Send + Sync), all: &mut Vec<String>) {
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
        if buf[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    on_output(line.clone());
    all.push(line);
}

/// Render a command line for logs and error messages
pub(crate) fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Execute a command and capture its output
pub(crate) async fn exec(program: &str, args: &[String]) -> StratumResult<std::process::Output> {
    let rendered = render_command(program, args);
    debug!("Executing: {}", rendered);

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StratumError::command_failed(rendered, e))
}

/// Execute a command and return its stdout, failing on a non-zero exit
pub(crate) async fn exec_checked(program: &str, args: &[String]) -> StratumResult<String> {
    let output = exec(program, args).await?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StratumError::command_exec(
            render_command(program, args),
            build_error_output(&stdout, &stderr),
        ))
    }
}

/// Whether `program` can be spawned and answers `--version`
pub(crate) async fn command_works(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether the current process runs without root privileges
///
/// `/proc/self` is owned by the effective uid of the process.
pub(crate) fn is_rootless() -> bool {
    std::fs::metadata("/proc/self")
        .map(|meta| meta.uid() != 0)
        .unwrap_or(true)
}

/// Split a command-line fragment into arguments, honouring quotes and backslashes
pub fn split_args(input: &str) -> StratumResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(n @ ('"' | '\\' | '$' | '`')) => current.push(n),
                Some(n) => {
                    current.push('\\');
                    current.push(n);
                }
                None => current.push('\\'),
            },
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(n) = chars.next() {
                    current.push(n);
                }
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(StratumError::User(format!(
            "unterminated quote in arguments: {}",
            input
        )));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

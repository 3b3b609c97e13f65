use std::ffi::OsStr;
use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::Result;
use crate::safety::SafetyInvariantEngine;

#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    /// Combined stdout+stderr, lowercased for signature matching.
    pub fn combined_lower(&self) -> String {
        let mut s = self.stdout.to_ascii_lowercase();
        s.push('\n');
        s.push_str(&self.stderr.to_ascii_lowercase());
        s
    }
}

#[derive(Debug)]
pub enum ToolResult {
    Output(ToolOutput),
    /// The executable is not installed. Callers decide whether that is
    /// fail-open (validation) or a hard failure (extraction).
    NotFound,
}

fn spawn_reader<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run an external tool with a hard wall-clock deadline. The child is
/// killed on expiry and the call reports a timed-out failure instead of
/// blocking. Output pipes are drained on reader threads so a chatty child
/// can never deadlock against a full pipe.
pub fn run_with_timeout<I, S>(program: &str, args: I, timeout: Duration) -> Result<ToolResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    // I8: the timeout is part of the call signature; this logs if excessive.
    SafetyInvariantEngine::subprocess_timeout_declared(Some(timeout));

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("tool '{}' not found on this system", program);
            return Ok(ToolResult::NotFound);
        }
        Err(e) => return Err(e.into()),
    };

    let started = Instant::now();
    let stdout_handle = spawn_reader(child.stdout.take());
    let stderr_handle = spawn_reader(child.stderr.take());

    let status = child.wait_timeout(timeout)?;
    let (success, timed_out, exit_code) = match status {
        Some(status) => (status.success(), false, status.code()),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            (false, true, None)
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let elapsed = started.elapsed();

    debug!(
        "{} finished in {:.1}s (success={}, timed_out={})",
        program,
        elapsed.as_secs_f64(),
        success,
        timed_out
    );

    Ok(ToolResult::Output(ToolOutput {
        success,
        timed_out,
        exit_code,
        stdout,
        stderr,
        elapsed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_reports_not_found() {
        let result =
            run_with_timeout("definitely-not-a-real-tool-9913", ["--version"], Duration::from_secs(5))
                .unwrap();
        assert!(matches!(result, ToolResult::NotFound));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let result = run_with_timeout("sleep", ["30"], Duration::from_millis(200)).unwrap();
        match result {
            ToolResult::Output(out) => {
                assert!(out.timed_out);
                assert!(!out.success);
            }
            ToolResult::NotFound => {} // no sleep binary on this system
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_output_captured() {
        let result = run_with_timeout("echo", ["hello"], Duration::from_secs(5)).unwrap();
        if let ToolResult::Output(out) = result {
            assert!(out.success);
            assert!(out.stdout.contains("hello"));
        }
    }
}

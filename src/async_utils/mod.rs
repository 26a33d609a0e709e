//! Asynchronous utilities for use with Tokio.
//!
//! OCR is CPU-bound and the stores are network-bound, so we keep a small async
//! core and push the heavy lifting onto Tokio's blocking pool. Everything that
//! needs to know about pinning and polling lives in this module.

use std::pin::Pin;

use futures::Stream;

use crate::prelude::*;

pub mod blocking_iter_streams;
pub mod io;
pub mod size_hint;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Standard error may optionally be checked line by line
/// with `is_error_line` to decide whether an otherwise successful command
/// actually failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn successful_command_passes() -> Result<()> {
        let output = Command::new("true").output()?;
        check_for_command_failure("true", &output, None)
    }

    #[test]
    fn failing_command_reports_exit_code() -> Result<()> {
        let output = Command::new("false").output()?;
        let err = check_for_command_failure("false", &output, None)
            .expect_err("false should fail");
        assert!(err.to_string().contains("exit code 1"));
        Ok(())
    }

    #[test]
    fn error_lines_on_stderr_fail_the_command() -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg("echo 'Error: bad xref' >&2")
            .output()?;
        let is_error = |line: &str| line.starts_with("Error");
        assert!(check_for_command_failure("sh", &output, Some(&is_error)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
        Ok(())
    }
}

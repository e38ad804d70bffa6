//! Asynchronous utilities for use with Tokio, plus helpers for the external
//! commands our OCR engines run.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

pub mod io;

/// Matches `tesseract` diagnostics that mean the page could not be read.
pub static UNREADABLE_IMAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(error|can't|cannot) (in )?(read|open|pixReadStream)")
        .expect("failed to compile regex")
});

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `debug`. Standard error
/// may optionally be checked against a regex to detect failures from tools
/// that exit successfully anyway.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    debug!(command_name, output = %stderr, "Standard error from command");

    if output.status.success() {
        if let Some(regex) = error_regex
            && regex.is_match(&stderr)
        {
            return Err(anyhow!("{command_name} printed error output:\n{stderr}"));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{command_name} failed with exit code {exit_code} and error output:\n{stderr}"
        ))
    } else {
        Err(anyhow!("{command_name} failed with error output:\n{stderr}"))
    }
}

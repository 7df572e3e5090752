use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::result::Step;

/// Failure to build the firmware catalog. Cloneable so the one-time load
/// can hand the same error to every caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to load firmware catalog: {0}")]
pub struct CatalogError(pub String);

#[derive(Debug, Error)]
pub enum GdbError {
    #[error("failed to render template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("failed to write script file {}: {source}", path.display())]
    ScriptFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "gdb execution failed for script {script:?} (exit code {exit_code}){}\nstderr: {stderr}",
        reason_suffix(.reason)
    )]
    Execution {
        script: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        reason: Option<String>,
        steps: Vec<Step>,
    },

    #[error(
        "gdb operation timed out for script {script:?} after {timeout:?}\n\
         Hint: increase the timeout or check the device connection"
    )]
    Timeout {
        script: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
        steps: Vec<Step>,
    },

    #[error("gdb operation for script {script:?} was cancelled")]
    Cancelled {
        script: String,
        stdout: String,
        stderr: String,
        steps: Vec<Step>,
    },

    #[error(
        "failed to connect to the debug bridge at {address}: {reason}\n\
         Hint: ensure OpenOCD is running and the device is connected via JTAG"
    )]
    Connection { address: String, reason: String },

    #[error("failed to parse gdb output for script {script:?}, field {field:?}: {reason}")]
    Parse {
        script: String,
        field: String,
        reason: String,
        output: String,
    },

    #[error(
        "unsupported firmware version: {version}\n\
         Known firmware versions:\n{}\n\
         Dump device memory and submit it for analysis to add support for this version.",
        format_versions(.available)
    )]
    FirmwareUnsupported {
        version: String,
        available: Vec<String>,
    },

    #[error(
        "firmware detection confidence too low: {confidence}% ({matches}/{total} signatures matched)\n\
         Detected version: {version} (unverified)\n\
         GDB operations require 100% confidence; wrong function addresses can corrupt device flash."
    )]
    FirmwareConfidence {
        version: String,
        confidence: u32,
        matches: u32,
        total: u32,
    },

    #[error("firmware mismatch: expected {expected} but the device runs {detected}")]
    FirmwareMismatch { expected: String, detected: String },

    #[error("missing prerequisite: {prerequisite}\n{details}")]
    Prerequisite {
        prerequisite: String,
        details: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("certificate error during {operation}: {reason}")]
    Certificate { operation: String, reason: String },

    #[error("gdb memory access error: {0}")]
    MemoryAccess(String),

    #[error("gdb file not found: {0}")]
    FileNotFound(String),

    #[error("gdb communication error: {0}")]
    Communication(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl GdbError {
    pub(crate) fn template(template: &str, reason: impl Into<String>) -> Self {
        GdbError::Template {
            template: template.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn certificate(operation: &str, reason: impl ToString) -> Self {
        GdbError::Certificate {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transcript captured before the process was stopped or failed, if any.
    pub fn partial_stdout(&self) -> Option<&str> {
        match self {
            GdbError::Execution { stdout, .. }
            | GdbError::Timeout { stdout, .. }
            | GdbError::Cancelled { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Steps recovered from a transcript that was cut short.
    pub fn partial_steps(&self) -> &[Step] {
        match self {
            GdbError::Execution { steps, .. }
            | GdbError::Timeout { steps, .. }
            | GdbError::Cancelled { steps, .. } => steps,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GdbError::Timeout { .. })
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

fn format_versions(versions: &[String]) -> String {
    if versions.is_empty() {
        return "  (none)".to_string();
    }
    versions
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_lists_known_versions() {
        let err = GdbError::FirmwareUnsupported {
            version: "0xunknown".to_string(),
            available: vec!["0x355".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("0xunknown"));
        assert!(msg.contains("  - 0x355"));
    }

    #[test]
    fn unsupported_with_empty_catalog() {
        let err = GdbError::FirmwareUnsupported {
            version: "0x1".to_string(),
            available: vec![],
        };
        assert!(err.to_string().contains("(none)"));
    }

    #[test]
    fn execution_error_mentions_exit_code_and_reason() {
        let err = GdbError::Execution {
            script: "inject_certs".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
            reason: Some("killed".to_string()),
            steps: Vec::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains(": killed"));
        assert!(msg.contains("stderr: boom"));
        assert_eq!(err.partial_stdout(), Some(""));
    }

    #[test]
    fn confidence_error_reports_counts() {
        let err = GdbError::FirmwareConfidence {
            version: "0x355".to_string(),
            confidence: 57,
            matches: 4,
            total: 7,
        };
        assert!(err.to_string().contains("confidence too low: 57% (4/7"));
    }
}

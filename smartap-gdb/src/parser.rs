//! Extraction of steps, named values and error signatures from gdb transcripts.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::{
    error::GdbError,
    result::{Step, StepStatus},
};

/// How many lines after a step marker are searched for its outcome.
const STEP_LOOKAHEAD: usize = 3;

static STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d+)/(\d+)\]\s+(.+?)(?:\.\.\.)?\s*$").expect("step pattern is valid")
});
static FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)error|fail|✗|abort").expect("failure pattern is valid"));
static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\w+)\s*[=:]\s*(-?0[xX][0-9a-fA-F]+|-?\d+)\b").expect("assignment pattern is valid")
});
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_]\w*)\s*(?:=|:|->)\s*(.+?)\s*$").expect("key-value pattern is valid")
});

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("{0} not found in output")]
    NotFound(String),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: String, value: String },
}

impl ExtractError {
    /// Attributes the failure to a script so it can be surfaced as a parse error.
    pub fn into_parse_error(self, script: &str, output: &str) -> GdbError {
        let field = match &self {
            ExtractError::NotFound(name) | ExtractError::Invalid { name, .. } => name.clone(),
        };
        GdbError::Parse {
            script: script.to_string(),
            field,
            reason: self.to_string(),
            output: output.to_string(),
        }
    }
}

/// Recognizes `[i/n] description` markers and derives a status for each from
/// the lines that follow it, up to the next marker.
pub fn parse_steps(output: &str) -> Vec<Step> {
    let lines: Vec<&str> = output.lines().collect();
    let mut steps = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = STEP.captures(line.trim()) else {
            continue;
        };
        let (Ok(index), Ok(total)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        let mut step = Step {
            index,
            name: format!("[{index}/{total}] {}", &caps[3]),
            status: StepStatus::Success,
            message: String::new(),
        };

        for next in lines.iter().skip(i + 1).take(STEP_LOOKAHEAD) {
            let next = next.trim();
            if STEP.is_match(next) {
                break;
            }
            if FAILURE.is_match(next) {
                step.status = StepStatus::Failed;
                step.message = next.to_string();
                break;
            }
            if step.message.is_empty() {
                if let Some(assign) = ASSIGNMENT.captures(next) {
                    step.message = format!("{} = {}", &assign[1], &assign[2]);
                }
            }
        }
        steps.push(step);
    }
    steps
}

/// Finds `name = <number>` or `name: <number>` and returns the number.
/// Decimal and `0x` hex are both accepted.
pub fn parse_value(output: &str, name: &str) -> Result<i64, ExtractError> {
    let pattern = format!(
        r"\b{}\s*[=:]\s*(-?0[xX][0-9a-fA-F]+|-?\d+)\b",
        regex::escape(name)
    );
    let re = Regex::new(&pattern).map_err(|_| ExtractError::NotFound(name.to_string()))?;
    let caps = re
        .captures(output)
        .ok_or_else(|| ExtractError::NotFound(name.to_string()))?;
    parse_number(&caps[1]).ok_or_else(|| ExtractError::Invalid {
        name: name.to_string(),
        value: caps[1].to_string(),
    })
}

pub fn parse_file_handle(output: &str) -> Result<i64, ExtractError> {
    parse_value(output, "file_handle")
}

pub fn parse_bytes_written(output: &str) -> Result<i64, ExtractError> {
    parse_value(output, "bytes_written")
}

/// Parses a decimal or `0x`-prefixed hex integer, optionally negative.
pub fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Collects `key = value`, `key: value` and `key -> value` lines. Later keys
/// overwrite earlier ones.
pub fn parse_key_values(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| KEY_VALUE.captures(line))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Maps well-known gdb diagnostics to typed errors.
pub fn detect_errors(output: &str) -> Result<(), GdbError> {
    for line in output.lines() {
        let line = line.trim();
        if line.contains("Cannot access memory at address") {
            return Err(GdbError::MemoryAccess(line.to_string()));
        }
        if line.contains("Connection refused") || line.contains("Connection timed out") {
            return Err(GdbError::Connection {
                address: "unknown".to_string(),
                reason: line.to_string(),
            });
        }
        if line.contains("No such file or directory") {
            return Err(GdbError::FileNotFound(line.to_string()));
        }
        if line.contains("Remote communication error") {
            return Err(GdbError::Communication(line.to_string()));
        }
    }
    Ok(())
}

/// First line mentioning an error, trimmed.
pub fn first_error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Error:") || line.starts_with("ERROR:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INJECT_TRANSCRIPT: &str = "\
[1/6] Halting device...
[2/6] Deleting old certificate...
delete_result: 0
[3/6] Opening file for write...
file_handle: 0x20031000
[4/6] Writing certificate data...
bytes_written: 1508
[5/6] Closing file...
close_result: 0
[6/6] Detaching...
";

    #[test]
    fn steps_are_recognized_in_order() {
        let steps = parse_steps(INJECT_TRANSCRIPT);
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0].name, "[1/6] Halting device");
        assert_eq!(steps[0].index, 1);
        assert_eq!(steps[5].index, 6);
        assert!(steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(steps[3].message, "bytes_written = 1508");
    }

    #[test]
    fn failure_keyword_marks_step_failed() {
        let output = "[1/2] Opening file...\nError: could not open file\n[2/2] Detaching...\n";
        let steps = parse_steps(output);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].message, "Error: could not open file");
        assert_eq!(steps[1].status, StepStatus::Success);
    }

    #[test]
    fn lookahead_stops_at_next_marker() {
        let output = "[1/2] First...\n[2/2] Second...\nERROR\n";
        let steps = parse_steps(output);
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[1].status, StepStatus::Failed);
    }

    #[test]
    fn lookahead_is_bounded() {
        let output = "[1/1] Step...\na\nb\nc\nfailed\n";
        assert_eq!(parse_steps(output)[0].status, StepStatus::Success);
    }

    #[test]
    fn no_markers_no_steps() {
        assert!(parse_steps("Reading symbols...\nDone.\n").is_empty());
    }

    #[test]
    fn named_values() {
        assert_eq!(parse_value(INJECT_TRANSCRIPT, "delete_result"), Ok(0));
        assert_eq!(parse_file_handle(INJECT_TRANSCRIPT), Ok(0x20031000));
        assert_eq!(parse_bytes_written(INJECT_TRANSCRIPT), Ok(1508));
        assert_eq!(parse_value("close_result = -1", "close_result"), Ok(-1));
        assert_eq!(parse_value("$handle = 0x1F", "handle"), Ok(0x1f));
    }

    #[test]
    fn absent_value_is_not_found() {
        assert_eq!(
            parse_value(INJECT_TRANSCRIPT, "bytes_read"),
            Err(ExtractError::NotFound("bytes_read".to_string()))
        );
    }

    #[test]
    fn name_must_match_whole_word() {
        assert!(parse_value("total_bytes_written: 5", "bytes_written").is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x355"), Some(0x355));
        assert_eq!(parse_number("-0x10"), Some(-16));
        assert_eq!(parse_number(" 42 "), Some(42));
        assert_eq!(parse_number("zz"), None);
    }

    #[test]
    fn key_values() {
        let kv = parse_key_values("DETECTED_VERSION=0x355\nCONFIDENCE=100\nMATCHES -> 7\n");
        assert_eq!(kv["DETECTED_VERSION"], "0x355");
        assert_eq!(kv["CONFIDENCE"], "100");
        assert_eq!(kv["MATCHES"], "7");
    }

    #[test]
    fn error_signatures() {
        assert!(matches!(
            detect_errors("Cannot access memory at address 0x20015c64"),
            Err(GdbError::MemoryAccess(_))
        ));
        assert!(matches!(
            detect_errors("localhost:3333: Connection refused."),
            Err(GdbError::Connection { .. })
        ));
        assert!(matches!(
            detect_errors("/tmp/x.gdb: No such file or directory."),
            Err(GdbError::FileNotFound(_))
        ));
        assert!(matches!(
            detect_errors("Remote communication error.  Target disconnected."),
            Err(GdbError::Communication(_))
        ));
        assert!(detect_errors(INJECT_TRANSCRIPT).is_ok());
    }

    #[test]
    fn first_error() {
        let output = "[1/2] x\n  Error: Device not responding\n";
        assert_eq!(first_error_line(output), Some("Error: Device not responding"));
        assert_eq!(first_error_line("fine"), None);
    }

    #[test]
    fn extract_error_becomes_parse_error() {
        let err = ExtractError::NotFound("MATCHES".into()).into_parse_error("detect_firmware", "x");
        match err {
            GdbError::Parse { script, field, .. } => {
                assert_eq!(script, "detect_firmware");
                assert_eq!(field, "MATCHES");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

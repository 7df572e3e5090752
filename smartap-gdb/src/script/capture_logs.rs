use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{hex, Script, VerifiedFirmware};
use crate::{
    error::GdbError,
    parser,
    result::ScriptResult,
    template::Params,
};

const TEMPLATE: &str = include_str!("../../assets/templates/capture_logs.gdb");

static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[LOG\]\s+(\d+):\s+(0x[0-9a-fA-F]+):\s+"([^"]*)""#).expect("log pattern is valid")
});

/// One string passed to the firmware's UART logger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u32,
    pub address: u32,
    pub message: String,
}

/// Log lines in transcript order. Malformed lines are skipped.
pub fn parse_log_entries(output: &str) -> Vec<LogEntry> {
    output
        .lines()
        .filter_map(|line| LOG_LINE.captures(line))
        .filter_map(|caps| {
            Some(LogEntry {
                sequence: caps[1].parse().ok()?,
                address: u32::try_from(parser::parse_number(&caps[2])?).ok()?,
                message: caps[3].to_string(),
            })
        })
        .collect()
}

/// Breaks on the UART logger and prints each message live. The breakpoint
/// address comes from the catalog, so it needs a verified firmware.
pub struct CaptureLogs {
    uart_log: u32,
    max_messages: u32,
}

impl CaptureLogs {
    pub fn new(firmware: &VerifiedFirmware, max_messages: u32) -> Result<Self, GdbError> {
        if max_messages == 0 {
            return Err(GdbError::template("capture_logs", "message limit must be non-zero"));
        }
        Ok(CaptureLogs {
            uart_log: firmware.firmware().functions.uart_log,
            max_messages,
        })
    }
}

impl Script for CaptureLogs {
    fn name(&self) -> &str {
        "capture_logs"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn params(&self) -> Params {
        Params::new()
            .with("UartLog", hex(self.uart_log))
            .with("MaxLogs", self.max_messages)
    }

    fn streaming(&self) -> bool {
        true
    }

    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError> {
        let mut result = ScriptResult::new();
        result.steps = parser::parse_steps(output);

        let entries = parse_log_entries(output);
        result.set("log_count", entries.len());
        if let Some(last) = entries.last() {
            result.set("last_message", last.message.as_str());
        }

        if output.contains("Breakpoint") || output.contains("[2/3]") {
            result.succeed();
        } else {
            result.fail("failed to set up log capture: breakpoint not set");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{firmware::FirmwareCatalog, script::DetectionOutcome};

    const TRANSCRIPT: &str = "\
[1/3] Setting up log capture...
Breakpoint 1 at 0x20014f14
[2/3] Log capture configured...
[3/3] Resuming device...
[LOG] 1: 0x20021a40: \"wlan connected\"
[LOG] 2: 0x20021a58: \"mqtt: connecting to evalve.smartap-tech.com\"
[LOG] x: 0x1: \"bad sequence\"
[LOG] 3: 0x20021a70: \"\"
Captured 3 log messages
";

    fn verified() -> VerifiedFirmware {
        DetectionOutcome::new("0x355", 7, 7)
            .verify(FirmwareCatalog::load().unwrap())
            .unwrap()
    }

    fn script() -> CaptureLogs {
        CaptureLogs::new(&verified(), 3).unwrap()
    }

    #[test]
    fn entries_are_extracted() {
        let entries = parse_log_entries(TRANSCRIPT);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[1],
            LogEntry {
                sequence: 2,
                address: 0x20021a58,
                message: "mqtt: connecting to evalve.smartap-tech.com".to_string(),
            }
        );
        assert_eq!(entries[2].message, "");
    }

    #[test]
    fn parse_counts_logs() {
        let result = script().parse(TRANSCRIPT).unwrap();
        assert!(result.is_success());
        assert_eq!(result.get_int("log_count"), Some(3));
        assert_eq!(result.total_steps(), 3);
    }

    #[test]
    fn missing_breakpoint_fails() {
        let result = script().parse("[1/3] Setting up log capture...\n").unwrap();
        assert!(!result.is_success());
        assert!(result.error().unwrap().contains("breakpoint not set"));
    }

    #[test]
    fn is_streaming() {
        assert!(script().streaming());
        assert_eq!(script().params().get("UartLog").unwrap().to_string(), "0x20014f14");
        assert!(CaptureLogs::new(&verified(), 0).is_err());
    }

    #[test]
    fn breakpoint_follows_verified_build() {
        let catalog = FirmwareCatalog::load().unwrap();
        let verified = verified();
        let script = CaptureLogs::new(&verified, 1).unwrap();
        assert_eq!(script.uart_log, catalog.get("0x355").unwrap().functions.uart_log);
        assert_eq!(script.params().get("MaxLogs").unwrap().to_string(), "1");
        // A partial signature match never yields a VerifiedFirmware to build from.
        assert!(DetectionOutcome::new("0x355", 6, 7).verify(catalog).is_err());
    }
}

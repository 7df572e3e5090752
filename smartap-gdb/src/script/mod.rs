//! Operations: each one renders a gdb script and knows how to read its transcript.

mod capture_logs;
mod detect_firmware;
mod dump_memory;
mod inject_certs;
mod read_file;

pub use capture_logs::{parse_log_entries, CaptureLogs, LogEntry};
pub use detect_firmware::{DetectFirmware, DetectionOutcome, VerifiedFirmware, UNKNOWN_VERSION};
pub use dump_memory::DumpMemory;
pub use inject_certs::{create_mode, InjectCertificate, DEFAULT_TARGET_FILE};
pub use read_file::ReadFile;

use std::path::Path;

use crate::{error::GdbError, result::ScriptResult, template::Params};

/// Parameter naming the host file that holds [`Script::payload`].
pub const PAYLOAD_PARAM: &str = "PayloadFile";

/// A unit of work run through the debugger.
///
/// `params` is everything the template needs except the bridge endpoint
/// (`Host`, `Port`) and the payload path, which the executor supplies.
pub trait Script: Send + Sync {
    fn name(&self) -> &str;
    fn template(&self) -> &str;
    fn params(&self) -> Params;
    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError>;

    /// Output is mirrored live instead of only captured.
    fn streaming(&self) -> bool {
        false
    }

    /// Bytes to stage in a host file for the script to `restore` from.
    fn payload(&self) -> Option<&[u8]> {
        None
    }
}

// The executor only ever sees `&dyn Script`.
fn _assert_object_safe(_: &dyn Script) {}

pub(crate) fn hex(value: u32) -> String {
    format!("0x{value:08x}")
}

/// gdb commands that store `text` as a NUL-terminated string at `address`.
pub(crate) fn stage_string(address: u32, text: &str) -> String {
    text.bytes()
        .chain(std::iter::once(0))
        .zip(address..)
        .map(|(byte, addr)| format!("set {{unsigned char}}0x{addr:08x} = {byte}\n"))
        .collect()
}

/// Rejects text that would break out of a single gdb command line.
pub(crate) fn check_single_line(script: &str, what: &str, text: &str) -> Result<(), GdbError> {
    if text.is_empty() {
        return Err(GdbError::template(script, format!("{what} is empty")));
    }
    if text.chars().any(|c| c.is_control() || matches!(c, '"' | '%' | '\\')) {
        return Err(GdbError::template(
            script,
            format!("{what} {text:?} contains characters gdb cannot take on one line"),
        ));
    }
    Ok(())
}

/// Host paths go on gdb command lines unquoted, so they must be plain text
/// without whitespace.
pub(crate) fn check_host_path<'a>(script: &str, what: &str, path: &'a Path) -> Result<&'a str, GdbError> {
    let text = path
        .to_str()
        .ok_or_else(|| GdbError::template(script, format!("{what} {} is not UTF-8", path.display())))?;
    check_single_line(script, what, text)?;
    if text.chars().any(char::is_whitespace) {
        return Err(GdbError::template(script, format!("{what} {text:?} contains whitespace")));
    }
    Ok(text)
}

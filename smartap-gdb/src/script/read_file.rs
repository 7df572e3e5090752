use std::path::{Path, PathBuf};

use super::{check_host_path, check_single_line, hex, stage_string, Script, VerifiedFirmware};
use crate::{error::GdbError, parser, result::ScriptResult, template::Params};

const TEMPLATE: &str = include_str!("../../assets/templates/read_file.gdb");

/// Copies a file from the device flash filesystem to a host file.
pub struct ReadFile {
    firmware: VerifiedFirmware,
    remote_file: String,
    output_file: PathBuf,
    max_size: u32,
}

impl ReadFile {
    /// `max_size` bounds the read and may not exceed the firmware's work buffer.
    pub fn new(
        firmware: VerifiedFirmware,
        remote_file: impl Into<String>,
        output_file: impl Into<PathBuf>,
        max_size: u32,
    ) -> Result<Self, GdbError> {
        const NAME: &str = "read_file";
        let remote_file = remote_file.into();
        let output_file = output_file.into();
        let memory = &firmware.firmware().memory;

        check_single_line(NAME, "remote file", &remote_file)?;
        if let Some(capacity) = memory.capacity_at(memory.filename_ptr) {
            if remote_file.len() + 1 > capacity as usize {
                return Err(GdbError::template(
                    NAME,
                    format!("remote file name {remote_file:?} exceeds {} bytes", capacity - 1),
                ));
            }
        }
        check_host_path(NAME, "output file", &output_file)?;
        if max_size == 0 {
            return Err(GdbError::template(NAME, "read size must be non-zero"));
        }
        if let Some(capacity) = memory.capacity_at(memory.work_buffer) {
            if max_size > capacity {
                return Err(GdbError::template(
                    NAME,
                    format!("read size {max_size} exceeds the {capacity}-byte work buffer"),
                ));
            }
        }

        Ok(ReadFile {
            firmware,
            remote_file,
            output_file,
            max_size,
        })
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }
}

impl Script for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn params(&self) -> Params {
        let fw = self.firmware.firmware();
        Params::new()
            .with("SlFsOpen", hex(fw.functions.sl_fs_open))
            .with("SlFsRead", hex(fw.functions.sl_fs_read))
            .with("SlFsClose", hex(fw.functions.sl_fs_close))
            .with("WorkBuffer", hex(fw.memory.work_buffer))
            .with("FileHandlePtr", hex(fw.memory.file_handle_ptr))
            .with("FilenamePtr", hex(fw.memory.filename_ptr))
            .with("TokenPtr", hex(fw.memory.token_ptr))
            .with("FilenameSetup", stage_string(fw.memory.filename_ptr, &self.remote_file))
            .with("RemoteFile", self.remote_file.as_str())
            .with("OutputFile", self.output_file.to_string_lossy().into_owned())
            .with("MaxSize", self.max_size)
    }

    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError> {
        let mut result = ScriptResult::new();
        result.steps = parser::parse_steps(output);

        let open_result = parser::parse_value(output, "open_result").ok();
        let bytes_read = parser::parse_value(output, "bytes_read").ok();
        let close_result = parser::parse_value(output, "close_result").ok();
        for (key, value) in [
            ("open_result", open_result),
            ("file_handle", parser::parse_file_handle(output).ok()),
            ("bytes_read", bytes_read),
            ("close_result", close_result),
        ] {
            if let Some(value) = value {
                result.set(key, value);
            }
        }
        result.set("remote_file", self.remote_file.as_str());
        result.set("output_file", self.output_file.to_string_lossy().into_owned());

        let read = bytes_read.unwrap_or(0);
        if output.contains("[SUCCESS]") && read > 0 && close_result == Some(0) {
            result.succeed();
            result.bytes_read = read as u64;
        } else if open_result != Some(0) {
            let code = open_result.map_or_else(|| "none".to_string(), |c| c.to_string());
            result.fail(format!(
                "failed to open file {}: file may not exist (open_result: {code})",
                self.remote_file
            ));
        } else if read <= 0 {
            result.fail(format!("failed to read file: read returned {read} bytes"));
        } else if close_result != Some(0) {
            let code = close_result.map_or_else(|| "none".to_string(), |c| c.to_string());
            result.fail(format!("file close failed: result={code}"));
        } else {
            result.fail("file read operation failed");
        }
        Ok(result)
    }
}

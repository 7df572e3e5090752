use super::{check_single_line, hex, stage_string, Script, VerifiedFirmware};
use crate::{
    error::GdbError,
    parser,
    result::ScriptResult,
    template::Params,
};

const TEMPLATE: &str = include_str!("../../assets/templates/inject_certs.gdb");

/// Where the device looks for its trusted root CA.
pub const DEFAULT_TARGET_FILE: &str = "/cert/129.der";

/// SimpleLink allocation granules, smallest first.
const GRANULES: [usize; 5] = [256, 1024, 4096, 16384, 65536];
const MAX_GRANULE_COUNT: usize = 255;
const ACCESS_OPEN_CREATE: u32 = 3;

/// `sl_FsOpen` access mode that creates a file able to hold `size` bytes:
/// the smallest granule that covers `size` in at most 255 units.
pub fn create_mode(size: usize, flags: u8) -> Option<u32> {
    let (index, granule) = GRANULES
        .iter()
        .enumerate()
        .find(|(_, &granule)| granule * MAX_GRANULE_COUNT >= size)?;
    let count = size.div_ceil(*granule).max(1) as u32;
    Some((ACCESS_OPEN_CREATE << 12) | ((index as u32) << 8) | count | (u32::from(flags) << 16))
}

/// Replaces a file on the device with the certificate bytes.
pub struct InjectCertificate {
    firmware: VerifiedFirmware,
    certificate: Vec<u8>,
    target_file: String,
    open_mode: u32,
}

impl InjectCertificate {
    pub fn new(
        firmware: VerifiedFirmware,
        certificate: Vec<u8>,
        target_file: impl Into<String>,
    ) -> Result<Self, GdbError> {
        const NAME: &str = "inject_certs";
        let target_file = target_file.into();
        let memory = &firmware.firmware().memory;

        if certificate.is_empty() {
            return Err(GdbError::template(NAME, "certificate data is empty"));
        }
        if let Some(capacity) = memory.capacity_at(memory.work_buffer) {
            if certificate.len() > capacity as usize {
                return Err(GdbError::template(
                    NAME,
                    format!(
                        "certificate is {} bytes but the work buffer holds {capacity}",
                        certificate.len()
                    ),
                ));
            }
        }

        check_single_line(NAME, "target file", &target_file)?;
        if let Some(capacity) = memory.capacity_at(memory.filename_ptr) {
            if target_file.len() + 1 > capacity as usize {
                return Err(GdbError::template(
                    NAME,
                    format!("target file name {target_file:?} exceeds {} bytes", capacity - 1),
                ));
            }
        }

        let open_mode = create_mode(certificate.len(), 0).ok_or_else(|| {
            GdbError::template(NAME, format!("no file size granule fits {} bytes", certificate.len()))
        })?;

        Ok(InjectCertificate {
            firmware,
            certificate,
            target_file,
            open_mode,
        })
    }

    pub fn target_file(&self) -> &str {
        &self.target_file
    }
}

impl Script for InjectCertificate {
    fn name(&self) -> &str {
        "inject_certs"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn params(&self) -> Params {
        let fw = self.firmware.firmware();
        Params::new()
            .with("SlFsDel", hex(fw.functions.sl_fs_del))
            .with("SlFsOpen", hex(fw.functions.sl_fs_open))
            .with("SlFsWrite", hex(fw.functions.sl_fs_write))
            .with("SlFsClose", hex(fw.functions.sl_fs_close))
            .with("WorkBuffer", hex(fw.memory.work_buffer))
            .with("FileHandlePtr", hex(fw.memory.file_handle_ptr))
            .with("FilenamePtr", hex(fw.memory.filename_ptr))
            .with("TokenPtr", hex(fw.memory.token_ptr))
            .with("FilenameSetup", stage_string(fw.memory.filename_ptr, &self.target_file))
            .with("TargetFile", self.target_file.as_str())
            .with("CertSize", self.certificate.len())
            .with("OpenMode", hex(self.open_mode))
    }

    fn payload(&self) -> Option<&[u8]> {
        Some(&self.certificate)
    }

    /// Byte accounting decides success; `[SUCCESS]` alone never does.
    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError> {
        let mut result = ScriptResult::new();
        result.steps = parser::parse_steps(output);

        let delete_result = parser::parse_value(output, "delete_result").ok();
        let open_result = parser::parse_value(output, "open_result").ok();
        let file_handle = parser::parse_file_handle(output).ok();
        let bytes_written = parser::parse_bytes_written(output).ok();
        let close_result = parser::parse_value(output, "close_result").ok();

        for (key, value) in [
            ("delete_result", delete_result),
            ("open_result", open_result),
            ("file_handle", file_handle),
            ("bytes_written", bytes_written),
            ("close_result", close_result),
        ] {
            if let Some(value) = value {
                result.set(key, value);
            }
        }
        if let Some(written) = bytes_written.filter(|&n| n > 0) {
            result.bytes_written = written as u64;
        }

        let expected = self.certificate.len() as i64;
        match (bytes_written, close_result) {
            (Some(written), Some(0)) if written == expected => result.succeed(),
            (None, _) if file_handle.is_none() => {
                result.fail("file was never opened: no file_handle in output")
            }
            (Some(written), _) if written != expected => result.fail(format!(
                "bytes written mismatch: expected {expected}, got {written}"
            )),
            (None, _) => result.fail(format!("bytes written mismatch: expected {expected}, got none")),
            (_, Some(code)) => result.fail(format!("file close failed with result: {code}")),
            (_, None) => result.fail("file close result missing from output"),
        }

        if output.contains("[FAILED]") {
            let error = result
                .error()
                .unwrap_or("certificate injection failed (see gdb output)")
                .to_string();
            result.fail(error);
        }
        if let Some(line) = output.lines().map(str::trim).find(|l| l.contains("Error:")) {
            result.fail(line);
        }

        Ok(result)
    }
}

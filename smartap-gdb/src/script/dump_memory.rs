use std::path::{Path, PathBuf};

use super::{check_host_path, hex, Script};
use crate::{error::GdbError, parser, result::ScriptResult, template::Params};

const TEMPLATE: &str = include_str!("../../assets/templates/dump_memory.gdb");

/// Copies `size` bytes of device memory starting at `start` into a host file.
pub struct DumpMemory {
    start: u32,
    size: u32,
    output_file: PathBuf,
}

impl DumpMemory {
    pub fn new(start: u32, size: u32, output_file: impl Into<PathBuf>) -> Result<Self, GdbError> {
        const NAME: &str = "dump_memory";
        let output_file = output_file.into();
        if size == 0 {
            return Err(GdbError::template(NAME, "dump size must be non-zero"));
        }
        if u64::from(start) + u64::from(size) > 1 << 32 {
            return Err(GdbError::template(
                NAME,
                format!("{size} bytes from {} runs past the end of the address space", hex(start)),
            ));
        }
        check_host_path(NAME, "output file", &output_file)?;
        Ok(DumpMemory {
            start,
            size,
            output_file,
        })
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }
}

impl Script for DumpMemory {
    fn name(&self) -> &str {
        "dump_memory"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn params(&self) -> Params {
        Params::new()
            .with("StartAddress", hex(self.start))
            .with("EndAddress", format!("0x{:08x}", self.end()))
            .with("Size", self.size)
            .with("OutputFile", self.output_file.to_string_lossy().into_owned())
    }

    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError> {
        let mut result = ScriptResult::new();
        result.steps = parser::parse_steps(output);

        if output.contains("[SUCCESS]") {
            result.succeed();
            result.bytes_read = self.size.into();
            result.set("start_address", self.start);
            result.set("size", self.size);
            result.set("output_file", self.output_file.to_string_lossy().into_owned());
        } else if output.contains("Cannot access memory") {
            result.fail(format!(
                "cannot access memory at {}: address may be invalid or not accessible",
                hex(self.start)
            ));
        } else if let Some(line) = output
            .lines()
            .map(str::trim)
            .find(|line| line.to_lowercase().contains("error"))
        {
            result.fail(format!("memory dump failed: {line}"));
        } else {
            result.fail("memory dump failed: success marker not found");
        }
        Ok(result)
    }
}

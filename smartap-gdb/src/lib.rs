//! Remote procedure calls into CC3200 firmware through gdb and a JTAG bridge.
//!
//! An [`Executor`] renders a [`Script`], runs `gdb` on it against the
//! debug-server bridge, and parses the transcript into a [`ScriptResult`].
//! Operations that call firmware functions can only be built from a
//! [`VerifiedFirmware`], which detection hands out at 100% confidence.

pub mod certs;
pub mod context;
pub mod error;
pub mod executor;
pub mod firmware;
pub mod inject;
pub mod parser;
pub mod prerequisites;
pub mod result;
pub mod script;
pub mod template;

pub use context::Context;
pub use error::{CatalogError, GdbError};
pub use executor::{Executor, OutputSink};
pub use firmware::{Firmware, FirmwareCatalog};
pub use result::{ScriptResult, Step, StepStatus, Value};
pub use script::{
    CaptureLogs, DetectFirmware, DetectionOutcome, DumpMemory, InjectCertificate, ReadFile, Script,
    VerifiedFirmware,
};

mod default;

use std::{io::Read, path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Config describes how to reach the device through the debugger. It has
/// two halves: the local debugger binary and the remote debug-server bridge.
///
/// The debugger half names the `gdb` binary to launch, how long a single
/// script may run, and where rendered scripts are written before launch.
/// The bridge half is the TCP endpoint the rendered script connects to with
/// `target extended-remote`; nothing in this crate talks to it directly.
///
/// A Config is immutable once handed to an executor. It is not validated on
/// load: a missing binary or an unwritable scratch directory is reported by
/// the prerequisite checks, not by the parser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to the debugger binary. A bare name is looked up on `PATH`.
    #[serde(default = "default::gdb_path")]
    pub gdb_path: PathBuf,
    /// Host of the debug-server bridge.
    #[serde(default = "default::host")]
    pub host: String,
    /// Port of the debug-server bridge.
    #[serde(default = "default::port")]
    pub port: u16,
    /// Maximum wall-clock time for one script, in seconds.
    #[serde(default = "default::timeout_secs")]
    pub timeout_secs: u64,
    /// Directory for rendered scripts and their payload files.
    #[serde(default = "default::work_dir")]
    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gdb_path: default::gdb_path(),
            host: default::host(),
            port: default::port(),
            timeout_secs: default::timeout_secs(),
            work_dir: default::work_dir(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The bridge endpoint as `host:port`.
    pub fn bridge_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load_config(reader: impl Read) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_reader(reader)
}

/// JSON schema of the config file, for editor integration.
pub fn config_schema() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&schemars::schema_for!(Config))
}

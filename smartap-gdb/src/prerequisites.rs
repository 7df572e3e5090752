//! Startup checks: the debugger binary, the bridge, and the scratch directory.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use smartap_config::Config;
use tokio::{net::TcpStream, process::Command};
use uuid::Uuid;

use crate::error::GdbError;

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

const INSTALL_HINT: &str = "Install on macOS: brew install --cask gcc-arm-embedded\n\
     Install on Linux: sudo apt-get install gdb-multiarch && ln -s /usr/bin/gdb-multiarch /usr/local/bin/arm-none-eabi-gdb";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrerequisiteCheck {
    pub name: String,
    pub available: bool,
    /// A missing optional prerequisite is reported but does not fail the report.
    pub required: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrerequisiteReport {
    pub checks: Vec<PrerequisiteCheck>,
}

impl PrerequisiteReport {
    pub fn all_available(&self) -> bool {
        self.checks.iter().all(|c| c.available || !c.required)
    }
}

impl fmt::Display for PrerequisiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GDB Prerequisites Check:")?;
        writeln!(f, "{}\n", "━".repeat(42))?;
        for check in &self.checks {
            let mark = if check.available { '✓' } else { '✗' };
            writeln!(f, "{mark} {}", check.name)?;
            if check.available {
                if let Some(version) = &check.version {
                    writeln!(f, "  Version: {version}")?;
                }
                if let Some(path) = &check.path {
                    writeln!(f, "  Path: {}", path.display())?;
                }
            }
            for line in check.message.lines() {
                writeln!(f, "  {line}")?;
            }
            writeln!(f)?;
        }
        if self.all_available() {
            writeln!(f, "All required prerequisites are available.")
        } else {
            writeln!(f, "Some prerequisites are missing. Please install them before proceeding.")
        }
    }
}

pub fn format_report(report: &PrerequisiteReport) -> String {
    report.to_string()
}

pub async fn validate_prerequisites(config: &Config) -> PrerequisiteReport {
    PrerequisiteReport {
        checks: vec![
            check_debugger(&config.gdb_path).await,
            check_bridge(&config.host, config.port).await,
            check_scratch_dir(&config.work_dir),
        ],
    }
}

/// Resolves a bare program name through `PATH`; anything with a directory
/// part is taken as given.
pub fn find_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn debugger_error(details: String, source: Option<io::Error>) -> GdbError {
    GdbError::Prerequisite {
        prerequisite: "arm-none-eabi-gdb".to_string(),
        details,
        source,
    }
}

/// Runs `<gdb> --version` and returns the first line of its banner.
pub async fn validate_debugger_path(gdb_path: &Path) -> Result<String, GdbError> {
    if gdb_path.as_os_str().is_empty() {
        return Err(debugger_error("GDB path is empty".to_string(), None));
    }
    let version = Command::new(gdb_path)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(CHECK_TIMEOUT, version).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(debugger_error(
                format!("Failed to execute {} --version", gdb_path.display()),
                Some(e),
            ))
        }
        Err(_) => {
            return Err(debugger_error(
                format!("{} --version did not finish within {CHECK_TIMEOUT:?}", gdb_path.display()),
                None,
            ))
        }
    };

    let banner = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() || !banner.contains("GNU gdb") {
        return Err(debugger_error(
            format!("{} does not appear to be GNU GDB", gdb_path.display()),
            None,
        ));
    }
    let version = banner.lines().next().unwrap_or_default().trim().to_string();
    debug!("Found debugger {}: {version}", gdb_path.display());
    Ok(version)
}

pub async fn check_debugger(gdb_path: &Path) -> PrerequisiteCheck {
    let mut check = PrerequisiteCheck {
        name: gdb_path.display().to_string(),
        available: false,
        required: true,
        path: None,
        version: None,
        message: String::new(),
    };

    let Some(resolved) = find_executable(gdb_path) else {
        check.message = format!("{} not found in PATH\n{INSTALL_HINT}", gdb_path.display());
        return check;
    };
    match validate_debugger_path(&resolved).await {
        Ok(version) => {
            check.available = true;
            check.version = Some(version);
            check.message = format!("Found at {}", resolved.display());
        }
        Err(e) => check.message = e.to_string(),
    }
    check.path = Some(resolved);
    check
}

/// Dials the bridge and hangs up.
pub async fn validate_bridge_connection(host: &str, port: u16) -> Result<(), GdbError> {
    let address = format!("{host}:{port}");
    let reason = match tokio::time::timeout(CHECK_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer within {CHECK_TIMEOUT:?}"),
    };
    Err(GdbError::Connection { address, reason })
}

pub async fn check_bridge(host: &str, port: u16) -> PrerequisiteCheck {
    let address = format!("{host}:{port}");
    let (available, message) = match validate_bridge_connection(host, port).await {
        Ok(()) => (true, format!("Connected successfully to {address}")),
        Err(_) => (
            false,
            format!(
                "Cannot connect to OpenOCD at {address}\n\
                 This is not fatal, but GDB operations will fail.\n\
                 Ensure OpenOCD is running: openocd -f <your-config.cfg>"
            ),
        ),
    };
    PrerequisiteCheck {
        name: "OpenOCD Connection".to_string(),
        available,
        required: false,
        path: None,
        version: None,
        message,
    }
}

/// Creates and removes a scratch file in `dir`.
pub fn validate_scratch_dir(dir: &Path) -> Result<(), GdbError> {
    let marker = dir.join(format!(".smartap-gdb-check-{}", Uuid::new_v4().simple()));
    let written = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
        .and_then(|mut file| file.write_all(b"check"));
    let _ = fs::remove_file(&marker);
    written.map_err(|e| GdbError::Prerequisite {
        prerequisite: "scratch directory".to_string(),
        details: format!("{} is not writable", dir.display()),
        source: Some(e),
    })
}

pub fn check_scratch_dir(dir: &Path) -> PrerequisiteCheck {
    let (available, message) = match validate_scratch_dir(dir) {
        Ok(()) => (true, "Writable".to_string()),
        Err(e) => (false, e.to_string()),
    };
    PrerequisiteCheck {
        name: "Scratch directory".to_string(),
        available,
        required: true,
        path: Some(dir.to_path_buf()),
        version: None,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_debugger_is_a_prerequisite_error() {
        let err = validate_debugger_path(Path::new("/nonexistent/arm-none-eabi-gdb"))
            .await
            .unwrap_err();
        assert!(matches!(err, GdbError::Prerequisite { .. }));
        assert!(validate_debugger_path(Path::new("")).await.is_err());

        let check = check_debugger(Path::new("smartap-no-such-gdb")).await;
        assert!(!check.available);
        assert!(check.message.contains("not found in PATH"));
    }

    #[tokio::test]
    async fn bridge_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(validate_bridge_connection("127.0.0.1", port).await.is_ok());
        let check = check_bridge("127.0.0.1", port).await;
        assert!(check.available);

        drop(listener);
        let err = validate_bridge_connection("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, GdbError::Connection { .. }));
        let check = check_bridge("127.0.0.1", port).await;
        assert!(!check.available);
        assert!(!check.required);
    }

    #[test]
    fn scratch_dir_write_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_scratch_dir(dir.path()).is_ok());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(validate_scratch_dir(Path::new("/nonexistent/scratch")).is_err());
        assert!(!check_scratch_dir(Path::new("/nonexistent/scratch")).available);
    }

    #[test]
    fn report_formatting() {
        let report = PrerequisiteReport {
            checks: vec![
                PrerequisiteCheck {
                    name: "arm-none-eabi-gdb".to_string(),
                    available: true,
                    required: true,
                    path: Some(PathBuf::from("/usr/bin/arm-none-eabi-gdb")),
                    version: Some("GNU gdb (Arm GNU Toolchain) 13.2".to_string()),
                    message: "Found at /usr/bin/arm-none-eabi-gdb".to_string(),
                },
                PrerequisiteCheck {
                    name: "OpenOCD Connection".to_string(),
                    available: false,
                    required: false,
                    path: None,
                    version: None,
                    message: "Cannot connect".to_string(),
                },
            ],
        };
        assert!(report.all_available());
        let text = format_report(&report);
        assert!(text.contains("✓ arm-none-eabi-gdb\n  Version: GNU gdb"));
        assert!(text.contains("✗ OpenOCD Connection\n  Cannot connect"));
        assert!(text.ends_with("All required prerequisites are available.\n"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_programs_on_path() {
        assert!(find_executable(Path::new("sh")).is_some());
        assert!(find_executable(Path::new("/bin/sh")).is_some());
        assert!(find_executable(Path::new("/nonexistent/sh")).is_none());
    }
}

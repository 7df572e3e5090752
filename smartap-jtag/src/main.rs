use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use log::info;
use smartap_config::{load_config, Config};
use smartap_gdb::{
    inject::identify_firmware, prerequisites::validate_prerequisites, CaptureLogs, Context,
    DetectFirmware, DetectionOutcome, DumpMemory, Executor, FirmwareCatalog, ReadFile,
    ScriptResult, StepStatus, VerifiedFirmware,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the debugger/bridge configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the debugger, the bridge and the scratch directory
    Check,
    /// List the firmware versions in the catalog
    Firmwares,
    /// Identify the firmware on the connected device
    Detect,
    /// Dump a range of device memory to a host file
    Dump {
        /// Start address, decimal or 0x-prefixed
        #[arg(value_parser = parse_address)]
        start: u32,
        /// Number of bytes
        #[arg(value_parser = parse_address)]
        size: u32,
        /// Host file to write
        output: PathBuf,
    },
    /// Copy a file from the device flash to the host
    Read {
        /// File on the device, e.g. /cert/129.der
        remote: String,
        /// Host file to write
        output: PathBuf,
        /// Largest number of bytes to read
        #[arg(long, default_value_t = 4096)]
        max_size: u32,
    },
    /// Print UART log messages as the device emits them
    Logs {
        /// Stop after this many messages
        #[arg(short = 'n', long, default_value_t = 100)]
        count: u32,
    },
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number {text:?}: {e}"))
}

fn read_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let file = File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
    load_config(file).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_result(result: &ScriptResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    for step in &result.steps {
        let mark = match step.status {
            StepStatus::Success => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Pending => "…".yellow(),
        };
        println!("{mark} {}", step.name);
        if !step.message.is_empty() {
            println!("    {}", step.message.dimmed());
        }
    }
    for (key, value) in &result.data {
        println!("  {}: {value}", key.bold());
    }
    match result.error() {
        None => println!("{} in {:?}", "Success".green().bold(), result.duration),
        Some(error) => println!("{}: {error}", "Failed".red().bold()),
    }
    Ok(())
}

/// The detection result as a verified catalog entry. Anything short of a
/// full signature match is an error so the exit status reflects it.
fn require_verified(result: &ScriptResult, catalog: &FirmwareCatalog) -> Result<VerifiedFirmware> {
    if let Some(error) = result.error() {
        bail!("firmware detection failed: {error}");
    }
    let Some(outcome) = DetectionOutcome::from_result(result) else {
        bail!("firmware detection produced no outcome");
    };
    outcome
        .verify(catalog)
        .context("firmware is not safe for function calls")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = read_config(cli.config.as_ref())?;

    let ctx = Context::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping gdb");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Check => {
            let report = validate_prerequisites(&config).await;
            print!("{report}");
            if !report.all_available() {
                bail!("prerequisites missing");
            }
        }
        Commands::Firmwares => {
            let catalog = FirmwareCatalog::load()?;
            for firmware in catalog.list() {
                println!("{}", firmware.to_string().bold());
                println!("{}", firmware.format_addresses());
            }
        }
        Commands::Detect => {
            let catalog = FirmwareCatalog::load()?;
            let executor = Executor::new(config);
            executor.validate_config().await?;
            let result = executor
                .execute(&ctx, &DetectFirmware::from_catalog(catalog)?)
                .await?;
            print_result(&result, cli.json)?;
            let verified = require_verified(&result, catalog)?;
            info!("Verified firmware {}", verified.firmware());
        }
        Commands::Dump {
            start,
            size,
            output,
        } => {
            let executor = Executor::new(config);
            executor.validate_config().await?;
            let result = executor
                .execute(&ctx, &DumpMemory::new(start, size, output)?)
                .await?;
            print_result(&result, cli.json)?;
            if !result.is_success() {
                bail!("memory dump failed");
            }
        }
        Commands::Read {
            remote,
            output,
            max_size,
        } => {
            let executor = Executor::new(config);
            executor.validate_config().await?;
            let firmware = identify_firmware(&executor, &ctx).await?;
            let script = ReadFile::new(firmware, remote, output, max_size)?;
            let result = executor.execute(&ctx, &script).await?;
            print_result(&result, cli.json)?;
            if !result.is_success() {
                bail!("file read failed");
            }
        }
        Commands::Logs { count } => {
            let executor = Executor::new(config);
            executor.validate_config().await?;
            let firmware = identify_firmware(&executor, &ctx).await?;
            let script = CaptureLogs::new(&firmware, count)?;
            let result = executor.execute(&ctx, &script).await?;
            print_result(&result, cli.json)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(version: &str, matches: i64, total: i64) -> ScriptResult {
        let mut result = ScriptResult::new();
        result.set("version", version);
        result.set("matches", matches);
        result.set("total", total);
        result.succeed();
        result
    }

    #[test]
    fn partial_match_is_an_error() {
        let catalog = FirmwareCatalog::load().unwrap();
        let err = require_verified(&detection("0x355", 4, 7), catalog).unwrap_err();
        assert!(err.to_string().contains("not safe"), "{err:#}");
        assert!(format!("{err:#}").contains("57"), "{err:#}");
    }

    #[test]
    fn unknown_and_missing_outcomes_are_errors() {
        let catalog = FirmwareCatalog::load().unwrap();
        assert!(require_verified(&detection("unknown", 0, 0), catalog).is_err());
        assert!(require_verified(&ScriptResult::new(), catalog).is_err());

        let mut failed = detection("0x355", 7, 7);
        failed.fail("gdb lost the target");
        let err = require_verified(&failed, catalog).unwrap_err();
        assert!(err.to_string().contains("gdb lost the target"));
    }

    #[test]
    fn full_match_is_verified() {
        let catalog = FirmwareCatalog::load().unwrap();
        let verified = require_verified(&detection("0x355", 7, 7), catalog).unwrap();
        assert_eq!(verified.firmware().version, "0x355");
    }
}

//! The catalog of known CC3200 firmware builds and their SimpleLink entry points.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use log::debug;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, GdbError};

const CATALOG_YAML: &str = include_str!("../assets/firmwares.yaml");

static CATALOG: OnceCell<Result<FirmwareCatalog, CatalogError>> = OnceCell::new();

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub verified: bool,
    pub functions: FirmwareFunctions,
    pub memory: FirmwareMemory,
    #[serde(default)]
    pub notes: String,
}

/// Entry points of the SimpleLink file-system API plus the UART logger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareFunctions {
    #[serde(rename = "sl_FsOpen")]
    pub sl_fs_open: u32,
    #[serde(rename = "sl_FsRead")]
    pub sl_fs_read: u32,
    #[serde(rename = "sl_FsWrite")]
    pub sl_fs_write: u32,
    #[serde(rename = "sl_FsClose")]
    pub sl_fs_close: u32,
    #[serde(rename = "sl_FsDel")]
    pub sl_fs_del: u32,
    #[serde(rename = "sl_FsGetInfo")]
    pub sl_fs_get_info: u32,
    pub uart_log: u32,
    /// First two instruction words at each function, keyed by function name.
    #[serde(default)]
    pub signatures: BTreeMap<String, [u32; 2]>,
}

impl FirmwareFunctions {
    pub const NAMES: [&'static str; 7] = [
        "sl_FsOpen",
        "sl_FsRead",
        "sl_FsWrite",
        "sl_FsClose",
        "sl_FsDel",
        "sl_FsGetInfo",
        "uart_log",
    ];

    pub fn address(&self, name: &str) -> Option<u32> {
        match name {
            "sl_FsOpen" => Some(self.sl_fs_open),
            "sl_FsRead" => Some(self.sl_fs_read),
            "sl_FsWrite" => Some(self.sl_fs_write),
            "sl_FsClose" => Some(self.sl_fs_close),
            "sl_FsDel" => Some(self.sl_fs_del),
            "sl_FsGetInfo" => Some(self.sl_fs_get_info),
            "uart_log" => Some(self.uart_log),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        Self::NAMES
            .into_iter()
            .filter_map(|name| self.address(name).map(|addr| (name, addr)))
    }
}

/// RAM locations the scripts use as scratch space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareMemory {
    pub work_buffer: u32,
    pub file_handle_ptr: u32,
    pub filename_ptr: u32,
    pub token_ptr: u32,
    pub stack_base: u32,
}

impl FirmwareMemory {
    /// Bytes available at `start` before the next known scratch location.
    pub fn capacity_at(&self, start: u32) -> Option<u32> {
        [
            self.work_buffer,
            self.file_handle_ptr,
            self.filename_ptr,
            self.token_ptr,
            self.stack_base,
        ]
        .into_iter()
        .filter(|&addr| addr > start)
        .min()
        .map(|next| next - start)
    }
}

/// One signature comparison the detection script performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureCheck {
    pub function: &'static str,
    pub address: u32,
    pub words: [u32; 2],
}

impl Firmware {
    /// Signature checks in a stable order, skipping functions without one.
    pub fn signature_checks(&self) -> Vec<SignatureCheck> {
        self.functions
            .iter()
            .filter_map(|(function, address)| {
                self.functions
                    .signatures
                    .get(function)
                    .map(|&words| SignatureCheck {
                        function,
                        address,
                        words,
                    })
            })
            .collect()
    }

    pub fn format_addresses(&self) -> String {
        let mut out = String::from("Function Addresses:\n");
        for (name, addr) in self.functions.iter() {
            out.push_str(&format!("  {:<13} 0x{addr:08x}\n", format!("{name}:")));
        }
        out.push_str("\nMemory Locations:\n");
        let memory = [
            ("work_buffer", self.memory.work_buffer),
            ("file_handle_ptr", self.memory.file_handle_ptr),
            ("filename_ptr", self.memory.filename_ptr),
            ("token_ptr", self.memory.token_ptr),
            ("stack_base", self.memory.stack_base),
        ];
        for (name, addr) in memory {
            out.push_str(&format!("  {:<16} 0x{addr:08x}\n", format!("{name}:")));
        }
        out
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.version, self.name)?;
        if self.verified {
            f.write_str(" (verified)")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    firmwares: Vec<Firmware>,
}

/// Known firmware builds, in catalog order.
#[derive(Clone, Debug)]
pub struct FirmwareCatalog {
    firmwares: Vec<Firmware>,
    by_version: HashMap<String, usize>,
}

impl FirmwareCatalog {
    /// The embedded catalog. Parsed once per process; every caller gets the
    /// same instance, or the same error.
    pub fn load() -> Result<&'static FirmwareCatalog, CatalogError> {
        CATALOG
            .get_or_init(|| {
                debug!("Loading embedded firmware catalog");
                Self::from_yaml(CATALOG_YAML)
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_yaml::from_str(yaml).map_err(|e| CatalogError(e.to_string()))?;

        let mut by_version = HashMap::with_capacity(file.firmwares.len());
        for (index, firmware) in file.firmwares.iter().enumerate() {
            if by_version.insert(firmware.version.clone(), index).is_some() {
                return Err(CatalogError(format!(
                    "duplicate firmware version {}",
                    firmware.version
                )));
            }
            if let Some(name) = firmware
                .functions
                .signatures
                .keys()
                .find(|name| firmware.functions.address(name).is_none())
            {
                return Err(CatalogError(format!(
                    "firmware {} has a signature for unknown function {name}",
                    firmware.version
                )));
            }
        }

        Ok(FirmwareCatalog {
            firmwares: file.firmwares,
            by_version,
        })
    }

    pub fn get(&self, version: &str) -> Option<&Firmware> {
        self.by_version.get(version).map(|&index| &self.firmwares[index])
    }

    pub fn list(&self) -> &[Firmware] {
        &self.firmwares
    }

    pub fn versions(&self) -> Vec<String> {
        self.firmwares.iter().map(|fw| fw.version.clone()).collect()
    }

    pub fn verified(&self) -> Vec<&Firmware> {
        self.firmwares.iter().filter(|fw| fw.verified).collect()
    }

    pub fn count(&self) -> usize {
        self.firmwares.len()
    }

    /// Error for a version that has no usable catalog entry.
    pub fn unsupported(&self, version: &str) -> GdbError {
        GdbError::FirmwareUnsupported {
            version: version.to_string(),
            available: self.versions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> &'static FirmwareCatalog {
        FirmwareCatalog::load().expect("embedded catalog loads")
    }

    #[test]
    fn embedded_catalog_has_0x355() {
        let fw = catalog().get("0x355").expect("0x355 present");
        assert_eq!(fw.name, "CC3200 ServicePack 1.32.0");
        assert!(fw.verified);
        assert_eq!(fw.functions.sl_fs_open, 0x20015c64);
        assert_eq!(fw.functions.sl_fs_read, 0x20014b54);
        assert_eq!(fw.functions.sl_fs_write, 0x20014bf8);
        assert_eq!(fw.functions.sl_fs_close, 0x2001555c);
        assert_eq!(fw.functions.sl_fs_del, 0x20016ea8);
        assert_eq!(fw.functions.sl_fs_get_info, 0x2001590c);
        assert_eq!(fw.functions.uart_log, 0x20014f14);
        assert_eq!(fw.memory.work_buffer, 0x20030000);
        assert_eq!(fw.memory.file_handle_ptr, 0x20031000);
        assert_eq!(fw.memory.filename_ptr, 0x20031004);
        assert_eq!(fw.memory.token_ptr, 0x20031020);
        assert_eq!(fw.memory.stack_base, 0x20031d00);
    }

    #[test]
    fn every_function_has_a_signature() {
        let fw = catalog().get("0x355").unwrap();
        assert_eq!(fw.functions.signatures.len(), 7);
        let checks = fw.signature_checks();
        assert_eq!(checks.len(), 7);
        assert_eq!(checks[0].function, "sl_FsOpen");
        assert_eq!(checks[0].words, [0x4606b570, 0x78004818]);
        assert_eq!(checks[6].function, "uart_log");
        assert_eq!(checks[6].words, [0x1c04b510, 0xe003d007]);
    }

    #[test]
    fn load_returns_same_instance() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| FirmwareCatalog::load().unwrap() as *const _ as usize))
            .collect();
        let first = catalog() as *const _ as usize;
        for handle in handles {
            assert_eq!(handle.join().unwrap(), first);
        }
    }

    #[test]
    fn lookups() {
        let catalog = catalog();
        assert!(catalog.get("0x999").is_none());
        assert_eq!(catalog.versions(), vec!["0x355".to_string()]);
        assert_eq!(catalog.count(), catalog.list().len());
        assert_eq!(catalog.verified().len(), 1);
    }

    #[test]
    fn display_and_addresses() {
        let fw = catalog().get("0x355").unwrap();
        assert_eq!(fw.to_string(), "0x355 - CC3200 ServicePack 1.32.0 (verified)");
        let text = fw.format_addresses();
        assert!(text.contains("sl_FsOpen:    0x20015c64"));
        assert!(text.contains("stack_base:      0x20031d00"));
    }

    #[test]
    fn unverified_display() {
        let mut fw = catalog().get("0x355").unwrap().clone();
        fw.verified = false;
        assert_eq!(fw.to_string(), "0x355 - CC3200 ServicePack 1.32.0");
    }

    #[test]
    fn capacity_between_scratch_locations() {
        let memory = &catalog().get("0x355").unwrap().memory;
        assert_eq!(memory.capacity_at(memory.work_buffer), Some(0x1000));
        assert_eq!(memory.capacity_at(memory.filename_ptr), Some(0x1c));
        assert_eq!(memory.capacity_at(memory.stack_base), None);
    }

    #[test]
    fn signatures_are_optional() {
        let yaml = r#"
firmwares:
  - version: "0x1"
    name: test
    functions: { sl_FsOpen: 1, sl_FsRead: 2, sl_FsWrite: 3, sl_FsClose: 4, sl_FsDel: 5, sl_FsGetInfo: 6, uart_log: 7 }
    memory: { work_buffer: 16, file_handle_ptr: 32, filename_ptr: 36, token_ptr: 64, stack_base: 128 }
"#;
        let catalog = FirmwareCatalog::from_yaml(yaml).unwrap();
        let fw = catalog.get("0x1").unwrap();
        assert!(!fw.verified);
        assert!(fw.signature_checks().is_empty());
    }

    #[test]
    fn malformed_catalogs_are_rejected() {
        assert!(FirmwareCatalog::from_yaml("firmwares: [ { version: 1 } ]").is_err());
        assert!(FirmwareCatalog::from_yaml("not: a catalog").is_err());

        let duplicate = format!("firmwares:\n{}{}", ENTRY, ENTRY);
        assert!(FirmwareCatalog::from_yaml(&duplicate)
            .unwrap_err()
            .0
            .contains("duplicate"));

        let unknown = format!(
            "firmwares:\n{ENTRY}      signatures: {{ sl_FsFormat: [1, 2] }}\n"
        );
        assert!(FirmwareCatalog::from_yaml(&unknown).is_err());
    }

    const ENTRY: &str = "  - version: \"0x2\"
    name: dup
    memory: { work_buffer: 16, file_handle_ptr: 32, filename_ptr: 36, token_ptr: 64, stack_base: 128 }
    functions:
      sl_FsOpen: 1
      sl_FsRead: 2
      sl_FsWrite: 3
      sl_FsClose: 4
      sl_FsDel: 5
      sl_FsGetInfo: 6
      uart_log: 7
";

    #[test]
    fn unsupported_error_lists_versions() {
        match catalog().unsupported("0x999") {
            GdbError::FirmwareUnsupported { version, available } => {
                assert_eq!(version, "0x999");
                assert_eq!(available, vec!["0x355".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

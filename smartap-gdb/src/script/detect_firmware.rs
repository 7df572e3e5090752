use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::{hex, Script};
use crate::{
    error::GdbError,
    firmware::{Firmware, FirmwareCatalog},
    parser,
    result::{ScriptResult, StepStatus},
    template::Params,
};

const TEMPLATE: &str = include_str!("../../assets/templates/detect_firmware.gdb");

/// Reported when no signature matched any candidate.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Confidence at which a partial match is still reported as a plausible guess.
const MEDIUM_CONFIDENCE: u32 = 85;

/// How well the device matched its best firmware candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub version: String,
    pub matches: u32,
    pub total: u32,
    pub confidence: u32,
}

impl DetectionOutcome {
    /// Confidence is `round(100 * matches / total)`. No matches, or a
    /// version reported as `0`, yields [`UNKNOWN_VERSION`].
    pub fn new(version: &str, matches: u32, total: u32) -> Self {
        let matches = matches.min(total);
        let confidence = if total == 0 {
            0
        } else {
            let (m, t) = (u64::from(matches), u64::from(total));
            ((200 * m + t) / (2 * t)) as u32
        };
        let version = if matches == 0 || is_unknown_version(version) {
            UNKNOWN_VERSION.to_string()
        } else {
            version.to_string()
        };
        DetectionOutcome {
            version,
            matches,
            total,
            confidence,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.version == UNKNOWN_VERSION
    }

    /// Only a full match authorizes function calls on the device.
    pub fn is_certain(&self) -> bool {
        !self.is_unknown() && self.total > 0 && self.confidence == 100
    }

    /// Reads an outcome back from a detection result's data.
    pub fn from_result(result: &ScriptResult) -> Option<Self> {
        let count = |key| result.get_int(key).and_then(|v| u32::try_from(v).ok());
        Some(DetectionOutcome::new(
            result.get_str("version")?,
            count("matches")?,
            count("total")?,
        ))
    }

    /// Pairs a certain outcome with its catalog entry.
    pub fn verify(&self, catalog: &FirmwareCatalog) -> Result<VerifiedFirmware, GdbError> {
        if self.is_unknown() {
            return Err(catalog.unsupported(&self.version));
        }
        if !self.is_certain() {
            return Err(GdbError::FirmwareConfidence {
                version: self.version.clone(),
                confidence: self.confidence,
                matches: self.matches,
                total: self.total,
            });
        }
        let firmware = catalog
            .get(&self.version)
            .ok_or_else(|| catalog.unsupported(&self.version))?;
        Ok(VerifiedFirmware {
            firmware: firmware.clone(),
            outcome: self.clone(),
        })
    }
}

fn is_unknown_version(version: &str) -> bool {
    let version = version.trim();
    version.is_empty() || version == "0" || version.eq_ignore_ascii_case(UNKNOWN_VERSION)
}

/// A catalog entry whose signatures all matched the connected device.
/// Operations that call firmware functions can only be built from one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedFirmware {
    firmware: Firmware,
    outcome: DetectionOutcome,
}

impl VerifiedFirmware {
    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    pub fn outcome(&self) -> &DetectionOutcome {
        &self.outcome
    }
}

pub struct DetectFirmware {
    candidates: Vec<Firmware>,
}

impl DetectFirmware {
    pub fn new(candidates: Vec<Firmware>) -> Result<Self, GdbError> {
        if candidates.iter().all(|fw| fw.signature_checks().is_empty()) {
            return Err(GdbError::template(
                "detect_firmware",
                "no firmware candidate has detection signatures",
            ));
        }
        Ok(DetectFirmware { candidates })
    }

    pub fn from_catalog(catalog: &FirmwareCatalog) -> Result<Self, GdbError> {
        Self::new(catalog.list().to_vec())
    }

    fn signature_total(&self, version: &str) -> Option<u32> {
        self.candidates
            .iter()
            .find(|fw| fw.version == version)
            .map(|fw| fw.signature_checks().len() as u32)
    }

    fn default_total(&self) -> u32 {
        self.candidates
            .iter()
            .map(|fw| fw.signature_checks().len() as u32)
            .max()
            .unwrap_or(0)
    }

    /// One block per candidate; the best-matching candidate's ordinal ends up in `$best`.
    fn signature_checks(&self) -> String {
        let mut out = String::new();
        for (ordinal, fw) in self.candidates.iter().enumerate() {
            let checks = fw.signature_checks();
            if checks.is_empty() {
                continue;
            }
            let _ = writeln!(out, "# {fw}");
            out.push_str("set $matches = 0\n");
            for check in &checks {
                let _ = writeln!(
                    out,
                    "if *(unsigned int *){} == {} && *(unsigned int *){} == {}\n  \
                     set $matches = $matches + 1\n  \
                     printf \"  {} @ {}: MATCH\\n\"\n\
                     else\n  \
                     printf \"  {} @ {}: MISMATCH\\n\"\n\
                     end",
                    hex(check.address),
                    hex(check.words[0]),
                    hex(check.address.wrapping_add(4)),
                    hex(check.words[1]),
                    check.function,
                    hex(check.address),
                    check.function,
                    hex(check.address),
                );
            }
            let _ = writeln!(
                out,
                "printf \"CANDIDATE {}: %d/{}\\n\", $matches\n\
                 if $matches > $best_matches\n  \
                 set $best = {}\n  \
                 set $best_matches = $matches\n  \
                 set $best_total = {}\n\
                 end",
                printf_literal(&fw.version),
                checks.len(),
                ordinal + 1,
                checks.len(),
            );
        }
        out
    }

    /// gdb has no string variables, so the winning version is printed by ordinal.
    fn version_report(&self) -> String {
        let mut out = String::from("if $best == 0\n  printf \"DETECTED_VERSION=0\\n\"\nend\n");
        for (ordinal, fw) in self.candidates.iter().enumerate() {
            let _ = writeln!(
                out,
                "if $best == {}\n  printf \"DETECTED_VERSION={}\\n\"\nend",
                ordinal + 1,
                printf_literal(&fw.version)
            );
        }
        out
    }
}

fn printf_literal(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
}

impl Script for DetectFirmware {
    fn name(&self) -> &str {
        "detect_firmware"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn params(&self) -> Params {
        Params::new()
            .with("CandidateCount", self.candidates.len())
            .with("DefaultTotal", self.default_total())
            .with("SignatureChecks", self.signature_checks())
            .with("VersionReport", self.version_report())
    }

    fn parse(&self, output: &str) -> Result<ScriptResult, GdbError> {
        let values = parser::parse_key_values(output);
        let number = |key: &str| values.get(key).and_then(|v| parser::parse_number(v));

        let reported_version = values.get("DETECTED_VERSION");
        let matches = number("MATCHES");
        if reported_version.is_none() && matches.is_none() && number("CONFIDENCE").is_none() {
            parser::detect_errors(output)?;
            return Err(parser::ExtractError::NotFound("DETECTED_VERSION".to_string())
                .into_parse_error(self.name(), output));
        }

        let version = reported_version.map(String::as_str).unwrap_or(UNKNOWN_VERSION);
        let matches = matches.and_then(|m| u32::try_from(m).ok()).unwrap_or(0);
        let total = number("TOTAL")
            .and_then(|t| u32::try_from(t).ok())
            .filter(|&t| t > 0)
            .or_else(|| self.signature_total(version))
            .or_else(|| match number("CONFIDENCE") {
                Some(c) if c > 0 => u32::try_from((i64::from(matches) * 100 + c / 2) / c).ok(),
                _ => None,
            })
            .unwrap_or_else(|| self.default_total());

        let outcome = DetectionOutcome::new(version, matches, total);
        let status = values
            .get("STATUS")
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        let mut result = ScriptResult::new();
        result.set("version", outcome.version.as_str());
        result.set("confidence", outcome.confidence);
        result.set("matches", outcome.matches);
        result.set("total", outcome.total);
        result.set("status", status);

        const STEP: &str = "[1/1] Firmware detection";
        let confidence = outcome.confidence;
        if outcome.is_certain() {
            result.add_step(
                1,
                STEP,
                StepStatus::Success,
                format!("Version: {} ({confidence}% confidence)", outcome.version),
            );
            result.succeed();
        } else if outcome.is_unknown() {
            result.add_step(1, STEP, StepStatus::Failed, "Unknown firmware - no signatures matched");
            result.fail("firmware unknown - no known signatures matched");
        } else {
            let (status, message) = if confidence >= MEDIUM_CONFIDENCE {
                (
                    StepStatus::Success,
                    format!("Version: {} ({confidence}% confidence - medium)", outcome.version),
                )
            } else {
                (
                    StepStatus::Failed,
                    format!("Low confidence: {confidence}% (best match: {})", outcome.version),
                )
            };
            result.add_step(1, STEP, status, message);
            result.fail(format!("firmware confidence too low: {confidence}% (need 100%)"));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template;

    fn detector() -> DetectFirmware {
        DetectFirmware::from_catalog(FirmwareCatalog::load().unwrap()).unwrap()
    }

    fn transcript(version: &str, matches: u32) -> String {
        format!("Checking 1 firmware candidate(s)\nDETECTED_VERSION={version}\nMATCHES={matches}\nTOTAL=7\n")
    }

    #[test]
    fn full_match_is_verified() {
        let result = detector().parse(&transcript("0x355", 7)).unwrap();
        assert!(result.is_success());
        assert_eq!(result.error(), None);
        assert_eq!(result.get_str("version"), Some("0x355"));
        assert_eq!(result.get_int("confidence"), Some(100));
        assert_eq!(result.total_steps(), 1);
        assert!(result.steps[0].message.contains("100%"));
    }

    #[test]
    fn partial_matches_are_not_success() {
        for (matches, confidence) in [(1, 14), (4, 57), (6, 86)] {
            let result = detector().parse(&transcript("0x355", matches)).unwrap();
            assert!(!result.is_success(), "{matches}/7");
            assert_eq!(result.get_int("confidence"), Some(confidence));
            assert!(result.error().unwrap().contains("confidence too low"));
        }
    }

    #[test]
    fn medium_confidence_step_is_not_marked_failed() {
        let result = detector().parse(&transcript("0x355", 6)).unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Success);
        let result = detector().parse(&transcript("0x355", 4)).unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Failed);
    }

    #[test]
    fn no_matches_is_unknown() {
        let result = detector().parse(&transcript("0", 0)).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.get_str("version"), Some(UNKNOWN_VERSION));
        assert_eq!(result.get_int("confidence"), Some(0));
        assert!(result.error().unwrap().contains("unknown"));
    }

    #[test]
    fn zero_version_is_unknown() {
        let outcome = DetectionOutcome::new("0", 3, 7);
        assert!(outcome.is_unknown());
        assert!(!outcome.is_certain());
    }

    #[test]
    fn total_falls_back_to_candidate_signatures() {
        let result = detector()
            .parse("DETECTED_VERSION=0x355\nMATCHES=7\nCONFIDENCE=100\n")
            .unwrap();
        assert_eq!(result.get_int("total"), Some(7));
        assert!(result.is_success());
    }

    #[test]
    fn total_back_calculated_for_unlisted_version() {
        let result = detector()
            .parse("DETECTED_VERSION=0x999\nMATCHES=5\nCONFIDENCE=50\n")
            .unwrap();
        assert_eq!(result.get_int("total"), Some(10));
        assert_eq!(result.get_int("confidence"), Some(50));
    }

    #[test]
    fn transcript_without_summary_is_parse_error() {
        let err = detector().parse("Reading symbols...\n").unwrap_err();
        assert!(matches!(err, GdbError::Parse { .. }));
        let err = detector()
            .parse("localhost:3333: Connection refused.\n")
            .unwrap_err();
        assert!(matches!(err, GdbError::Connection { .. }));
    }

    #[test]
    fn outcome_roundtrips_through_result() {
        let result = detector().parse(&transcript("0x355", 7)).unwrap();
        let outcome = DetectionOutcome::from_result(&result).unwrap();
        assert_eq!(outcome, DetectionOutcome::new("0x355", 7, 7));
    }

    #[test]
    fn only_certain_outcomes_verify() {
        let catalog = FirmwareCatalog::load().unwrap();
        let verified = DetectionOutcome::new("0x355", 7, 7).verify(catalog).unwrap();
        assert_eq!(verified.firmware().version, "0x355");
        assert_eq!(verified.outcome().confidence, 100);

        assert!(matches!(
            DetectionOutcome::new("0x355", 6, 7).verify(catalog),
            Err(GdbError::FirmwareConfidence { confidence: 86, .. })
        ));
        assert!(matches!(
            DetectionOutcome::new("unknown", 0, 7).verify(catalog),
            Err(GdbError::FirmwareUnsupported { .. })
        ));
        assert!(matches!(
            DetectionOutcome::new("0x999", 7, 7).verify(catalog),
            Err(GdbError::FirmwareUnsupported { .. })
        ));
    }

    #[test]
    fn rendered_script_checks_every_signature() {
        let script = detector();
        let rendered = template::render(script.name(), script.template(), &script.params()).unwrap();
        assert_eq!(rendered.matches(": MATCH\\n").count(), 7);
        assert!(rendered.contains("if *(unsigned int *)0x20015c64 == 0x4606b570 && *(unsigned int *)0x20015c68 == 0x78004818"));
        assert!(rendered.contains("printf \"DETECTED_VERSION=0x355\\n\""));
        assert!(rendered.contains("set $best_total = 7"));
        // Host and Port come from the executor.
        assert_eq!(rendered.matches(template::MISSING_VALUE).count(), 4);
    }

    #[test]
    fn candidates_need_signatures() {
        let mut fw = FirmwareCatalog::load().unwrap().get("0x355").unwrap().clone();
        fw.functions.signatures.clear();
        assert!(DetectFirmware::new(vec![fw]).is_err());
        assert!(DetectFirmware::new(vec![]).is_err());
    }
}

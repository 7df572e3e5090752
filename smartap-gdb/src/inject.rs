//! End-to-end certificate injection: check, identify, gate, write.

use std::path::PathBuf;

use log::{debug, error, info};

use crate::{
    certs::{CertFormat, CertificateAuthority},
    context::Context,
    error::GdbError,
    executor::Executor,
    firmware::FirmwareCatalog,
    result::{ScriptResult, Step},
    script::{DetectFirmware, DetectionOutcome, InjectCertificate, VerifiedFirmware, DEFAULT_TARGET_FILE},
};

/// Which certificate to write to the device.
#[derive(Clone, Debug, Default)]
pub enum CertificateSource {
    /// The bundled root CA, in DER form.
    #[default]
    EmbeddedRoot,
    /// A PEM or DER file on the host.
    File(PathBuf),
    /// DER bytes supplied by the caller.
    Der(Vec<u8>),
}

impl CertificateSource {
    pub fn load(&self) -> Result<Vec<u8>, GdbError> {
        match self {
            CertificateSource::EmbeddedRoot => {
                Ok(CertificateAuthority::root_certificate(CertFormat::Der).to_vec())
            }
            CertificateSource::File(path) => CertificateAuthority::load_custom(path),
            CertificateSource::Der(der) => Ok(der.clone()),
        }
    }
}

pub struct InjectOptions<'a> {
    pub certificate: CertificateSource,
    pub target_file: String,
    /// When set, detection must agree with it. It never replaces detection.
    pub expected_version: Option<String>,
    /// Called once per recorded step after the injection script finishes.
    pub on_progress: Option<&'a (dyn Fn(&Step) + Send + Sync)>,
}

impl Default for InjectOptions<'_> {
    fn default() -> Self {
        InjectOptions {
            certificate: CertificateSource::default(),
            target_file: DEFAULT_TARGET_FILE.to_string(),
            expected_version: None,
            on_progress: None,
        }
    }
}

/// Runs detection and returns the firmware only at 100% confidence.
pub async fn identify_firmware(executor: &Executor, ctx: &Context) -> Result<VerifiedFirmware, GdbError> {
    let catalog = FirmwareCatalog::load()?;
    let detection = executor
        .execute(ctx, &DetectFirmware::from_catalog(catalog)?)
        .await?;
    let outcome = DetectionOutcome::from_result(&detection).ok_or_else(|| GdbError::Parse {
        script: "detect_firmware".to_string(),
        field: "version".to_string(),
        reason: "detection result carries no outcome".to_string(),
        output: detection.raw_stdout.clone(),
    })?;

    match outcome.verify(catalog) {
        Ok(verified) => {
            info!(
                "Firmware detected: {} ({}% confidence)",
                verified.firmware(),
                outcome.confidence
            );
            Ok(verified)
        }
        Err(e) => {
            error!(
                "Firmware detection refused: version={} confidence={}% matches={}/{}",
                outcome.version, outcome.confidence, outcome.matches, outcome.total
            );
            Err(e)
        }
    }
}

/// Writes a certificate to the device.
///
/// Errors mean the workflow could not run or was refused before touching
/// flash. A session that ran but failed on the device is returned as a
/// non-success result.
pub async fn inject_certificate(
    executor: &Executor,
    ctx: &Context,
    options: InjectOptions<'_>,
) -> Result<ScriptResult, GdbError> {
    info!(
        "Starting certificate injection into {} ({:?})",
        options.target_file, options.certificate
    );

    debug!("Validating prerequisites");
    executor.validate_config().await?;

    let certificate = options.certificate.load()?;
    info!("Certificate loaded: {} bytes", certificate.len());

    let firmware = identify_firmware(executor, ctx).await?;
    if let Some(expected) = &options.expected_version {
        let detected = &firmware.firmware().version;
        if expected != detected {
            error!("Expected firmware {expected} but detected {detected}");
            return Err(GdbError::FirmwareMismatch {
                expected: expected.clone(),
                detected: detected.clone(),
            });
        }
    }

    let script = InjectCertificate::new(firmware, certificate, options.target_file.as_str())?;
    let result = executor.execute(ctx, &script).await?;

    if let Some(on_progress) = options.on_progress {
        result.steps.iter().for_each(on_progress);
    }

    if result.is_success() {
        info!(
            "Certificate injection completed in {:?}: {} bytes written to {}",
            result.duration,
            result.bytes_written,
            script.target_file()
        );
    } else {
        error!(
            "Certificate injection failed: {} ({}/{} steps succeeded, {} failed)",
            result.error().unwrap_or("unknown error"),
            result.success_steps(),
            result.total_steps(),
            result.failed_steps()
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_options_target_root_ca_slot() {
        let options = InjectOptions::default();
        assert_eq!(options.target_file, "/cert/129.der");
        assert!(matches!(options.certificate, CertificateSource::EmbeddedRoot));
        assert!(options.expected_version.is_none());
    }

    #[test]
    fn certificate_sources() {
        let root = CertificateSource::EmbeddedRoot.load().unwrap();
        assert_eq!(root.len(), 989);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CertificateAuthority::root_certificate(CertFormat::Pem))
            .unwrap();
        assert_eq!(
            CertificateSource::File(file.path().to_path_buf()).load().unwrap(),
            root
        );
        assert_eq!(CertificateSource::Der(vec![1, 2]).load().unwrap(), vec![1, 2]);
        assert!(CertificateSource::File("/nonexistent.pem".into()).load().is_err());
    }
}

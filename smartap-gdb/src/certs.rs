//! The embedded root CA and the server certificates it issues.
//!
//! The device only accepts a narrow certificate profile: RSA keys of exactly
//! 2048 bits, SHA-256 with RSA signatures, key usage of digital signature and
//! key encipherment, and server authentication in the extended key usage.
//! [`CertificateAuthority::validate`] checks that profile on any DER input.

use std::{fs, path::Path};

use log::debug;
use rand::RngCore;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::{
    pkcs1::EncodeRsaPrivateKey,
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::{Duration, OffsetDateTime};
use x509_parser::{
    certificate::X509Certificate,
    oid_registry::{OID_PKCS1_RSAENCRYPTION, OID_PKCS1_SHA256WITHRSA},
    pem::parse_x509_pem,
    prelude::FromDer,
    public_key::PublicKey,
};

use crate::error::GdbError;

const ROOT_CERT_DER: &[u8] = include_bytes!("../assets/certs/ca-root-cert.der");
const ROOT_CERT_PEM: &str = include_str!("../assets/certs/ca-root-cert.pem");
const ROOT_KEY_PEM: &str = include_str!("../assets/certs/ca-root-key.pem");

pub const RSA_KEY_BITS: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CertFormat {
    Der,
    Pem,
}

/// Subject and lifetime of an issued server certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertParams {
    pub common_name: String,
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub sans: Vec<String>,
    pub valid_days: u32,
}

impl Default for CertParams {
    /// The identity the device expects its cloud endpoint to present.
    fn default() -> Self {
        CertParams {
            common_name: "*.smartap-tech.com".to_string(),
            country: "GB".to_string(),
            state: "England".to_string(),
            locality: "London".to_string(),
            organization: "Smartap Revival Project".to_string(),
            sans: vec![
                "*.smartap-tech.com".to_string(),
                "smartap-tech.com".to_string(),
                "eValve.smartap-tech.com".to_string(),
            ],
            valid_days: 730,
        }
    }
}

/// A freshly issued server certificate and its private key.
#[derive(Clone, Debug)]
pub struct CertificateBundle {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    /// PKCS#1 (`RSA PRIVATE KEY`) encoding.
    pub key_pem: String,
}

impl CertificateBundle {
    pub fn parsed(&self) -> Result<X509Certificate<'_>, GdbError> {
        parse_der(&self.cert_der, "parse_certificate")
    }
}

/// Fields of a certificate that passed profile validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub key_bits: usize,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

pub struct CertificateAuthority {
    issuer: Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    /// The root CA bundled with the crate.
    pub fn embedded() -> Result<Self, GdbError> {
        Self::from_pem(ROOT_CERT_PEM, ROOT_KEY_PEM)
    }

    /// Builds an authority from a CA certificate and its PKCS#8 key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, GdbError> {
        let key = KeyPair::from_pem_and_sign_algo(key_pem, &PKCS_RSA_SHA256)
            .map_err(|e| GdbError::certificate("load_root_key", e))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| GdbError::certificate("load_root_cert", e))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| GdbError::certificate("load_root_cert", e))?;
        Ok(CertificateAuthority { issuer, key })
    }

    /// The embedded root certificate, byte-for-byte as bundled.
    pub fn root_certificate(format: CertFormat) -> &'static [u8] {
        match format {
            CertFormat::Der => ROOT_CERT_DER,
            CertFormat::Pem => ROOT_CERT_PEM.as_bytes(),
        }
    }

    pub fn root_key_pem() -> &'static str {
        ROOT_KEY_PEM
    }

    /// Issues a server certificate signed by this authority.
    pub fn issue_server_certificate(&self, params: &CertParams) -> Result<CertificateBundle, GdbError> {
        debug!("Generating {RSA_KEY_BITS}-bit RSA key for {}", params.common_name);
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|e| GdbError::certificate("generate_key", e))?;
        let pkcs8 = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| GdbError::certificate("generate_key", e))?;
        let leaf_key = KeyPair::from_pem_and_sign_algo(pkcs8.as_str(), &PKCS_RSA_SHA256)
            .map_err(|e| GdbError::certificate("generate_key", e))?;

        let mut cert_params = CertificateParams::new(params.sans.clone())
            .map_err(|e| GdbError::certificate("create_certificate", e))?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CountryName, params.country.as_str());
        name.push(DnType::StateOrProvinceName, params.state.as_str());
        name.push(DnType::LocalityName, params.locality.as_str());
        name.push(DnType::OrganizationName, params.organization.as_str());
        name.push(DnType::CommonName, params.common_name.as_str());
        cert_params.distinguished_name = name;
        cert_params.is_ca = IsCa::ExplicitNoCa;
        cert_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        cert_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        cert_params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        cert_params.not_before = now;
        cert_params.not_after = now + Duration::days(params.valid_days.into());

        let cert = cert_params
            .signed_by(&leaf_key, &self.issuer, &self.key)
            .map_err(|e| GdbError::certificate("create_certificate", e))?;
        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| GdbError::certificate("encode_key", e))?;

        Ok(CertificateBundle {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Checks `der` against the profile the device accepts.
    pub fn validate(der: &[u8]) -> Result<CertificateSummary, GdbError> {
        let cert = parse_der(der, "validate")?;
        let invalid = |reason: String| GdbError::certificate("validate", reason);

        let spki = cert.public_key();
        if spki.algorithm.algorithm != OID_PKCS1_RSAENCRYPTION {
            return Err(invalid(format!(
                "certificate must use RSA keys, got {}",
                spki.algorithm.algorithm
            )));
        }
        let key_bits = match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => modulus_bits(rsa.modulus),
            Ok(_) => return Err(invalid("public key is not RSA".to_string())),
            Err(e) => return Err(invalid(format!("unreadable public key: {e}"))),
        };
        if key_bits != RSA_KEY_BITS {
            return Err(invalid(format!(
                "certificate must use {RSA_KEY_BITS}-bit RSA key, got {key_bits} bits"
            )));
        }

        if cert.signature_algorithm.algorithm != OID_PKCS1_SHA256WITHRSA {
            return Err(invalid(format!(
                "certificate must use SHA256WithRSA signature, got {}",
                cert.signature_algorithm.algorithm
            )));
        }

        let key_usage = cert
            .key_usage()
            .map_err(|e| invalid(format!("bad key usage extension: {e}")))?;
        match key_usage {
            Some(ku) if ku.value.digital_signature() && ku.value.key_encipherment() => {}
            _ => {
                return Err(invalid(
                    "certificate must have DigitalSignature and KeyEncipherment key usage".to_string(),
                ))
            }
        }

        let ext_usage = cert
            .extended_key_usage()
            .map_err(|e| invalid(format!("bad extended key usage extension: {e}")))?;
        if !ext_usage.is_some_and(|eku| eku.value.server_auth) {
            return Err(invalid("certificate must have ServerAuth extended key usage".to_string()));
        }

        Ok(CertificateSummary {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            key_bits,
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
        })
    }

    /// Reads a certificate file in PEM or DER form and returns DER.
    pub fn load_custom(path: &Path) -> Result<Vec<u8>, GdbError> {
        let data = fs::read(path).map_err(|e| {
            GdbError::certificate("load", format!("{}: {e}", path.display()))
        })?;
        Ok(to_der(data))
    }
}

/// PEM input is decoded; anything else is assumed to already be DER.
pub fn to_der(data: Vec<u8>) -> Vec<u8> {
    match parse_x509_pem(&data) {
        Ok((_, pem)) => pem.contents,
        Err(_) => data,
    }
}

fn parse_der<'a>(der: &'a [u8], operation: &str) -> Result<X509Certificate<'a>, GdbError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| GdbError::certificate(operation, format!("failed to parse certificate: {e}")))
}

/// Positive 128-bit serial.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

fn modulus_bits(modulus: &[u8]) -> usize {
    let trimmed = match modulus.iter().position(|&b| b != 0) {
        Some(start) => &modulus[start..],
        None => return 0,
    };
    (trimmed.len() - 1) * 8 + (8 - trimmed[0].leading_zeros() as usize)
}

//! Public key certificates
//!
//! Decodes the PEM blocks served by the x509 metadata endpoint into the subset
//! of certificate attributes the signal checks look at. The raw DER is kept so
//! certificates can be written back out byte-for-byte.

use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{ExtendedKeyUsage, ParsedExtension};
use x509_parser::public_key::PublicKey;
use x509_parser::x509::X509Name;

/// The only PEM block type accepted from the metadata endpoint
pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_END: &str = "-----END ";
const PEM_DASHES: &str = "-----";

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_DSA: &str = "1.2.840.10040.4.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_SHA1_WITH_RSA: &str = "1.2.840.113549.1.1.5";
const OID_SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const OID_SHA384_WITH_RSA: &str = "1.2.840.113549.1.1.12";
const OID_SHA512_WITH_RSA: &str = "1.2.840.113549.1.1.13";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";
const OID_ECDSA_WITH_SHA512: &str = "1.2.840.10045.4.3.4";

/// Errors decoding a single certificate
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("error decoding PEM block: {0}")]
    MalformedPem(String),

    #[error("extra data after PEM block")]
    TrailingData,

    #[error("unexpected PEM block type: {0}. Expected CERTIFICATE")]
    WrongBlockType(String),

    #[error("unexpected headers in PEM block: {0}")]
    UnexpectedHeaders(String),

    #[error("error parsing certificate: {0}")]
    ParseFailure(String),
}

/// Subject public key algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyAlgorithm {
    Rsa,
    Ecdsa,
    Dsa,
    Ed25519,
    Unknown(String),
}

impl PublicKeyAlgorithm {
    fn from_oid(oid: &str) -> Self {
        match oid {
            OID_RSA_ENCRYPTION => Self::Rsa,
            OID_EC_PUBLIC_KEY => Self::Ecdsa,
            OID_DSA => Self::Dsa,
            OID_ED25519 => Self::Ed25519,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for PublicKeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicKeyAlgorithm::Rsa => write!(f, "RSA"),
            PublicKeyAlgorithm::Ecdsa => write!(f, "ECDSA"),
            PublicKeyAlgorithm::Dsa => write!(f, "DSA"),
            PublicKeyAlgorithm::Ed25519 => write!(f, "Ed25519"),
            PublicKeyAlgorithm::Unknown(oid) => write!(f, "unknown ({})", oid),
        }
    }
}

/// Certificate signature algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
    Ed25519,
    Unknown(String),
}

impl SignatureAlgorithm {
    fn from_oid(oid: &str) -> Self {
        match oid {
            OID_SHA1_WITH_RSA => Self::Sha1WithRsa,
            OID_SHA256_WITH_RSA => Self::Sha256WithRsa,
            OID_SHA384_WITH_RSA => Self::Sha384WithRsa,
            OID_SHA512_WITH_RSA => Self::Sha512WithRsa,
            OID_ECDSA_WITH_SHA256 => Self::EcdsaWithSha256,
            OID_ECDSA_WITH_SHA384 => Self::EcdsaWithSha384,
            OID_ECDSA_WITH_SHA512 => Self::EcdsaWithSha512,
            OID_ED25519 => Self::Ed25519,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureAlgorithm::Sha1WithRsa => write!(f, "SHA1-RSA"),
            SignatureAlgorithm::Sha256WithRsa => write!(f, "SHA256-RSA"),
            SignatureAlgorithm::Sha384WithRsa => write!(f, "SHA384-RSA"),
            SignatureAlgorithm::Sha512WithRsa => write!(f, "SHA512-RSA"),
            SignatureAlgorithm::EcdsaWithSha256 => write!(f, "ECDSA-SHA256"),
            SignatureAlgorithm::EcdsaWithSha384 => write!(f, "ECDSA-SHA384"),
            SignatureAlgorithm::EcdsaWithSha512 => write!(f, "ECDSA-SHA512"),
            SignatureAlgorithm::Ed25519 => write!(f, "Ed25519"),
            SignatureAlgorithm::Unknown(oid) => write!(f, "unknown ({})", oid),
        }
    }
}

/// KeyUsage extension bits, in RFC 5280 order. Zero when the extension is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyUsage(pub u16);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: KeyUsage = KeyUsage(1 << 0);
    pub const CONTENT_COMMITMENT: KeyUsage = KeyUsage(1 << 1);
    pub const KEY_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 2);
    pub const DATA_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 3);
    pub const KEY_AGREEMENT: KeyUsage = KeyUsage(1 << 4);
    pub const KEY_CERT_SIGN: KeyUsage = KeyUsage(1 << 5);
    pub const CRL_SIGN: KeyUsage = KeyUsage(1 << 6);
    pub const ENCIPHER_ONLY: KeyUsage = KeyUsage(1 << 7);
    pub const DECIPHER_ONLY: KeyUsage = KeyUsage(1 << 8);

    const NAMES: [&'static str; 9] = [
        "digitalSignature",
        "contentCommitment",
        "keyEncipherment",
        "dataEncipherment",
        "keyAgreement",
        "keyCertSign",
        "cRLSign",
        "encipherOnly",
        "decipherOnly",
    ];

    pub fn union(self, other: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | other.0)
    }
}

impl std::fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}]", names.join(", "))
        }
    }
}

/// Extended key usage purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtKeyUsage {
    Any,
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    Other(String),
}

impl std::fmt::Display for ExtKeyUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtKeyUsage::Any => write!(f, "any"),
            ExtKeyUsage::ServerAuth => write!(f, "serverAuth"),
            ExtKeyUsage::ClientAuth => write!(f, "clientAuth"),
            ExtKeyUsage::CodeSigning => write!(f, "codeSigning"),
            ExtKeyUsage::EmailProtection => write!(f, "emailProtection"),
            ExtKeyUsage::TimeStamping => write!(f, "timeStamping"),
            ExtKeyUsage::OcspSigning => write!(f, "ocspSigning"),
            ExtKeyUsage::Other(oid) => write!(f, "{}", oid),
        }
    }
}

/// The attributes of a parsed certificate used for classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER encoding exactly as received
    pub raw: Vec<u8>,
    /// Serial number in decimal
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Subject common name, empty if absent
    pub subject_cn: String,
    /// Issuer common name, empty if absent
    pub issuer_cn: String,
    pub public_key_algorithm: PublicKeyAlgorithm,
    /// Modulus length in bits; only set for RSA keys that parsed cleanly
    pub rsa_modulus_bits: Option<usize>,
    pub signature_algorithm: SignatureAlgorithm,
    pub key_usage: KeyUsage,
    pub ext_key_usage: Vec<ExtKeyUsage>,
}

impl Certificate {
    /// Decode a single PEM `CERTIFICATE` block and parse it
    pub fn from_pem(input: &str) -> Result<Self, CertificateError> {
        let der = decode_pem_block(input)?;
        Self::from_der(&der)
    }

    /// Parse a DER encoded X.509 certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (rest, cert): (&[u8], X509Certificate<'_>) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CertificateError::ParseFailure(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CertificateError::ParseFailure(format!(
                "{} bytes of trailing data after certificate",
                rest.len()
            )));
        }

        let not_before = to_utc(cert.validity().not_before.timestamp())?;
        let not_after = to_utc(cert.validity().not_after.timestamp())?;

        let spki = cert.public_key();
        let public_key_algorithm =
            PublicKeyAlgorithm::from_oid(&spki.algorithm.algorithm.to_id_string());
        // None for an RSA key means its modulus could not be read
        let rsa_modulus_bits = match (&public_key_algorithm, spki.parsed()) {
            (PublicKeyAlgorithm::Rsa, Ok(PublicKey::RSA(rsa))) => Some(modulus_bits(rsa.modulus)),
            _ => None,
        };

        let mut key_usage = KeyUsage::default();
        let mut ext_key_usage = Vec::new();
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::KeyUsage(ku) => key_usage = KeyUsage(ku.flags),
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    ext_key_usage.extend(collect_ext_key_usage(eku));
                }
                _ => {}
            }
        }

        Ok(Self {
            raw: der.to_vec(),
            serial_number: cert.tbs_certificate.serial.to_string(),
            not_before,
            not_after,
            subject_cn: common_name(cert.subject()),
            issuer_cn: common_name(cert.issuer()),
            public_key_algorithm,
            rsa_modulus_bits,
            signature_algorithm: SignatureAlgorithm::from_oid(
                &cert.signature_algorithm.algorithm.to_id_string(),
            ),
            key_usage,
            ext_key_usage,
        })
    }

    /// Re-encode the raw DER as a PEM `CERTIFICATE` block
    pub fn to_pem(&self) -> String {
        let block = Pem::new(CERTIFICATE_TAG, self.raw.clone());
        pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
    }

    /// Validity window in whole seconds
    pub fn validity_secs(&self) -> i64 {
        self.not_after.timestamp() - self.not_before.timestamp()
    }
}

/// Decode exactly one PEM block of type `CERTIFICATE` without headers.
///
/// Anything after the END line (other than its line terminator) is rejected.
pub fn decode_pem_block(input: &str) -> Result<Vec<u8>, CertificateError> {
    let start = input
        .find(PEM_BEGIN)
        .ok_or_else(|| CertificateError::MalformedPem("no PEM block found".to_string()))?;
    let end_marker = input[start..]
        .find(PEM_END)
        .map(|i| start + i)
        .ok_or_else(|| CertificateError::MalformedPem("missing END line".to_string()))?;
    let label_start = end_marker + PEM_END.len();
    let block_end = input[label_start..]
        .find(PEM_DASHES)
        .map(|i| label_start + i + PEM_DASHES.len())
        .ok_or_else(|| CertificateError::MalformedPem("unterminated END line".to_string()))?;

    let block = pem::parse(&input[start..block_end])
        .map_err(|e| CertificateError::MalformedPem(e.to_string()))?;

    let tail = &input[block_end..];
    let tail = tail
        .strip_prefix("\r\n")
        .or_else(|| tail.strip_prefix('\n'))
        .unwrap_or(tail);
    if !tail.is_empty() {
        return Err(CertificateError::TrailingData);
    }

    if block.tag() != CERTIFICATE_TAG {
        return Err(CertificateError::WrongBlockType(block.tag().to_string()));
    }

    let headers: Vec<String> = block
        .headers()
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect();
    if !headers.is_empty() {
        return Err(CertificateError::UnexpectedHeaders(headers.join(", ")));
    }

    Ok(block.into_contents())
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
        CertificateError::ParseFailure(format!("validity timestamp {} out of range", timestamp))
    })
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn collect_ext_key_usage(eku: &ExtendedKeyUsage<'_>) -> Vec<ExtKeyUsage> {
    let mut usages = Vec::new();
    if eku.any {
        usages.push(ExtKeyUsage::Any);
    }
    if eku.server_auth {
        usages.push(ExtKeyUsage::ServerAuth);
    }
    if eku.client_auth {
        usages.push(ExtKeyUsage::ClientAuth);
    }
    if eku.code_signing {
        usages.push(ExtKeyUsage::CodeSigning);
    }
    if eku.email_protection {
        usages.push(ExtKeyUsage::EmailProtection);
    }
    if eku.time_stamping {
        usages.push(ExtKeyUsage::TimeStamping);
    }
    if eku.ocsp_signing {
        usages.push(ExtKeyUsage::OcspSigning);
    }
    usages.extend(eku.other.iter().map(|oid| ExtKeyUsage::Other(oid.to_id_string())));
    usages
}

/// Bit length of a big-endian modulus, ignoring leading zero bytes
fn modulus_bits(modulus: &[u8]) -> usize {
    let significant: &[u8] = match modulus.iter().position(|b| *b != 0) {
        Some(i) => &modulus[i..],
        None => return 0,
    };
    (significant.len() - 1) * 8 + (8 - significant[0].leading_zeros() as usize)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use rcgen::{
        CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
        SerialNumber,
    };

    /// Self-signed ECDSA P-256 certificate shaped like a platform key
    pub fn generate_test_cert_pem(common_name: &str) -> String {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2026, 1, 1);
        params.serial_number = Some(SerialNumber::from(vec![0x2a]));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let key_pair = KeyPair::generate().expect("key generation should succeed");
        params
            .self_signed(&key_pair)
            .expect("self-signing should succeed")
            .pem()
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::generate_test_cert_pem;
    use super::*;

    const SA: &str = "builder.example-project.iam.gserviceaccount.com";

    #[test]
    fn test_parse_generated_certificate() {
        let cert = Certificate::from_pem(&generate_test_cert_pem(SA)).unwrap();

        assert_eq!(cert.subject_cn, SA);
        assert_eq!(cert.issuer_cn, SA);
        assert_eq!(cert.serial_number, "42");
        assert_eq!(cert.public_key_algorithm, PublicKeyAlgorithm::Ecdsa);
        assert_eq!(cert.rsa_modulus_bits, None);
        assert_eq!(cert.signature_algorithm, SignatureAlgorithm::EcdsaWithSha256);
        assert_eq!(cert.key_usage, KeyUsage::DIGITAL_SIGNATURE);
        assert_eq!(cert.ext_key_usage, vec![ExtKeyUsage::ClientAuth]);
        assert_eq!(cert.not_before.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(cert.validity_secs(), 731 * 24 * 3600);
    }

    #[test]
    fn test_pem_round_trip_keeps_raw_bytes() {
        let cert = Certificate::from_pem(&generate_test_cert_pem(SA)).unwrap();
        let reparsed = Certificate::from_pem(&cert.to_pem()).unwrap();
        assert_eq!(reparsed.raw, cert.raw);
    }

    #[test]
    fn test_crlf_terminator_is_accepted() {
        let pem = generate_test_cert_pem(SA).replace('\n', "\r\n");
        assert!(Certificate::from_pem(&pem).is_ok());
    }

    #[test]
    fn test_empty_input_is_malformed() {
        assert!(matches!(
            decode_pem_block(""),
            Err(CertificateError::MalformedPem(_))
        ));
        assert!(matches!(
            decode_pem_block("not a certificate"),
            Err(CertificateError::MalformedPem(_))
        ));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let pem = format!("{}garbage", generate_test_cert_pem(SA));
        assert!(matches!(
            decode_pem_block(&pem),
            Err(CertificateError::TrailingData)
        ));

        let two_blocks = format!("{}{}", generate_test_cert_pem(SA), generate_test_cert_pem(SA));
        assert!(matches!(
            decode_pem_block(&two_blocks),
            Err(CertificateError::TrailingData)
        ));
    }

    #[test]
    fn test_wrong_block_type_rejected() {
        let pem = generate_test_cert_pem(SA).replace("CERTIFICATE", "PUBLIC KEY");
        match decode_pem_block(&pem) {
            Err(CertificateError::WrongBlockType(tag)) => assert_eq!(tag, "PUBLIC KEY"),
            other => panic!("expected WrongBlockType, got {:?}", other),
        }
    }

    #[test]
    fn test_headers_rejected() {
        let pem = generate_test_cert_pem(SA).replacen(
            "-----BEGIN CERTIFICATE-----\n",
            "-----BEGIN CERTIFICATE-----\nProc-Type: 4,ENCRYPTED\nDEK-Info: AES-128-CBC,00\n\n",
            1,
        );
        assert!(matches!(
            decode_pem_block(&pem),
            Err(CertificateError::UnexpectedHeaders(_))
        ));
    }

    #[test]
    fn test_non_certificate_der_fails_to_parse() {
        let pem = pem::encode(&Pem::new(CERTIFICATE_TAG, vec![0x30, 0x03, 0x02, 0x01, 0x01]));
        assert!(matches!(
            Certificate::from_pem(&pem),
            Err(CertificateError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_rsa_key_without_modulus_still_parses() {
        // Swap the EC algorithm identifier for rsaEncryption, keeping the EC point
        const EC_ALGORITHM: [u8; 21] = [
            0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
            0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
        ];
        const RSA_ALGORITHM: [u8; 21] = [
            0x30, 0x13, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x04,
            0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let mut der = decode_pem_block(&generate_test_cert_pem(SA)).unwrap();
        let at = der
            .windows(EC_ALGORITHM.len())
            .position(|w| w == EC_ALGORITHM)
            .expect("EC algorithm identifier");
        der[at..at + RSA_ALGORITHM.len()].copy_from_slice(&RSA_ALGORITHM);

        let cert = Certificate::from_der(&der).unwrap();
        assert_eq!(cert.public_key_algorithm, PublicKeyAlgorithm::Rsa);
        assert_eq!(cert.rsa_modulus_bits, None);
    }

    #[test]
    fn test_modulus_bits() {
        assert_eq!(modulus_bits(&[]), 0);
        assert_eq!(modulus_bits(&[0x00, 0x80]), 8);
        assert_eq!(modulus_bits(&[0x01, 0x00]), 9);

        let mut rsa_2048 = vec![0x00];
        rsa_2048.extend(std::iter::repeat(0xff).take(256));
        assert_eq!(modulus_bits(&rsa_2048), 2048);
    }

    #[test]
    fn test_key_usage_display() {
        let usage = KeyUsage::DIGITAL_SIGNATURE.union(KeyUsage::KEY_ENCIPHERMENT);
        assert_eq!(usage.to_string(), "[digitalSignature, keyEncipherment]");
        assert_eq!(KeyUsage::default().to_string(), "[]");
    }
}
